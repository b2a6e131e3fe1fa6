use escrow_oracle::{
    config::Storage,
    scheduler::TaskScheduler,
    storage::{self, CF_HANDLED_TX},
    tracker::HandledTransaction,
};

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "./oracle_data".to_string());
    println!("🔍 Inspecting oracle database at {path}");

    let db = storage::open(&Storage { path: path.clone() })?;
    let stats = db.get_stats()?;

    println!("\n📈 Tables:");
    println!("   tasks:            {}", stats.task_count);
    println!("   pending tasks:    {}", stats.pending_count);
    println!("   used inputs:      {}", stats.used_input_count);
    println!("   handled groups:   {}", stats.handled_count);
    println!("   signed txs:       {}", stats.signed_count);

    let scheduler = TaskScheduler::new(db.clone());
    if let Some(next) = scheduler.ready_tasks(u64::MAX)?.into_iter().next() {
        println!("\n⏳ Earliest pending task: #{} at {} ({})", next.id, next.next_check, next.filter_field);
    }

    let handled: Vec<HandledTransaction> = db.values(CF_HANDLED_TX)?;
    if !handled.is_empty() {
        println!("\n✍️  Highest signature counts:");
        for h in handled {
            println!("   {}  {}", h.max_signatures_seen, h.request_group_key);
        }
    }

    // Show database storage info
    println!("\n🗄️ Database Storage Info:");
    if let Ok(entries) = std::fs::read_dir(&path) {
        let mut sst_files = 0;
        let mut log_files = 0;
        let mut total_size = 0u64;
        for entry in entries.flatten() {
            let p = entry.path();
            match p.extension().and_then(|e| e.to_str()) {
                Some("sst") => sst_files += 1,
                Some("log") => log_files += 1,
                _ => {}
            }
            if let Ok(meta) = entry.metadata() {
                total_size += meta.len();
            }
        }
        println!("   SST files: {sst_files}");
        println!("   Log files: {log_files}");
        println!("   Total size: {:.2} MB", total_size as f64 / 1024.0 / 1024.0);
    }

    db.close()
}
