use clap::{Parser, Subcommand};
use escrow_oracle::{
    condition::BasicEvaluator,
    config::{self, OracleSettings},
    metrics::{self, Metrics},
    network,
    oracle::{self, LoopSettings, Oracle},
    rpc::{BitcoinRpc, BitcoindClient, RetryingRpc},
    scheduler::TaskScheduler,
    signer::SignedTransactionLog,
    storage,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Escrow oracle node: conditional co-signer for Bitcoin multisig")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine network gossip logs
    #[arg(long, default_value_t = false)]
    quiet_net: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the oracle node (default)
    Run,
    /// Print the local libp2p peer ID and exit
    PeerId,
    /// Print the fee address this oracle expects to be paid at
    Address,
    /// List pending tasks
    Tasks {
        /// Include tasks that are already done
        #[arg(long)]
        all: bool,
    },
    /// List every transaction this node has signed
    Signed,
}

fn init_tracing(quiet_net: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if quiet_net {
        if let Ok(directive) = "escrow_oracle::network=warn".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    // Try the CLI path, then config.toml next to the executable, else the embedded default
    let e1 = match config::load(path) {
        Ok(c) => return Ok(c),
        Err(e) => e,
    };
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()));
    let e2 = match exe_dir.map(|dir| config::load(dir.join("config.toml"))) {
        Some(Ok(c)) => return Ok(c),
        Some(Err(e)) => Some(e),
        None => None,
    };
    warn!(path, error = %e1, exe_dir_error = ?e2.as_ref().map(|e| e.to_string()), "falling back to embedded config");
    const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
    config::load_from_str(EMBEDDED_CONFIG)
        .map_err(|e3| anyhow::anyhow!("failed to load configuration: {} / {}", e1, e3))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet_net);

    let mut cfg = load_config(&cli.config)?;

    // Relative storage paths live under ~/.escrow-oracle
    if std::path::Path::new(&cfg.storage.path).is_relative() {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        let abs = std::path::Path::new(&home)
            .join(".escrow-oracle")
            .join(&cfg.storage.path);
        cfg.storage.path = abs.to_string_lossy().into_owned();
    }

    if let Some(Cmd::PeerId) = &cli.cmd {
        println!("{}", network::peer_id_string(&cfg.storage.path)?);
        return Ok(());
    }

    let db = storage::open(&cfg.storage)?;
    info!(path = %cfg.storage.path, "database opened");

    match &cli.cmd {
        Some(Cmd::Tasks { all }) => {
            let scheduler = TaskScheduler::new(db.clone());
            for task in scheduler.get_all_tasks()?.into_iter().filter(|t| *all || !t.done) {
                println!(
                    "{:>6}  {:<7}  next_check={:<11}  {}",
                    task.id,
                    if task.done { "done" } else { "pending" },
                    task.next_check,
                    task.filter_field
                );
            }
            println!("pending: {}", scheduler.pending_count()?);
            return Ok(());
        }
        Some(Cmd::Signed) => {
            for record in SignedTransactionLog::new(db.clone()).all()? {
                println!("{}  {}", record.signed_at, record.hex_transaction);
            }
            return Ok(());
        }
        _ => {}
    }

    let rpc: Arc<dyn BitcoinRpc> = Arc::new(RetryingRpc::from_config(
        BitcoindClient::new(&cfg.bitcoind)?,
        &cfg.bitcoind,
    ));
    let address = oracle::resolve_address(cfg.oracle.address.as_deref(), &db, rpc.as_ref()).await?;

    if let Some(Cmd::Address) = &cli.cmd {
        println!("{address}");
        return Ok(());
    }

    info!(%address, fee_minimum = cfg.oracle.fee_minimum, "oracle fee address");
    let settings = OracleSettings::from_config(&cfg.oracle, address);

    let metrics = Arc::new(Metrics::new()?);
    if cfg.metrics.enabled {
        metrics::serve(&cfg.metrics, metrics.clone())?;
    }

    let messenger = Arc::new(network::spawn(cfg.net.clone(), &cfg.storage.path).await?);

    let mut node = Oracle::new(
        db.clone(),
        rpc,
        messenger,
        Arc::new(BasicEvaluator),
        settings,
        LoopSettings::from_config(&cfg.oracle),
        metrics,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_rx = shutdown_tx.subscribe();
    let mut loop_handle = tokio::spawn(async move { node.run(shutdown_rx).await });

    let finished = tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(err) = res {
                error!(error = %err, "error waiting for shutdown signal");
            }
            info!("shutdown signal received, waiting for the loop to finish");
            let _ = shutdown_tx.send(());
            loop_handle.await
        }
        res = &mut loop_handle => res,
    };

    let outcome = match finished {
        Ok(res) => res.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::anyhow!("oracle loop task panicked: {e}")),
    };
    db.close()?;
    info!("shutdown complete");
    outcome
}
