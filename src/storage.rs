use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Serialize, de::DeserializeOwned};
use anyhow::{Result, Context};
use std::sync::{Arc, Mutex};

// Using bincode for fast, compact binary serialization of every record.

pub const CF_META: &str = "meta";
pub const CF_TASK: &str = "task";
/// next_check (BE) || task id (BE) for every pending task.
pub const CF_TASK_PENDING: &str = "task_pending";
/// filter_field || 0x00 || task id (BE) for every task.
pub const CF_TASK_GROUP: &str = "task_group";
pub const CF_USED_INPUT: &str = "used_input";
pub const CF_HANDLED_TX: &str = "handled_tx";
pub const CF_SIGNED_TX: &str = "signed_tx";
pub const CF_REQUEST: &str = "request";

const CF_NAMES: [&str; 9] = [
    "default",
    CF_META,
    CF_TASK,
    CF_TASK_PENDING,
    CF_TASK_GROUP,
    CF_USED_INPUT,
    CF_HANDLED_TX,
    CF_SIGNED_TX,
    CF_REQUEST,
];

pub struct Store {
    pub db: DB,
    path: String,
    seq_lock: Mutex<()>,
}

impl Store {
    /// Perform database health check
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> Result<Self> {
        let db_path = base_path.to_string();

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path).ok();
        std::fs::create_dir_all(&wal_dir).ok();
        db_opts.set_wal_dir(&wal_dir);

        // Batches are synced explicitly in write_batch
        db_opts.set_use_fsync(false);
        db_opts.set_bytes_per_sync(1024 * 1024);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_keep_log_file_num(10);
        db_opts.set_max_open_files(256);

        let db = DB::open_cf_descriptors(&db_opts, &db_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let store = Store { db, path: db_path, seq_lock: Mutex::new(()) };
        store.health_check().with_context(|| "Database health check failed during initialization")?;
        tracing::debug!(path = %store.path, "database opened");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handle(&self, cf: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        let handle = self.handle(cf)?;
        self.db
            .put_cf_opt(handle, key, &data, &WriteOptions::default())
            .with_context(|| format!("Failed to PUT to database for key '{key:?}' in CF '{cf}'"))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .with_context(|| format!("Failed to deserialize value for key '{key:?}' in CF '{cf}'")),
            None => Ok(None),
        }
    }

    /// Fetch raw bytes without attempting to deserialize
    pub fn get_raw_bytes(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.handle(cf)?;
        Ok(self.db.get_cf(handle, key)?.map(|v| v.to_vec()))
    }

    /// Stage a serialized put into `batch`.
    pub fn batch_put<T: Serialize>(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        batch.put_cf(self.handle(cf)?, key, data);
        Ok(())
    }

    pub fn batch_put_raw(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        batch.put_cf(self.handle(cf)?, key, value);
        Ok(())
    }

    pub fn batch_delete(&self, batch: &mut WriteBatch, cf: &str, key: &[u8]) -> Result<()> {
        batch.delete_cf(self.handle(cf)?, key);
        Ok(())
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    /// All (key, value) pairs of a column family whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward)) {
            let (k, v) = item?;
            if !k.starts_with(prefix) { break; }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    /// Iterate keys in order, stopping as soon as `visit` returns false.
    pub fn scan_keys_while<F>(&self, cf: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        let handle = self.handle(cf)?;
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (k, _v) = item?;
            if !visit(&k)? { break; }
        }
        Ok(())
    }

    /// Decode every value of a column family.
    pub fn values<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            let decoded = bincode::deserialize(&value)
                .with_context(|| format!("Corrupt record '{key:?}' in CF '{cf}'"))?;
            out.push(decoded);
        }
        Ok(out)
    }

    pub fn count(&self, cf: &str) -> Result<u64> {
        let handle = self.handle(cf)?;
        Ok(self.db.iterator_cf(handle, IteratorMode::Start).count() as u64)
    }

    /// Next value of a persistent monotonic counter stored under `meta/<name>`.
    pub fn next_sequence(&self, name: &str) -> Result<u64> {
        let _guard = self.seq_lock.lock().map_err(|_| anyhow::anyhow!("sequence lock poisoned"))?;
        let key = format!("seq:{name}");
        let next = self.get::<u64>(CF_META, key.as_bytes())?.unwrap_or(0) + 1;
        self.put(CF_META, key.as_bytes(), &next)?;
        Ok(next)
    }

    /// Force flush all memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        if let Err(e) = self.db.flush_wal(true) {
            tracing::warn!("WAL flush failed (non-critical): {e}");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            task_count: self.count(CF_TASK)?,
            pending_count: self.count(CF_TASK_PENDING)?,
            used_input_count: self.count(CF_USED_INPUT)?,
            handled_count: self.count(CF_HANDLED_TX)?,
            signed_count: self.count(CF_SIGNED_TX)?,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub task_count: u64,
    pub pending_count: u64,
    pub used_input_count: u64,
    pub handled_count: u64,
    pub signed_count: u64,
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    Store::open(&cfg.path)
        .map(Arc::new)
        .with_context(|| format!("Database failed to open at '{}' (is another node running? stale LOCK file?)", cfg.path))
}
