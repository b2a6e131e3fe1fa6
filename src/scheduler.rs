//! Durable task queue.
//!
//! Tasks are stored by id and indexed twice: by `(next_check, id)` while they
//! are pending, and by `(filter_field, id)` for the lifetime of the task so a
//! request group can be fetched in one prefix scan. Completed tasks stay in the
//! store; only their pending index entry goes away.

use crate::{
    protocol::Operation,
    storage::{Store, CF_TASK, CF_TASK_GROUP, CF_TASK_PENDING},
};
use anyhow::{Context, Result};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub operation: Operation,
    pub json_data: String,
    /// Request group key, `rqhs:<request_hash>`.
    pub filter_field: String,
    pub done: bool,
    /// Unix seconds before which the task is invisible to scheduling passes.
    pub next_check: u64,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub operation: Operation,
    pub json_data: String,
    pub filter_field: String,
    pub next_check: u64,
}

fn pending_key(next_check: u64, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&next_check.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn group_prefix(filter_field: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(filter_field.len() + 1);
    prefix.extend_from_slice(filter_field.as_bytes());
    prefix.push(0);
    prefix
}

fn group_key(filter_field: &str, id: u64) -> Vec<u8> {
    let mut key = group_prefix(filter_field);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn id_from_suffix(key: &[u8]) -> Result<u64> {
    let tail: [u8; 8] = key
        .get(key.len().saturating_sub(8)..)
        .and_then(|s| <[u8; 8]>::try_from(s).ok())
        .context("task index key too short")?;
    Ok(u64::from_be_bytes(tail))
}

pub struct TaskScheduler {
    db: Arc<Store>,
}

impl TaskScheduler {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }

    /// Persists a new pending task in one write together with whatever is
    /// already staged in `batch` and whatever `stage` adds once the id is known.
    pub fn save_with<F>(&self, new: NewTask, mut batch: WriteBatch, stage: F) -> Result<Task>
    where
        F: FnOnce(&Task, &mut WriteBatch) -> Result<()>,
    {
        let id = self.db.next_sequence("task")?;
        let task = Task {
            id,
            operation: new.operation,
            json_data: new.json_data,
            filter_field: new.filter_field,
            done: false,
            next_check: new.next_check,
        };
        stage(&task, &mut batch)?;
        self.db.batch_put(&mut batch, CF_TASK, &id.to_be_bytes(), &task)?;
        self.db.batch_put_raw(&mut batch, CF_TASK_PENDING, &pending_key(task.next_check, id), &[])?;
        self.db.batch_put_raw(&mut batch, CF_TASK_GROUP, &group_key(&task.filter_field, id), &[])?;
        self.db.write_batch(batch)?;
        Ok(task)
    }

    pub fn save(&self, new: NewTask) -> Result<Task> {
        self.save_with(new, WriteBatch::default(), |_, _| Ok(()))
    }

    pub fn get(&self, id: u64) -> Result<Option<Task>> {
        self.db.get(CF_TASK, &id.to_be_bytes())
    }

    fn load(&self, id: u64) -> Result<Task> {
        self.get(id)?
            .with_context(|| format!("task index points at missing task {id}"))
    }

    /// Pending tasks whose `next_check` has elapsed, earliest first.
    pub fn ready_tasks(&self, now: u64) -> Result<Vec<Task>> {
        let mut ids = Vec::new();
        self.db.scan_keys_while(CF_TASK_PENDING, |key| {
            let next_check = u64::from_be_bytes(
                key.get(..8).and_then(|s| <[u8; 8]>::try_from(s).ok()).context("pending key too short")?,
            );
            if next_check > now {
                return Ok(false);
            }
            ids.push(id_from_suffix(key)?);
            Ok(true)
        })?;
        ids.into_iter().map(|id| self.load(id)).collect()
    }

    pub fn get_oldest_task(&self, now: u64) -> Result<Option<Task>> {
        Ok(self.ready_tasks(now)?.into_iter().next())
    }

    /// Pending tasks sharing `filter_field`, ready or not, in creation order.
    pub fn get_similar(&self, filter_field: &str) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        for (key, _) in self.db.scan_prefix(CF_TASK_GROUP, &group_prefix(filter_field))? {
            let task = self.load(id_from_suffix(&key)?)?;
            if !task.done {
                out.push(task);
            }
        }
        Ok(out)
    }

    /// Every task of the group including completed ones.
    pub fn get_group(&self, filter_field: &str) -> Result<Vec<Task>> {
        self.db
            .scan_prefix(CF_TASK_GROUP, &group_prefix(filter_field))?
            .into_iter()
            .map(|(key, _)| self.load(id_from_suffix(&key)?))
            .collect()
    }

    /// Marks the tasks done in one write. Already-done or unknown ids are
    /// skipped; returns how many tasks actually changed state.
    pub fn done_all(&self, ids: &[u64]) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut changed = 0;
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let Some(mut task) = self.get(*id)? else { continue };
            if task.done {
                continue;
            }
            task.done = true;
            self.db.batch_put(&mut batch, CF_TASK, &id.to_be_bytes(), &task)?;
            self.db.batch_delete(&mut batch, CF_TASK_PENDING, &pending_key(task.next_check, *id))?;
            changed += 1;
        }
        if changed > 0 {
            self.db.write_batch(batch)?;
        }
        Ok(changed)
    }

    pub fn done(&self, id: u64) -> Result<bool> {
        Ok(self.done_all(&[id])? == 1)
    }

    pub fn get_all_tasks(&self) -> Result<Vec<Task>> {
        self.db.values(CF_TASK)
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.db.count(CF_TASK_PENDING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_keys_order_by_time_then_id() {
        assert!(pending_key(5, 9) < pending_key(6, 1));
        assert!(pending_key(5, 1) < pending_key(5, 2));
        assert_eq!(id_from_suffix(&pending_key(5, 77)).unwrap(), 77);
        assert_eq!(id_from_suffix(&group_key("rqhs:ab", 3)).unwrap(), 3);
    }

    #[test]
    fn group_prefix_does_not_match_longer_keys() {
        // "rqhs:a" must not pick up entries of "rqhs:ab"
        let k = group_key("rqhs:ab", 1);
        assert!(!k.starts_with(&group_prefix("rqhs:a")));
    }
}
