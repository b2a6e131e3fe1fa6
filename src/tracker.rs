use crate::storage::{Store, CF_HANDLED_TX};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandledTransaction {
    pub request_group_key: String,
    pub max_signatures_seen: u32,
}

/// Highest signature count ever observed per request group. The stored value
/// only ever grows.
pub struct HandledTransactionTracker {
    db: Arc<Store>,
}

impl HandledTransactionTracker {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }

    /// 0 for groups never seen.
    pub fn get(&self, group_key: &str) -> Result<u32> {
        Ok(self
            .db
            .get::<HandledTransaction>(CF_HANDLED_TX, group_key.as_bytes())?
            .map_or(0, |h| h.max_signatures_seen))
    }

    /// Records `seen` if it beats the stored maximum; returns the maximum after the update.
    pub fn ratchet(&self, group_key: &str, seen: u32) -> Result<u32> {
        let prior = self.db.get::<HandledTransaction>(CF_HANDLED_TX, group_key.as_bytes())?;
        let current = prior.as_ref().map_or(0, |h| h.max_signatures_seen);
        if prior.is_some() && seen <= current {
            return Ok(current);
        }
        let max = current.max(seen);
        let record = HandledTransaction { request_group_key: group_key.to_string(), max_signatures_seen: max };
        self.db.put(CF_HANDLED_TX, group_key.as_bytes(), &record)?;
        Ok(max)
    }
}
