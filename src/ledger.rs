//! Claims on spent inputs.
//!
//! Each input fingerprint belongs to at most one request group. A second
//! request with the same `request_hash` re-claims it harmlessly; a request with
//! a different hash conflicts and must be dropped as a whole.

use crate::storage::{Store, CF_USED_INPUT};
use anyhow::Result;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsedInput {
    pub input_fingerprint: String,
    pub owning_request_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Accepted,
    Conflict { input_fingerprint: String, owner: String },
}

pub struct UsedInputLedger {
    db: Arc<Store>,
}

impl UsedInputLedger {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }

    pub fn owner(&self, input_fingerprint: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .get::<UsedInput>(CF_USED_INPUT, input_fingerprint.as_bytes())?
            .map(|u| u.owning_request_hash))
    }

    /// Read-only: would claiming every fingerprint for `request_hash` succeed?
    pub fn check(&self, fingerprints: &[String], request_hash: &str) -> Result<ClaimOutcome> {
        for fp in fingerprints {
            if let Some(owner) = self.owner(fp)? {
                if owner != request_hash {
                    return Ok(ClaimOutcome::Conflict { input_fingerprint: fp.clone(), owner });
                }
            }
        }
        Ok(ClaimOutcome::Accepted)
    }

    /// Adds the not-yet-recorded claims to `batch`. Call after a successful `check`.
    pub fn stage(&self, batch: &mut WriteBatch, fingerprints: &[String], request_hash: &str) -> Result<()> {
        for fp in fingerprints {
            if self.owner(fp)?.is_none() {
                let record = UsedInput {
                    input_fingerprint: fp.clone(),
                    owning_request_hash: request_hash.to_string(),
                };
                self.db.batch_put(batch, CF_USED_INPUT, fp.as_bytes(), &record)?;
            }
        }
        Ok(())
    }

    /// Checks then records every claim in one write; nothing is written on conflict.
    pub fn claim_all(&self, fingerprints: &[String], request_hash: &str) -> Result<ClaimOutcome> {
        let outcome = self.check(fingerprints, request_hash)?;
        if outcome == ClaimOutcome::Accepted {
            let mut batch = WriteBatch::default();
            self.stage(&mut batch, fingerprints, request_hash)?;
            self.db.write_batch(batch)?;
        }
        Ok(outcome)
    }

    pub fn claim(&self, input_fingerprint: &str, request_hash: &str) -> Result<ClaimOutcome> {
        self.claim_all(&[input_fingerprint.to_string()], request_hash)
    }

    pub fn len(&self) -> Result<u64> {
        self.db.count(CF_USED_INPUT)
    }
}
