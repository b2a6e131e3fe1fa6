//! Election among the tasks of one request group.
//!
//! Every node applies the same rule to the signature counts it observes: only
//! the most-signed tasks survive, and nothing survives if the group has been
//! seen more signed before. Two nodes looking at the same counts always elect
//! the same tasks.

use crate::{
    error::OracleError,
    protocol::{parse_group_key, TransactionRequest},
    rpc::BitcoinRpc,
    scheduler::{Task, TaskScheduler},
    tracker::HandledTransactionTracker,
};
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub group_key: String,
    pub elected: Vec<Task>,
    /// Ids marked done by this resolution.
    pub superseded: Vec<u64>,
    pub most_signatures: u32,
    pub prior_max: u32,
}

/// Splits `(task id, signature count)` pairs into elected and superseded ids.
/// Returns the group maximum alongside.
pub fn elect(counts: &[(u64, u32)], prior_max: u32) -> (Vec<u64>, Vec<u64>, u32) {
    let most = counts.iter().map(|(_, c)| *c).max().unwrap_or(0);
    if prior_max > most {
        return (Vec::new(), counts.iter().map(|(id, _)| *id).collect(), most);
    }
    let (elected, superseded): (Vec<&(u64, u32)>, Vec<&(u64, u32)>) = counts.iter().partition(|(_, c)| *c == most);
    (
        elected.into_iter().map(|(id, _)| *id).collect(),
        superseded.into_iter().map(|(id, _)| *id).collect(),
        most,
    )
}

pub struct RedundancyFilter {
    scheduler: Arc<TaskScheduler>,
    tracker: HandledTransactionTracker,
    rpc: Arc<dyn BitcoinRpc>,
}

impl RedundancyFilter {
    pub fn new(scheduler: Arc<TaskScheduler>, tracker: HandledTransactionTracker, rpc: Arc<dyn BitcoinRpc>) -> Self {
        Self { scheduler, tracker, rpc }
    }

    pub fn tracker(&self) -> &HandledTransactionTracker {
        &self.tracker
    }

    /// Signatures on the least-signed transaction of the task's request.
    async fn task_signatures(&self, task: &Task) -> Result<u32, OracleError> {
        let request = TransactionRequest::parse(&task.json_data)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("stored task {} is unreadable", task.id))?;
        let mut weakest: Option<u32> = None;
        for tx in &request.transactions {
            let count = self.rpc.signature_count(&tx.raw_transaction, &tx.prevtx).await?;
            weakest = Some(weakest.map_or(count, |w| w.min(count)));
        }
        Ok(weakest.unwrap_or(0))
    }

    pub async fn resolve(&self, due: &Task) -> Result<Resolution, OracleError> {
        let Some(request_hash) = parse_group_key(&due.filter_field) else {
            // Only request-hash keys are ever written; anything else cannot be grouped
            let superseded = if self.scheduler.done(due.id)? { vec![due.id] } else { Vec::new() };
            return Ok(Resolution { group_key: due.filter_field.clone(), superseded, ..Default::default() });
        };
        debug!(task = due.id, request = request_hash, "resolving request group");

        let group = self.scheduler.get_similar(&due.filter_field)?;
        if group.is_empty() {
            return Ok(Resolution { group_key: due.filter_field.clone(), ..Default::default() });
        }

        let mut counts = Vec::with_capacity(group.len());
        for task in &group {
            counts.push((task.id, self.task_signatures(task).await?));
        }

        let prior_max = self.tracker.get(&due.filter_field)?;
        let (elected_ids, superseded, most_signatures) = elect(&counts, prior_max);

        self.scheduler.done_all(&superseded)?;
        self.tracker.ratchet(&due.filter_field, most_signatures)?;

        let elected: Vec<Task> = group.into_iter().filter(|t| elected_ids.contains(&t.id)).collect();
        info!(
            request = request_hash,
            elected = elected.len(),
            superseded = superseded.len(),
            most_signatures,
            prior_max,
            "request group resolved"
        );
        Ok(Resolution {
            group_key: due.filter_field.clone(),
            elected,
            superseded,
            most_signatures,
            prior_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_at_the_maximum_all_survive() {
        let (elected, superseded, most) = elect(&[(1, 3), (2, 5), (3, 5), (4, 2)], 0);
        assert_eq!(elected, vec![2, 3]);
        assert_eq!(superseded, vec![1, 4]);
        assert_eq!(most, 5);
    }

    #[test]
    fn better_signed_elsewhere_supersedes_everything() {
        let (elected, superseded, most) = elect(&[(1, 5), (2, 4)], 6);
        assert!(elected.is_empty());
        assert_eq!(superseded, vec![1, 2]);
        assert_eq!(most, 5);
    }

    #[test]
    fn equal_to_prior_still_elects() {
        let (elected, superseded, _) = elect(&[(7, 2)], 2);
        assert_eq!(elected, vec![7]);
        assert!(superseded.is_empty());
    }

    #[test]
    fn empty_group() {
        assert_eq!(elect(&[], 3), (vec![], vec![], 0));
    }
}
