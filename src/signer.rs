use crate::{
    condition::{ConditionEvaluator, EvalContext},
    error::OracleError,
    network::Messaging,
    protocol::{Subject, TransactionRequest},
    rpc::BitcoinRpc,
    scheduler::{Task, TaskScheduler},
    storage::{Store, CF_SIGNED_TX},
};
use anyhow::{Context, Result};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// A transaction as it left this node after signing. Never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hex_transaction: String,
    /// JSON list of the previous outputs handed to the signer.
    pub prevtx: String,
    pub signed_at: u64,
}

/// Append-only log of signed transactions, keyed by insertion sequence.
pub struct SignedTransactionLog {
    db: Arc<Store>,
}

impl SignedTransactionLog {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }

    pub fn stage(&self, batch: &mut WriteBatch, record: &SignedTransaction) -> Result<()> {
        let seq = self.db.next_sequence("signed")?;
        self.db.batch_put(batch, CF_SIGNED_TX, &seq.to_be_bytes(), record)
    }

    pub fn all(&self) -> Result<Vec<SignedTransaction>> {
        self.db.values(CF_SIGNED_TX)
    }

    pub fn count(&self) -> Result<u64> {
        self.db.count(CF_SIGNED_TX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignOutcome {
    Signed { transactions: Vec<String> },
    ConditionFalse,
}

pub struct SigningCoordinator {
    db: Arc<Store>,
    rpc: Arc<dyn BitcoinRpc>,
    messenger: Arc<dyn Messaging>,
    evaluator: Arc<dyn ConditionEvaluator>,
    scheduler: Arc<TaskScheduler>,
    log: SignedTransactionLog,
}

impl SigningCoordinator {
    pub fn new(
        db: Arc<Store>,
        rpc: Arc<dyn BitcoinRpc>,
        messenger: Arc<dyn Messaging>,
        evaluator: Arc<dyn ConditionEvaluator>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self { log: SignedTransactionLog::new(db.clone()), db, rpc, messenger, evaluator, scheduler }
    }

    pub fn log(&self) -> &SignedTransactionLog {
        &self.log
    }

    /// Signs an elected task and rebroadcasts the result.
    ///
    /// The signed records are written before the broadcast and the task is
    /// marked done after it. If the broadcast fails the task stays pending and
    /// is signed again on a later pass, which bitcoind treats as a no-op.
    pub async fn sign_task(&self, task: &Task, now: u64) -> Result<SignOutcome, OracleError> {
        let request = TransactionRequest::parse(&task.json_data)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("stored task {} is unreadable", task.id))?;

        let ctx = EvalContext { now };
        let selection = if self.evaluator.evaluate(&request.condition, &ctx) {
            self.evaluator.select_signable(&request.condition, &request.transactions, &ctx)
        } else {
            Vec::new()
        };
        if !selection.iter().any(|s| *s) {
            self.scheduler.done(task.id)?;
            info!(task = task.id, "condition no longer holds; task closed unsigned");
            return Ok(SignOutcome::ConditionFalse);
        }

        let mut signed_request = request.clone();
        let mut signed = Vec::new();
        for (tx, selected) in signed_request.transactions.iter_mut().zip(&selection) {
            if !*selected {
                continue;
            }
            let hex = self.rpc.sign(&tx.raw_transaction, &tx.prevtx).await?;
            tx.raw_transaction = hex.clone();
            signed.push((hex, tx.prevtx.clone()));
        }

        let mut batch = WriteBatch::default();
        for (hex, prevtx) in &signed {
            let record = SignedTransaction {
                hex_transaction: hex.clone(),
                prevtx: serde_json::to_string(prevtx).context("encoding prevtx")?,
                signed_at: now,
            };
            self.log.stage(&mut batch, &record)?;
        }
        self.db.write_batch(batch)?;

        self.messenger
            .broadcast(Subject::SignedTransaction, &signed_request.to_json())
            .await?;

        if !self.scheduler.done(task.id)? {
            warn!(task = task.id, "task was already closed when signing finished");
        }
        info!(task = task.id, transactions = signed.len(), "signed and rebroadcast");
        Ok(SignOutcome::Signed { transactions: signed.into_iter().map(|(hex, _)| hex).collect() })
    }
}
