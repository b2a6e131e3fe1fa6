use crate::{
    error::OracleError,
    filter::{RedundancyFilter, Resolution},
    ingest::{IngestOutcome, RequestIngestor},
    protocol::{InboundMessage, Operation},
    scheduler::Task,
    signer::{SignOutcome, SigningCoordinator},
};
use async_trait::async_trait;

/// The three stages every operation kind goes through.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn operation(&self) -> Operation;

    /// Inbound message to task, or a rejection.
    async fn handle_request(&self, msg: &InboundMessage, now: u64) -> Result<IngestOutcome, OracleError>;

    /// Decides which tasks of the due task's group go on to `handle_task`.
    async fn filter_tasks(&self, due: &Task) -> Result<Resolution, OracleError>;

    async fn handle_task(&self, task: &Task, now: u64) -> Result<SignOutcome, OracleError>;
}

/// Conditioned multisig transactions, the `transaction` operation.
pub struct ConditionedTransactionHandler {
    ingestor: RequestIngestor,
    filter: RedundancyFilter,
    signer: SigningCoordinator,
}

impl ConditionedTransactionHandler {
    pub fn new(ingestor: RequestIngestor, filter: RedundancyFilter, signer: SigningCoordinator) -> Self {
        Self { ingestor, filter, signer }
    }

    pub fn ingestor(&self) -> &RequestIngestor {
        &self.ingestor
    }

    pub fn filter(&self) -> &RedundancyFilter {
        &self.filter
    }

    pub fn signer(&self) -> &SigningCoordinator {
        &self.signer
    }
}

#[async_trait]
impl OperationHandler for ConditionedTransactionHandler {
    fn operation(&self) -> Operation {
        Operation::ConditionedTransaction
    }

    async fn handle_request(&self, msg: &InboundMessage, now: u64) -> Result<IngestOutcome, OracleError> {
        self.ingestor.ingest(msg, now).await
    }

    async fn filter_tasks(&self, due: &Task) -> Result<Resolution, OracleError> {
        self.filter.resolve(due).await
    }

    async fn handle_task(&self, task: &Task, now: u64) -> Result<SignOutcome, OracleError> {
        self.signer.sign_task(task, now).await
    }
}
