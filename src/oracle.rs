//! The node's single control loop.
//!
//! Each iteration drains inbound messages into tasks, then runs one
//! scheduling pass over the tasks whose `next_check` has elapsed. Collaborator
//! failures are logged and retried on a later iteration; a store failure ends
//! the loop.

use crate::{
    condition::ConditionEvaluator,
    config::{self, OracleSettings},
    error::OracleError,
    filter::RedundancyFilter,
    handler::{ConditionedTransactionHandler, OperationHandler},
    ingest::{IngestOutcome, RejectReason, RequestIngestor},
    metrics::Metrics,
    network::Messaging,
    protocol::{self, InboundMessage, Operation, Subject},
    rpc::BitcoinRpc,
    scheduler::TaskScheduler,
    signer::{SignOutcome, SigningCoordinator},
    storage::{Store, CF_META},
    tracker::HandledTransactionTracker,
};
use anyhow::Context;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const META_ORACLE_ADDRESS: &[u8] = b"oracle_address";

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The configured fee address, else the one generated on an earlier start,
/// else a fresh wallet address which is remembered for next time.
pub async fn resolve_address(configured: Option<&str>, store: &Store, rpc: &dyn BitcoinRpc) -> anyhow::Result<String> {
    if let Some(address) = configured {
        return Ok(address.to_string());
    }
    if let Some(address) = store.get::<String>(CF_META, META_ORACLE_ADDRESS)? {
        return Ok(address);
    }
    let address = rpc
        .new_address()
        .await
        .context("bitcoind could not provide an oracle address")?;
    store.put(CF_META, META_ORACLE_ADDRESS, &address)?;
    info!(%address, "generated new oracle address");
    Ok(address)
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub interval: Duration,
    pub max_batch: usize,
    pub max_retries: u32,
}

impl LoopSettings {
    pub fn from_config(cfg: &config::Oracle) -> Self {
        Self {
            interval: Duration::from_millis(cfg.loop_interval_ms),
            max_batch: cfg.max_batch,
            max_retries: cfg.max_retries,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&config::Oracle::default())
    }
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub groups: usize,
    pub signed: usize,
    pub condition_false: usize,
    pub superseded: usize,
    pub deferred: usize,
}

pub struct Oracle {
    store: Arc<Store>,
    scheduler: Arc<TaskScheduler>,
    messenger: Arc<dyn Messaging>,
    conditioned: ConditionedTransactionHandler,
    loop_cfg: LoopSettings,
    metrics: Arc<Metrics>,
    retry_inbox: VecDeque<(InboundMessage, u32)>,
}

impl Oracle {
    pub fn new(
        store: Arc<Store>,
        rpc: Arc<dyn BitcoinRpc>,
        messenger: Arc<dyn Messaging>,
        evaluator: Arc<dyn ConditionEvaluator>,
        settings: OracleSettings,
        loop_cfg: LoopSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let settings = Arc::new(settings);
        let scheduler = Arc::new(TaskScheduler::new(store.clone()));
        let ingestor = RequestIngestor::new(
            store.clone(),
            rpc.clone(),
            messenger.clone(),
            evaluator.clone(),
            settings,
            scheduler.clone(),
        );
        let filter = RedundancyFilter::new(
            scheduler.clone(),
            HandledTransactionTracker::new(store.clone()),
            rpc.clone(),
        );
        let signer = SigningCoordinator::new(store.clone(), rpc, messenger.clone(), evaluator, scheduler.clone());
        Self {
            store,
            scheduler,
            messenger,
            conditioned: ConditionedTransactionHandler::new(ingestor, filter, signer),
            loop_cfg,
            metrics,
            retry_inbox: VecDeque::new(),
        }
    }

    fn handler(&self, operation: Operation) -> &dyn OperationHandler {
        match operation {
            Operation::ConditionedTransaction => &self.conditioned,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn conditioned(&self) -> &ConditionedTransactionHandler {
        &self.conditioned
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Messages waiting for another attempt after a transient failure.
    pub fn retry_backlog(&self) -> usize {
        self.retry_inbox.len()
    }

    /// Routes one inbound message to the handler of its operation.
    pub async fn handle_message(&self, msg: &InboundMessage, now: u64) -> Result<IngestOutcome, OracleError> {
        let operation = match protocol::operation_of(&msg.payload) {
            Ok(Some(op)) => op,
            Ok(None) => return Ok(IngestOutcome::Rejected(RejectReason::UnsupportedOperation)),
            Err(e) => return Ok(IngestOutcome::Rejected(RejectReason::Malformed(e.0))),
        };
        self.handler(operation).handle_request(msg, now).await
    }

    /// Drains the retry inbox and up to `max_batch` new messages. Returns the
    /// number of tasks created.
    pub async fn process_inbound(&mut self, now: u64) -> Result<usize, OracleError> {
        let mut work: Vec<(InboundMessage, u32)> = self.retry_inbox.drain(..).collect();
        match self.messenger.poll(self.loop_cfg.max_batch).await {
            Ok(fresh) => work.extend(fresh.into_iter().map(|m| (m, 0))),
            Err(e) => {
                warn!(error = %e, "polling the messaging transport failed");
                self.metrics.transient_failures.inc();
            }
        }

        let mut created = 0;
        for (msg, attempts) in work {
            // Notices from other oracles are not requests
            if matches!(Subject::parse(&msg.subject), Some(Subject::NoFee | Subject::AddressDuplicate)) {
                continue;
            }
            if attempts == 0 {
                self.metrics.messages_received.inc();
            }
            match self.handle_message(&msg, now).await {
                Ok(IngestOutcome::TaskCreated(task)) => {
                    debug!(task = task.id, from = %msg.from_address, "request accepted");
                    self.metrics.tasks_created.inc();
                    created += 1;
                }
                Ok(IngestOutcome::Rejected(reason)) => {
                    info!(from = %msg.from_address, reason = reason.label(), "request rejected");
                    self.metrics.messages_rejected.with_label_values(&[reason.label()]).inc();
                }
                Err(e) if e.is_transient() => {
                    self.metrics.transient_failures.inc();
                    if attempts + 1 >= self.loop_cfg.max_retries {
                        warn!(from = %msg.from_address, error = %e, attempts = attempts + 1, "giving up on message");
                    } else {
                        warn!(from = %msg.from_address, error = %e, "request deferred after transient failure");
                        self.retry_inbox.push_back((msg, attempts + 1));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    /// Resolves and signs every request group with a due task.
    pub async fn scheduling_pass(&self, now: u64) -> Result<PassReport, OracleError> {
        let mut report = PassReport::default();
        let mut visited = HashSet::new();

        for due in self.scheduler.ready_tasks(now)? {
            if !visited.insert(due.filter_field.clone()) {
                continue;
            }
            // An earlier group in this pass may have closed it
            if self.scheduler.get(due.id)?.map_or(true, |t| t.done) {
                continue;
            }
            report.groups += 1;
            let handler = self.handler(due.operation);

            let resolution = match handler.filter_tasks(&due).await {
                Ok(r) => r,
                Err(e) if e.is_transient() => {
                    warn!(task = due.id, error = %e, "could not resolve group; retrying next pass");
                    self.metrics.transient_failures.inc();
                    report.deferred += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            report.superseded += resolution.superseded.len();
            self.metrics.tasks_superseded.inc_by(resolution.superseded.len() as u64);

            for task in &resolution.elected {
                match handler.handle_task(task, now).await {
                    Ok(SignOutcome::Signed { transactions }) => {
                        report.signed += 1;
                        self.metrics.transactions_signed.inc_by(transactions.len() as u64);
                    }
                    Ok(SignOutcome::ConditionFalse) => {
                        report.condition_false += 1;
                        self.metrics.conditions_false.inc();
                    }
                    Err(e) if e.is_transient() => {
                        warn!(task = task.id, error = %e, "signing deferred after transient failure");
                        self.metrics.transient_failures.inc();
                        report.deferred += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(report)
    }

    pub async fn run_once(&mut self, now: u64) -> Result<PassReport, OracleError> {
        self.process_inbound(now).await?;
        let report = self.scheduling_pass(now).await?;
        self.metrics.pending_tasks.set(self.scheduler.pending_count()? as i64);
        if report.groups > 0 {
            debug!(?report, "scheduling pass finished");
        }
        Ok(report)
    }

    /// Runs until `shutdown` fires or the store fails.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), OracleError> {
        let mut interval = tokio::time::interval(self.loop_cfg.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.loop_cfg.interval.as_millis() as u64, "oracle loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("oracle loop stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(unix_now()).await {
                        error!(error = %e, "fatal error in oracle loop");
                        return Err(e);
                    }
                }
            }
        }
    }
}
