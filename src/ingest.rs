//! Turns inbound request messages into scheduled tasks.
//!
//! Every collaborator call happens before anything is written. The input
//! claims, the task and its audit record then go to the store in one batch,
//! so a rejected request leaves no trace besides the notification it caused.

use crate::{
    condition::{ConditionEvaluator, EvalContext},
    config::OracleSettings,
    error::{OracleError, ValidationError, VerificationError},
    ledger::{ClaimOutcome, UsedInputLedger},
    network::Messaging,
    protocol::{self, InboundMessage, Operation, Subject, TransactionRequest},
    rpc::BitcoinRpc,
    scheduler::{NewTask, Task, TaskScheduler},
    storage::{Store, CF_REQUEST},
    validator::TransactionValidator,
};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    TaskCreated(Task),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Malformed(String),
    UnsupportedOperation,
    InvalidCondition,
    MultisigImportFailed,
    VerificationFailed(VerificationError),
    /// The condition selects none of the request's transactions.
    NothingToSign,
    DuplicateInput { input_fingerprint: String },
    /// A byte-identical request is already queued or handled.
    AlreadyQueued,
}

impl RejectReason {
    /// Short stable name used as a metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Malformed(_) => "malformed",
            RejectReason::UnsupportedOperation => "unsupported_operation",
            RejectReason::InvalidCondition => "invalid_condition",
            RejectReason::MultisigImportFailed => "multisig_import_failed",
            RejectReason::VerificationFailed(kind) => match kind {
                VerificationError::StructurallyInvalid => "structurally_invalid",
                VerificationError::MixedInputAddresses => "mixed_input_addresses",
                VerificationError::NotAParty => "not_a_party",
                VerificationError::MissingEscrowFee => "missing_escrow_fee",
                VerificationError::MissingOracleFee => "missing_oracle_fee",
                VerificationError::AlreadySigned => "already_signed",
            },
            RejectReason::NothingToSign => "nothing_to_sign",
            RejectReason::DuplicateInput { .. } => "duplicate_input",
            RejectReason::AlreadyQueued => "already_queued",
        }
    }
}

/// Accepted request as received, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRecord {
    pub task_id: u64,
    pub from_address: String,
    pub received_at: u64,
    pub request_hash: String,
    pub payload: String,
}

pub struct RequestIngestor {
    db: Arc<Store>,
    rpc: Arc<dyn BitcoinRpc>,
    messenger: Arc<dyn Messaging>,
    evaluator: Arc<dyn ConditionEvaluator>,
    settings: Arc<OracleSettings>,
    validator: TransactionValidator,
    ledger: UsedInputLedger,
    scheduler: Arc<TaskScheduler>,
}

fn rejected(reason: RejectReason) -> Result<IngestOutcome, OracleError> {
    Ok(IngestOutcome::Rejected(reason))
}

impl RequestIngestor {
    pub fn new(
        db: Arc<Store>,
        rpc: Arc<dyn BitcoinRpc>,
        messenger: Arc<dyn Messaging>,
        evaluator: Arc<dyn ConditionEvaluator>,
        settings: Arc<OracleSettings>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            validator: TransactionValidator::new(rpc.clone(), settings.clone()),
            ledger: UsedInputLedger::new(db.clone()),
            db,
            rpc,
            messenger,
            evaluator,
            settings,
            scheduler,
        }
    }

    pub async fn ingest(&self, msg: &InboundMessage, now: u64) -> Result<IngestOutcome, OracleError> {
        let request = match TransactionRequest::parse(&msg.payload) {
            Ok(r) => r,
            Err(e) => return rejected(RejectReason::Malformed(e.0)),
        };

        if !self.evaluator.is_well_formed(&request.condition) {
            return rejected(RejectReason::InvalidCondition);
        }

        // The wallet has to know the multisig before it can sign for it later
        if let Err(e) = self.rpc.add_multisig_address(request.req_sigs, &request.pubkey_list).await {
            if e.is_transport() {
                return Err(e.into());
            }
            debug!(error = %e, "multisig import refused");
            return rejected(RejectReason::MultisigImportFailed);
        }

        for tx in &request.transactions {
            match self.validator.verify(tx).await {
                Ok(()) => {}
                Err(ValidationError::Rpc(e)) => return Err(e.into()),
                Err(ValidationError::Rejected(kind)) => {
                    if kind.is_fee() {
                        let minimum = match kind {
                            VerificationError::MissingEscrowFee => self.settings.escrow_fee_minimum,
                            _ => self.settings.oracle_fee_minimum,
                        };
                        let notice = protocol::no_fee_notice(&tx.raw_transaction, minimum);
                        self.messenger.send(&msg.from_address, Subject::NoFee, &notice).await?;
                    }
                    return rejected(RejectReason::VerificationFailed(kind));
                }
            }
        }

        let mut inputs = BTreeSet::new();
        let mut outputs = Vec::with_capacity(request.transactions.len());
        for tx in &request.transactions {
            let (tx_inputs, tx_outputs) = self.rpc.inputs_outputs(&tx.raw_transaction).await?;
            inputs.extend(tx_inputs);
            outputs.push(tx_outputs);
        }
        outputs.sort();
        let inputs: Vec<String> = inputs.into_iter().collect();
        let request_hash = protocol::request_hash(&inputs, &outputs, request.locktime, &request.condition);
        let filter_field = protocol::group_key(&request_hash);

        // Conditions are judged at the moment signing could first happen
        let ctx = EvalContext { now: now.max(request.locktime) };
        let signable = self.evaluator.select_signable(&request.condition, &request.transactions, &ctx);
        if !signable.iter().any(|s| *s) {
            return rejected(RejectReason::NothingToSign);
        }

        let Some(turn) = self.validator.request_turn(&request.transactions).await? else {
            return rejected(RejectReason::VerificationFailed(VerificationError::NotAParty));
        };

        if let ClaimOutcome::Conflict { input_fingerprint, owner } = self.ledger.check(&inputs, &request_hash)? {
            warn!(input = %input_fingerprint, %owner, request = %request_hash, "input already claimed by another request");
            let notice = protocol::address_duplicate_notice(&request_hash, &input_fingerprint);
            self.messenger.broadcast(Subject::AddressDuplicate, &notice).await?;
            return rejected(RejectReason::DuplicateInput { input_fingerprint });
        }

        let json_data = request.to_json();
        if self.scheduler.get_group(&filter_field)?.iter().any(|t| t.json_data == json_data) {
            debug!(request = %request_hash, "identical request already queued");
            return rejected(RejectReason::AlreadyQueued);
        }

        let delay = (turn as u64).saturating_mul(self.settings.heuristic_delay_seconds);
        let next_check = request.locktime.saturating_add(delay);

        let mut batch = WriteBatch::default();
        self.ledger.stage(&mut batch, &inputs, &request_hash)?;
        let task = self.scheduler.save_with(
            NewTask {
                operation: Operation::ConditionedTransaction,
                json_data,
                filter_field,
                next_check,
            },
            batch,
            |task, batch| {
                let record = RequestRecord {
                    task_id: task.id,
                    from_address: msg.from_address.clone(),
                    received_at: msg.timestamp,
                    request_hash: request_hash.clone(),
                    payload: msg.payload.clone(),
                };
                self.db.batch_put(batch, CF_REQUEST, &task.id.to_be_bytes(), &record)
            },
        )?;
        info!(task = task.id, request = %request_hash, turn, next_check, "task created");
        Ok(IngestOutcome::TaskCreated(task))
    }

    pub fn request_record(&self, task_id: u64) -> Result<Option<RequestRecord>, OracleError> {
        Ok(self.db.get(CF_REQUEST, &task_id.to_be_bytes())?)
    }
}
