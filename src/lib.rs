// Library interface for the escrow oracle node
// The binary and the integration tests build on the same modules.

pub mod condition;
pub mod config;
pub mod error;
pub mod filter;
pub mod handler;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod network;
pub mod oracle;
pub mod protocol;
pub mod rpc;
pub mod scheduler;
pub mod signer;
pub mod storage;
pub mod tracker;
pub mod validator;

pub use condition::{BasicEvaluator, ConditionEvaluator, EvalContext};
pub use config::OracleSettings;
pub use error::{OracleError, RpcError, VerificationError};
pub use ingest::{IngestOutcome, RejectReason};
pub use network::Messaging;
pub use oracle::Oracle;
pub use protocol::{InboundMessage, Subject};
pub use rpc::BitcoinRpc;
pub use scheduler::Task;
pub use storage::Store;
