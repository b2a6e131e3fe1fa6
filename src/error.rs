use thiserror::Error;

/// Failure talking to bitcoind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Connectivity problem; the call may succeed if repeated later.
    #[error("bitcoind unreachable: {0}")]
    Transport(String),
    /// bitcoind answered but refused the call.
    #[error("bitcoind error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("unexpected bitcoind response: {0}")]
    Malformed(String),
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("messaging transport is closed")]
    Closed,
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Reasons a transaction is refused before any task exists for it.
/// Checked in declaration order; the first failing check wins.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum VerificationError {
    #[error("transaction does not decode")]
    StructurallyInvalid,
    #[error("inputs do not spend from exactly one multisig address")]
    MixedInputAddresses,
    #[error("this oracle is not a party to the redeem script")]
    NotAParty,
    #[error("escrow fee output missing or below minimum")]
    MissingEscrowFee,
    #[error("oracle fee output missing or below minimum")]
    MissingOracleFee,
    #[error("transaction already carries this oracle's signature")]
    AlreadySigned,
}

impl VerificationError {
    pub fn is_fee(&self) -> bool {
        matches!(self, VerificationError::MissingEscrowFee | VerificationError::MissingOracleFee)
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("verification failed: {0}")]
    Rejected(#[from] VerificationError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Inbound payload that cannot be interpreted as a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(pub String);

/// Errors surfaced to the control loop.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// The record store failed or returned data it could not decode.
    #[error("store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl OracleError {
    /// Collaborator failures are retried on a later pass; store failures halt the node.
    pub fn is_transient(&self) -> bool {
        !matches!(self, OracleError::Store(_))
    }
}
