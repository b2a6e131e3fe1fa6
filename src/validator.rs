use crate::{
    config::OracleSettings,
    error::{RpcError, ValidationError, VerificationError},
    protocol::RequestTransaction,
    rpc::{output_addresses, output_value_sats, BitcoinRpc},
};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Checks a request transaction against what bitcoind reports about it.
pub struct TransactionValidator {
    rpc: Arc<dyn BitcoinRpc>,
    settings: Arc<OracleSettings>,
}

/// Keeps transport failures as errors; any other refusal becomes `kind`.
fn refused_as<T>(res: Result<T, RpcError>, kind: VerificationError) -> Result<T, ValidationError> {
    match res {
        Ok(v) => Ok(v),
        Err(e) if e.is_transport() => Err(ValidationError::Rpc(e)),
        Err(e) => {
            debug!(error = %e, ?kind, "bitcoind refused during verification");
            Err(ValidationError::Rejected(kind))
        }
    }
}

/// Zero-based rank of the first address satisfying `is_mine` in the byte-wise
/// sorted list. Every oracle sorts the same list, so all agree on turn order.
pub fn lexicographic_turn<F>(mut addresses: Vec<String>, is_mine: F) -> Option<usize>
where
    F: Fn(&str) -> bool,
{
    addresses.sort();
    addresses.iter().position(|a| is_mine(a))
}

/// True when some output pays `address` at least `minimum` satoshis.
pub fn pays_at_least(decoded: &Value, address: &str, minimum: u64) -> bool {
    decoded
        .get("vout")
        .and_then(Value::as_array)
        .map(|outs| {
            outs.iter().any(|o| {
                output_addresses(o).iter().any(|a| a == address)
                    && output_value_sats(o).map_or(false, |v| v >= minimum)
            })
        })
        .unwrap_or(false)
}

impl TransactionValidator {
    pub fn new(rpc: Arc<dyn BitcoinRpc>, settings: Arc<OracleSettings>) -> Self {
        Self { rpc, settings }
    }

    pub async fn verify(&self, tx: &RequestTransaction) -> Result<(), ValidationError> {
        let raw = tx.raw_transaction.as_str();

        let decoded = refused_as(self.rpc.decode(raw).await, VerificationError::StructurallyInvalid)?;

        // Every input must spend from the same multisig
        let mut scripts = BTreeSet::new();
        for prev in &tx.prevtx {
            match &prev.redeem_script {
                Some(script) => { scripts.insert(script.as_str()); }
                None => return Err(VerificationError::MixedInputAddresses.into()),
            }
        }
        let mut addresses = HashSet::new();
        for script in &scripts {
            let address = refused_as(
                self.rpc.address_for_redeem(script).await,
                VerificationError::MixedInputAddresses,
            )?;
            addresses.insert(address);
        }
        if addresses.len() != 1 {
            return Err(VerificationError::MixedInputAddresses.into());
        }

        for script in &scripts {
            let turn = refused_as(self.turn_of(script).await, VerificationError::NotAParty)?;
            if turn.is_none() {
                return Err(VerificationError::NotAParty.into());
            }
        }

        if let Some(escrow) = &self.settings.escrow_address {
            if !pays_at_least(&decoded, escrow, self.settings.escrow_fee_minimum) {
                return Err(VerificationError::MissingEscrowFee.into());
            }
        }
        if !pays_at_least(&decoded, &self.settings.oracle_address, self.settings.oracle_fee_minimum) {
            return Err(VerificationError::MissingOracleFee.into());
        }

        // Signing is a no-op when our signature is already present
        let signed = refused_as(self.rpc.sign(raw, &tx.prevtx).await, VerificationError::StructurallyInvalid)?;
        if signed == raw {
            return Err(VerificationError::AlreadySigned.into());
        }
        Ok(())
    }

    /// This node's position among the participants of `redeem_script`, or
    /// `None` when none of the participant addresses belongs to it.
    pub async fn turn_of(&self, redeem_script: &str) -> Result<Option<usize>, RpcError> {
        let addresses = self.rpc.addresses_for_redeem(redeem_script).await?;
        let mut mine = HashSet::new();
        let distinct: BTreeSet<&String> = addresses.iter().collect();
        for address in distinct {
            if self.rpc.address_is_mine(address).await? {
                mine.insert(address.clone());
            }
        }
        Ok(lexicographic_turn(addresses, |a| mine.contains(a)))
    }

    /// Latest turn over every input of every transaction in the request: a
    /// request is only as early as its latest-positioned signer.
    pub async fn request_turn(&self, transactions: &[RequestTransaction]) -> Result<Option<usize>, RpcError> {
        let mut latest: Option<usize> = None;
        for tx in transactions {
            for prev in &tx.prevtx {
                let Some(script) = &prev.redeem_script else { continue };
                match self.turn_of(script).await? {
                    Some(turn) => latest = Some(latest.map_or(turn, |l| l.max(turn))),
                    None => return Ok(None),
                }
            }
        }
        Ok(latest)
    }
}
