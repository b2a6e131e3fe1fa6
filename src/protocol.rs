//! Wire format of oracle requests and notifications.
//!
//! Requests are JSON objects. Two shapes are accepted and normalized into the
//! batched one:
//!
//! ```text
//! {"operation": "transaction", "raw_transaction": "..", "prevtx": [..], ...}
//! {"operation": "transaction", "transactions": [{"raw_transaction": "..", "prevtx": [..]}], ...}
//! ```

use crate::error::MalformedMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Prefix of the request-group key stored in `Task::filter_field`.
pub const REQUEST_KEY_PREFIX: &str = "rqhs:";

/// Operation kinds this oracle understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operation {
    ConditionedTransaction,
}

impl Operation {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "transaction" | "conditioned_transaction" => Some(Operation::ConditionedTransaction),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Operation::ConditionedTransaction => "transaction",
        }
    }
}

/// Subjects of messages this oracle emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    TransactionRequest,
    SignedTransaction,
    NoFee,
    AddressDuplicate,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::TransactionRequest => "TransactionRequest",
            Subject::SignedTransaction => "SignedTransaction",
            Subject::NoFee => "NO_FEE",
            Subject::AddressDuplicate => "ADDRESS_DUPLICATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TransactionRequest" => Some(Subject::TransactionRequest),
            "SignedTransaction" => Some(Subject::SignedTransaction),
            "NO_FEE" => Some(Subject::NoFee),
            "ADDRESS_DUPLICATE" => Some(Subject::AddressDuplicate),
            _ => None,
        }
    }
}

/// A message as delivered by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from_address: String,
    pub timestamp: u64,
    pub subject: String,
    pub payload: String,
}

/// Previous output spent by a request transaction, as passed to the signer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrevOut {
    pub txid: String,
    pub vout: u32,
    #[serde(rename = "redeemScript", default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(rename = "scriptPubKey", default, skip_serializing_if = "Option::is_none")]
    pub script_pub_key: Option<String>,
    /// Anything else the client attached (amounts, witness scripts).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestTransaction {
    pub raw_transaction: String,
    pub prevtx: Vec<PrevOut>,
}

/// Parsed multisig signing request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub transactions: Vec<RequestTransaction>,
    pub locktime: u64,
    pub condition: String,
    pub pubkey_list: Vec<String>,
    pub req_sigs: u32,
}

/// Reads `operation` out of a raw payload without parsing the rest.
pub fn operation_of(payload: &str) -> Result<Option<Operation>, MalformedMessage> {
    let body: Value = serde_json::from_str(payload)
        .map_err(|e| MalformedMessage(format!("invalid JSON: {e}")))?;
    let name = body
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| MalformedMessage("missing operation".into()))?;
    Ok(Operation::from_wire(name))
}

impl TransactionRequest {
    pub fn parse(payload: &str) -> Result<Self, MalformedMessage> {
        let body: Value = serde_json::from_str(payload)
            .map_err(|e| MalformedMessage(format!("invalid JSON: {e}")))?;
        let obj = body
            .as_object()
            .ok_or_else(|| MalformedMessage("payload is not an object".into()))?;

        let transactions = match obj.get("transactions") {
            Some(list) => serde_json::from_value::<Vec<RequestTransaction>>(list.clone())
                .map_err(|e| MalformedMessage(format!("bad transactions: {e}")))?,
            None => {
                let raw = obj
                    .get("raw_transaction")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MalformedMessage("missing raw_transaction".into()))?;
                let prevtx = obj
                    .get("prevtx")
                    .cloned()
                    .ok_or_else(|| MalformedMessage("missing prevtx".into()))?;
                let prevtx = serde_json::from_value::<Vec<PrevOut>>(prevtx)
                    .map_err(|e| MalformedMessage(format!("bad prevtx: {e}")))?;
                vec![RequestTransaction { raw_transaction: raw.to_string(), prevtx }]
            }
        };
        if transactions.is_empty() {
            return Err(MalformedMessage("request carries no transactions".into()));
        }

        let condition = obj
            .get("condition")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedMessage("missing condition".into()))?
            .to_string();
        let pubkey_list = obj
            .get("pubkey_json")
            .cloned()
            .map(serde_json::from_value::<Vec<String>>)
            .transpose()
            .map_err(|e| MalformedMessage(format!("bad pubkey_json: {e}")))?
            .ok_or_else(|| MalformedMessage("missing pubkey_json".into()))?;

        Ok(Self {
            transactions,
            locktime: numeric_field(obj, "locktime")?,
            condition,
            pubkey_list,
            req_sigs: u32::try_from(numeric_field(obj, "req_sigs")?)
                .map_err(|_| MalformedMessage("req_sigs out of range".into()))?,
        })
    }

    /// Batched wire form; also what a task stores as `json_data`.
    pub fn to_json(&self) -> String {
        json!({
            "operation": Operation::ConditionedTransaction.wire_name(),
            "transactions": self.transactions,
            "locktime": self.locktime,
            "condition": self.condition,
            "pubkey_json": self.pubkey_list,
            "req_sigs": self.req_sigs,
        })
        .to_string()
    }

    pub fn raw_transactions(&self) -> impl Iterator<Item = &str> {
        self.transactions.iter().map(|t| t.raw_transaction.as_str())
    }
}

/// Accepts JSON numbers and numeric strings.
fn numeric_field(obj: &Map<String, Value>, name: &str) -> Result<u64, MalformedMessage> {
    let value = match obj.get(name) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    value.ok_or_else(|| MalformedMessage(format!("{name} must be a number")))
}

/// Content hash identifying a request group. Envelope details play no part:
/// only the spent inputs, the outputs, the locktime and the condition.
pub fn request_hash(inputs: &[String], outputs: &[String], locktime: u64, condition: &str) -> String {
    let canonical = json!({
        "inputs": inputs,
        "outputs": outputs,
        "locktime": locktime,
        "condition": condition,
    });
    hex::encode(blake3::hash(canonical.to_string().as_bytes()).as_bytes())
}

pub fn group_key(request_hash: &str) -> String {
    format!("{REQUEST_KEY_PREFIX}{request_hash}")
}

/// Request hash embedded in a `filter_field`, if it uses the request-hash scheme.
pub fn parse_group_key(filter_field: &str) -> Option<&str> {
    filter_field
        .strip_prefix(REQUEST_KEY_PREFIX)
        .filter(|h| !h.is_empty())
}

pub fn address_duplicate_notice(request_hash: &str, input_fingerprint: &str) -> String {
    json!({
        "subject": Subject::AddressDuplicate.as_str(),
        "request_hash": request_hash,
        "input": input_fingerprint,
        "message": "input already claimed by a different request",
    })
    .to_string()
}

pub fn no_fee_notice(raw_transaction: &str, minimum: u64) -> String {
    json!({
        "subject": Subject::NoFee.as_str(),
        "raw_transaction": raw_transaction,
        "minimum_fee": minimum,
        "message": "transaction does not pay the required fee",
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{
        "operation": "transaction",
        "raw_transaction": "0100aa",
        "prevtx": [{"txid": "fb1c", "vout": 0, "redeemScript": "5421", "scriptPubKey": "a914", "amount": 0.5}],
        "pubkey_json": ["02e6", "0228"],
        "req_sigs": "4",
        "locktime": 1402318623,
        "condition": "True"
    }"#;

    #[test]
    fn single_shape_is_normalized() {
        let req = TransactionRequest::parse(SINGLE).unwrap();
        assert_eq!(req.transactions.len(), 1);
        assert_eq!(req.req_sigs, 4);
        assert_eq!(req.locktime, 1402318623);
        let prev = &req.transactions[0].prevtx[0];
        assert_eq!(prev.redeem_script.as_deref(), Some("5421"));
        assert_eq!(prev.extra.get("amount"), Some(&json!(0.5)));

        // the stored form parses back to the same request
        assert_eq!(TransactionRequest::parse(&req.to_json()).unwrap(), req);
    }

    #[test]
    fn bad_numbers_are_malformed() {
        let payload = SINGLE.replace("\"4\"", "\"four\"");
        assert!(TransactionRequest::parse(&payload).is_err());
        assert!(TransactionRequest::parse("not json").is_err());
    }

    #[test]
    fn operation_lookup() {
        assert_eq!(operation_of(SINGLE).unwrap(), Some(Operation::ConditionedTransaction));
        assert_eq!(operation_of(r#"{"operation": "bogus"}"#).unwrap(), None);
        assert!(operation_of(r#"{"condition": "True"}"#).is_err());
    }

    #[test]
    fn request_hash_depends_only_on_content() {
        let inputs = vec!["a".to_string(), "b".to_string()];
        let outputs = vec!["o".to_string()];
        let h1 = request_hash(&inputs, &outputs, 10, "True");
        assert_eq!(h1, request_hash(&inputs, &outputs, 10, "True"));
        assert_ne!(h1, request_hash(&inputs, &outputs, 11, "True"));
        assert_ne!(h1, request_hash(&inputs, &outputs, 10, "False"));
        assert_eq!(parse_group_key(&group_key(&h1)), Some(h1.as_str()));
        assert_eq!(parse_group_key("txid:abc"), None);
    }
}
