// Shared doubles for the integration tests: a scripted bitcoind and an
// in-memory messaging transport.
#![allow(dead_code)]

use async_trait::async_trait;
use escrow_oracle::{
    condition::BasicEvaluator,
    config::OracleSettings,
    error::{MessagingError, RpcError},
    metrics::Metrics,
    network::Messaging,
    oracle::{LoopSettings, Oracle},
    protocol::{InboundMessage, PrevOut, Subject},
    rpc::{BitcoinRpc, MultisigAddress},
    storage::Store,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const ORACLE_ADDRESS: &str = "1OracleFeeAddr";
pub const REDEEM: &str = "5221aa21bb21cc53ae";
pub const MULTISIG: &str = "3EscrowMultisig";
/// Fee that satisfies the default 10_000 sat minimum.
pub const FEE_BTC: f64 = 0.0001;

#[derive(Debug, Clone)]
pub struct MockTx {
    pub inputs: Vec<(String, u32)>,
    pub outputs: Vec<(f64, String)>,
    pub sigs: u32,
    pub signed_by_me: bool,
}

fn der_signature(i: u32) -> String {
    format!("30{:02x}{}[ALL]", i, "ab".repeat(34))
}

/// bitcoind double. Raw transactions are opaque labels registered up front;
/// signing registers a new label carrying one more signature.
#[derive(Default)]
pub struct MockRpc {
    txs: Mutex<HashMap<String, MockTx>>,
    redeem: Mutex<HashMap<String, Vec<String>>>,
    mine: Mutex<HashSet<String>>,
    transport_failures: AtomicU32,
    refuse_multisig: AtomicBool,
    pub sign_calls: AtomicU32,
    pub multisig_imports: AtomicU32,
}

impl MockRpc {
    /// A 2-of-3 escrow with participants A, B, C where this node owns B.
    pub fn new() -> Self {
        let rpc = Self::default();
        rpc.set_redeem(REDEEM, &["1PartyC", "1PartyA", "1PartyB"]);
        rpc.set_mine(&["1PartyB"]);
        rpc
    }

    pub fn set_redeem(&self, script: &str, addresses: &[&str]) {
        self.redeem
            .lock()
            .unwrap()
            .insert(script.to_string(), addresses.iter().map(|a| a.to_string()).collect());
    }

    pub fn set_mine(&self, addresses: &[&str]) {
        let mut mine = self.mine.lock().unwrap();
        mine.clear();
        mine.extend(addresses.iter().map(|a| a.to_string()));
    }

    pub fn add_tx(&self, label: &str, tx: MockTx) -> String {
        self.txs.lock().unwrap().insert(label.to_string(), tx);
        label.to_string()
    }

    /// Transaction spending `input` that pays the oracle fee plus `payout`.
    pub fn escrow_tx(&self, label: &str, input: &str, payout: f64, sigs: u32) -> String {
        self.add_tx(
            label,
            MockTx {
                inputs: vec![(input.to_string(), 0)],
                outputs: vec![(payout, "1Beneficiary".to_string()), (FEE_BTC, ORACLE_ADDRESS.to_string())],
                sigs,
                signed_by_me: false,
            },
        )
    }

    pub fn tx(&self, raw: &str) -> Option<MockTx> {
        self.txs.lock().unwrap().get(raw).cloned()
    }

    /// The next `n` calls fail as if bitcoind were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.transport_failures.store(n, Ordering::SeqCst);
    }

    pub fn refuse_multisig_import(&self, refuse: bool) {
        self.refuse_multisig.store(refuse, Ordering::SeqCst);
    }

    fn reachable(&self) -> Result<(), RpcError> {
        let left = self.transport_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.transport_failures.store(left - 1, Ordering::SeqCst);
            return Err(RpcError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn decoded(raw: &str, tx: &MockTx) -> Value {
        let sigs: Vec<String> = (0..tx.sigs).map(der_signature).collect();
        let asm = format!("0 {} {}", sigs.join(" "), REDEEM);
        json!({
            "txid": raw,
            "vin": tx.inputs.iter().map(|(txid, n)| json!({
                "txid": txid,
                "vout": n,
                "scriptSig": { "asm": asm },
            })).collect::<Vec<_>>(),
            "vout": tx.outputs.iter().enumerate().map(|(n, (value, address))| json!({
                "n": n,
                "value": value,
                "scriptPubKey": { "addresses": [address] },
            })).collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl BitcoinRpc for MockRpc {
    async fn decode(&self, raw_tx: &str) -> Result<Value, RpcError> {
        self.reachable()?;
        let txs = self.txs.lock().unwrap();
        let tx = txs.get(raw_tx).ok_or_else(|| RpcError::Server { code: -22, message: "TX decode failed".into() })?;
        Ok(Self::decoded(raw_tx, tx))
    }

    async fn sign(&self, raw_tx: &str, _prevtx: &[PrevOut]) -> Result<String, RpcError> {
        self.reachable()?;
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let mut txs = self.txs.lock().unwrap();
        let tx = txs
            .get(raw_tx)
            .cloned()
            .ok_or_else(|| RpcError::Server { code: -22, message: "TX decode failed".into() })?;
        if tx.signed_by_me {
            return Ok(raw_tx.to_string());
        }
        let signed = format!("{raw_tx}+sig");
        txs.insert(signed.clone(), MockTx { sigs: tx.sigs + 1, signed_by_me: true, ..tx });
        Ok(signed)
    }

    async fn multisig_address(&self, _min_sigs: u32, _pubkeys: &[String]) -> Result<MultisigAddress, RpcError> {
        self.reachable()?;
        Ok(MultisigAddress { address: MULTISIG.into(), redeem_script: REDEEM.into() })
    }

    async fn add_multisig_address(&self, _min_sigs: u32, _pubkeys: &[String]) -> Result<MultisigAddress, RpcError> {
        self.reachable()?;
        if self.refuse_multisig.load(Ordering::SeqCst) {
            return Err(RpcError::Server { code: -5, message: "Invalid public key".into() });
        }
        self.multisig_imports.fetch_add(1, Ordering::SeqCst);
        Ok(MultisigAddress { address: MULTISIG.into(), redeem_script: REDEEM.into() })
    }

    async fn addresses_for_redeem(&self, redeem_script: &str) -> Result<Vec<String>, RpcError> {
        self.reachable()?;
        self.redeem
            .lock()
            .unwrap()
            .get(redeem_script)
            .cloned()
            .ok_or_else(|| RpcError::Server { code: -8, message: "unknown script".into() })
    }

    async fn address_for_redeem(&self, redeem_script: &str) -> Result<String, RpcError> {
        self.reachable()?;
        if self.redeem.lock().unwrap().contains_key(redeem_script) {
            Ok(format!("3P2sh{redeem_script}"))
        } else {
            Err(RpcError::Server { code: -8, message: "unknown script".into() })
        }
    }

    async fn address_is_mine(&self, address: &str) -> Result<bool, RpcError> {
        self.reachable()?;
        Ok(self.mine.lock().unwrap().contains(address))
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        self.reachable()?;
        Ok("1FreshWalletAddr".into())
    }
}

/// Messaging double: `push` queues inbound messages, everything sent is recorded.
#[derive(Default)]
pub struct RecordingMessenger {
    inbox: Mutex<VecDeque<InboundMessage>>,
    sent: Mutex<Vec<(Option<String>, Subject, String)>>,
    fail_sends: AtomicU32,
}

impl RecordingMessenger {
    pub fn push(&self, from: &str, timestamp: u64, payload: &str) {
        self.inbox.lock().unwrap().push_back(InboundMessage {
            from_address: from.to_string(),
            timestamp,
            subject: Subject::TransactionRequest.as_str().to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn push_message(&self, msg: InboundMessage) {
        self.inbox.lock().unwrap().push_back(msg);
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Payloads broadcast under `subject`.
    pub fn broadcasts(&self, subject: Subject) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, s, _)| to.is_none() && *s == subject)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    /// `(recipient, payload)` of direct sends under `subject`.
    pub fn direct(&self, subject: Subject) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(to, s, p)| match to {
                Some(to) if *s == subject => Some((to.clone(), p.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, to: Option<&str>, subject: Subject, payload: &str) -> Result<(), MessagingError> {
        let left = self.fail_sends.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_sends.store(left - 1, Ordering::SeqCst);
            return Err(MessagingError::Closed);
        }
        self.sent.lock().unwrap().push((to.map(str::to_string), subject, payload.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Messaging for RecordingMessenger {
    fn local_address(&self) -> String {
        "12D3KooWTestOracle".into()
    }

    async fn poll(&self, max: usize) -> Result<Vec<InboundMessage>, MessagingError> {
        let mut inbox = self.inbox.lock().unwrap();
        let n = max.min(inbox.len());
        Ok(inbox.drain(..n).collect())
    }

    async fn broadcast(&self, subject: Subject, payload: &str) -> Result<(), MessagingError> {
        self.record(None, subject, payload)
    }

    async fn send(&self, address: &str, subject: Subject, payload: &str) -> Result<(), MessagingError> {
        self.record(Some(address), subject, payload)
    }
}

/// Request payload in the single-transaction shape.
pub fn single_request(raw: &str, locktime: u64, condition: &str) -> String {
    json!({
        "operation": "transaction",
        "raw_transaction": raw,
        "prevtx": [prevout()],
        "pubkey_json": ["02aa", "02bb", "02cc"],
        "req_sigs": 2,
        "locktime": locktime,
        "condition": condition,
    })
    .to_string()
}

/// Request payload in the batched shape.
pub fn batched_request(raws: &[&str], locktime: u64, condition: &str) -> String {
    json!({
        "operation": "transaction",
        "transactions": raws.iter().map(|raw| json!({
            "raw_transaction": raw,
            "prevtx": [prevout()],
        })).collect::<Vec<_>>(),
        "pubkey_json": ["02aa", "02bb", "02cc"],
        "req_sigs": "2",
        "locktime": locktime,
        "condition": condition,
    })
    .to_string()
}

fn prevout() -> Value {
    json!({ "txid": "fb1c00", "vout": 0, "redeemScript": REDEEM, "scriptPubKey": "a914ee87" })
}

pub fn open_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("oracle_db");
    let store = Arc::new(Store::open(path.to_str().unwrap()).expect("Failed to open store"));
    (dir, store)
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<Store>,
    pub rpc: Arc<MockRpc>,
    pub messenger: Arc<RecordingMessenger>,
    pub metrics: Arc<Metrics>,
    pub oracle: Oracle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(OracleSettings::new(ORACLE_ADDRESS))
    }

    pub fn with_settings(settings: OracleSettings) -> Self {
        let (dir, store) = open_store();
        let rpc = Arc::new(MockRpc::new());
        let messenger = Arc::new(RecordingMessenger::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let oracle = Oracle::new(
            store.clone(),
            rpc.clone(),
            messenger.clone(),
            Arc::new(BasicEvaluator),
            settings,
            LoopSettings { max_retries: 3, ..LoopSettings::default() },
            metrics.clone(),
        );
        Self { dir, store, rpc, messenger, metrics, oracle }
    }

    pub fn inbound(&self, from: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            from_address: from.to_string(),
            timestamp: 1,
            subject: Subject::TransactionRequest.as_str().to_string(),
            payload: payload.to_string(),
        }
    }
}
