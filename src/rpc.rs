//! bitcoind collaborator.
//!
//! [`BitcoinRpc`] is everything the oracle asks of a Bitcoin node.
//! [`BitcoindClient`] speaks JSON-RPC to a real bitcoind and
//! [`RetryingRpc`] wraps any implementation with reconnect-style retries.

use crate::{config, error::RpcError, protocol::PrevOut};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Address and redeem script of an m-of-n multisig.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MultisigAddress {
    pub address: String,
    #[serde(rename = "redeemScript")]
    pub redeem_script: String,
}

#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    /// `decoderawtransaction`; a node refusal means the hex is not a transaction.
    async fn decode(&self, raw_tx: &str) -> Result<Value, RpcError>;

    /// Adds this node's signature where it can; returns the resulting hex.
    async fn sign(&self, raw_tx: &str, prevtx: &[PrevOut]) -> Result<String, RpcError>;

    async fn multisig_address(&self, min_sigs: u32, pubkeys: &[String]) -> Result<MultisigAddress, RpcError>;

    /// Imports the multisig into the node wallet so later `sign` calls can use it.
    async fn add_multisig_address(&self, min_sigs: u32, pubkeys: &[String]) -> Result<MultisigAddress, RpcError>;

    /// Participant addresses of a multisig redeem script, in script order.
    async fn addresses_for_redeem(&self, redeem_script: &str) -> Result<Vec<String>, RpcError>;

    /// P2SH address paying to `redeem_script`.
    async fn address_for_redeem(&self, redeem_script: &str) -> Result<String, RpcError>;

    async fn address_is_mine(&self, address: &str) -> Result<bool, RpcError>;

    async fn new_address(&self) -> Result<String, RpcError>;

    async fn is_valid(&self, raw_tx: &str) -> Result<bool, RpcError> {
        match self.decode(raw_tx).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_transport() => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Signatures present on the least-signed input.
    async fn signature_count(&self, raw_tx: &str, _prevtx: &[PrevOut]) -> Result<u32, RpcError> {
        let decoded = self.decode(raw_tx).await?;
        Ok(count_signatures(&decoded))
    }

    /// Sorted input fingerprints and a canonical summary of the outputs.
    async fn inputs_outputs(&self, raw_tx: &str) -> Result<(Vec<String>, String), RpcError> {
        let decoded = self.decode(raw_tx).await?;
        canonical_inputs_outputs(&decoded)
    }
}

/// Per-input DER signature pushes in `scriptSig.asm`; the minimum over all inputs.
pub fn count_signatures(decoded: &Value) -> u32 {
    let Some(vin) = decoded.get("vin").and_then(Value::as_array) else { return 0 };
    vin.iter()
        .map(|input| {
            let asm = input
                .get("scriptSig")
                .and_then(|s| s.get("asm"))
                .and_then(Value::as_str)
                .unwrap_or("");
            asm.split_whitespace().filter(|tok| is_der_signature(tok)).count() as u32
        })
        .min()
        .unwrap_or(0)
}

fn is_der_signature(token: &str) -> bool {
    // bitcoind renders signatures as "<der hex>[ALL]"
    let hex_part = token.split('[').next().unwrap_or("");
    hex_part.starts_with("30")
        && (18..=146).contains(&hex_part.len())
        && hex::decode(hex_part).is_ok()
}

/// Input fingerprints are `{"txid","vout"}` JSON strings, sorted. Outputs are
/// summarized as a sorted list of `{value, addresses}` entries.
pub fn canonical_inputs_outputs(decoded: &Value) -> Result<(Vec<String>, String), RpcError> {
    let vin = decoded
        .get("vin")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::Malformed("decoded transaction has no vin".into()))?;
    let vout = decoded
        .get("vout")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::Malformed("decoded transaction has no vout".into()))?;

    let mut inputs = Vec::with_capacity(vin.len());
    for input in vin {
        let txid = input
            .get("txid")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Malformed("input without txid".into()))?;
        let n = input
            .get("vout")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::Malformed("input without vout".into()))?;
        inputs.push(json!({ "txid": txid, "vout": n }).to_string());
    }
    inputs.sort();

    let mut outputs: Vec<(u64, Vec<String>)> = vout
        .iter()
        .map(|o| (output_value_sats(o).unwrap_or(0), output_addresses(o)))
        .collect();
    outputs.sort();
    let summary = json!({
        "vout": outputs
            .iter()
            .map(|(value, addresses)| json!({ "value": value, "addresses": addresses }))
            .collect::<Vec<_>>()
    });
    Ok((inputs, summary.to_string()))
}

/// Output value in satoshis.
pub fn output_value_sats(output: &Value) -> Option<u64> {
    let btc = output.get("value")?.as_f64()?;
    if btc < 0.0 { return None; }
    Some((btc * 100_000_000.0).round() as u64)
}

/// Addresses an output pays to; handles both the legacy `addresses` list and
/// the single `address` field of newer nodes.
pub fn output_addresses(output: &Value) -> Vec<String> {
    let Some(spk) = output.get("scriptPubKey") else { return Vec::new() };
    if let Some(list) = spk.get("addresses").and_then(Value::as_array) {
        return list.iter().filter_map(|a| a.as_str().map(str::to_string)).collect();
    }
    spk.get("address")
        .and_then(Value::as_str)
        .map(|a| vec![a.to_string()])
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct RpcReply {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client for bitcoind.
pub struct BitcoindClient {
    http: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl BitcoindClient {
    pub fn new(cfg: &config::Bitcoind) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: cfg.url.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let body = json!({ "jsonrpc": "1.0", "id": "escrow-oracle", "method": method, "params": params });
        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(RpcError::Transport(format!("bitcoind rejected credentials ({})", resp.status())));
        }
        let reply: RpcReply = resp
            .json()
            .await
            .map_err(|e| RpcError::Malformed(format!("{method}: {e}")))?;
        if let Some(err) = reply.error {
            return Err(RpcError::Server { code: err.code, message: err.message });
        }
        reply.result.ok_or_else(|| RpcError::Malformed(format!("{method}: empty result")))
    }

    /// Legacy address of a single public key via its `pkh()` descriptor.
    async fn address_for_pubkey(&self, pubkey: &str) -> Result<String, RpcError> {
        let info = self.call("getdescriptorinfo", vec![json!(format!("pkh({pubkey})"))]).await?;
        let descriptor = info
            .get("descriptor")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Malformed("getdescriptorinfo: no descriptor".into()))?;
        let derived = self.call("deriveaddresses", vec![json!(descriptor)]).await?;
        derived
            .get(0)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("deriveaddresses: empty".into()))
    }
}

fn parse_multisig(value: Value) -> Result<MultisigAddress, RpcError> {
    // Old nodes answer addmultisigaddress with a bare address string
    if let Some(address) = value.as_str() {
        return Ok(MultisigAddress { address: address.to_string(), redeem_script: String::new() });
    }
    serde_json::from_value(value).map_err(|e| RpcError::Malformed(e.to_string()))
}

#[async_trait]
impl BitcoinRpc for BitcoindClient {
    async fn decode(&self, raw_tx: &str) -> Result<Value, RpcError> {
        self.call("decoderawtransaction", vec![json!(raw_tx)]).await
    }

    async fn sign(&self, raw_tx: &str, prevtx: &[PrevOut]) -> Result<String, RpcError> {
        let prevtx = serde_json::to_value(prevtx).map_err(|e| RpcError::Malformed(e.to_string()))?;
        let signed = self.call("signrawtransactionwithwallet", vec![json!(raw_tx), prevtx]).await?;
        signed
            .get("hex")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("signrawtransactionwithwallet: no hex".into()))
    }

    async fn multisig_address(&self, min_sigs: u32, pubkeys: &[String]) -> Result<MultisigAddress, RpcError> {
        parse_multisig(self.call("createmultisig", vec![json!(min_sigs), json!(pubkeys)]).await?)
    }

    async fn add_multisig_address(&self, min_sigs: u32, pubkeys: &[String]) -> Result<MultisigAddress, RpcError> {
        parse_multisig(self.call("addmultisigaddress", vec![json!(min_sigs), json!(pubkeys)]).await?)
    }

    async fn addresses_for_redeem(&self, redeem_script: &str) -> Result<Vec<String>, RpcError> {
        let script = self.call("decodescript", vec![json!(redeem_script)]).await?;
        if let Some(list) = script.get("addresses").and_then(Value::as_array) {
            return Ok(list.iter().filter_map(|a| a.as_str().map(str::to_string)).collect());
        }
        // Newer nodes only expose the keys in the asm
        let asm = script.get("asm").and_then(Value::as_str).unwrap_or("");
        let mut addresses = Vec::new();
        for token in asm.split_whitespace() {
            let is_pubkey = (token.len() == 66 || token.len() == 130) && hex::decode(token).is_ok();
            if is_pubkey {
                addresses.push(self.address_for_pubkey(token).await?);
            }
        }
        Ok(addresses)
    }

    async fn address_for_redeem(&self, redeem_script: &str) -> Result<String, RpcError> {
        let script = self.call("decodescript", vec![json!(redeem_script)]).await?;
        script
            .get("p2sh")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("decodescript: no p2sh address".into()))
    }

    async fn address_is_mine(&self, address: &str) -> Result<bool, RpcError> {
        let info = self.call("getaddressinfo", vec![json!(address)]).await?;
        Ok(info.get("ismine").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        let addr = self.call("getnewaddress", vec![json!(""), json!("legacy")]).await?;
        addr.as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("getnewaddress: not a string".into()))
    }
}

/// Retries transport failures of the wrapped client with exponential backoff.
/// Every other outcome is passed through untouched.
pub struct RetryingRpc<R> {
    inner: R,
    attempts: u32,
    backoff: Duration,
}

impl<R: BitcoinRpc> RetryingRpc<R> {
    pub fn new(inner: R, attempts: u32, backoff: Duration) -> Self {
        Self { inner, attempts: attempts.max(1), backoff }
    }

    pub fn from_config(inner: R, cfg: &config::Bitcoind) -> Self {
        Self::new(inner, cfg.retry_attempts, Duration::from_millis(cfg.retry_backoff_ms))
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn retry<'a, T, F, Fut>(&'a self, what: &str, op: F) -> Result<T, RpcError>
    where
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'a,
        T: Send,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transport() && attempt < self.attempts => {
                    warn!(call = what, attempt, error = %e, "bitcoind call failed, reconnecting");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => {
                    if attempt > 1 {
                        debug!(call = what, attempt, "bitcoind call finished after retry");
                    }
                    return other;
                }
            }
        }
    }
}

#[async_trait]
impl<R: BitcoinRpc> BitcoinRpc for RetryingRpc<R> {
    async fn decode(&self, raw_tx: &str) -> Result<Value, RpcError> {
        self.retry("decode", || self.inner.decode(raw_tx)).await
    }

    async fn sign(&self, raw_tx: &str, prevtx: &[PrevOut]) -> Result<String, RpcError> {
        self.retry("sign", || self.inner.sign(raw_tx, prevtx)).await
    }

    async fn multisig_address(&self, min_sigs: u32, pubkeys: &[String]) -> Result<MultisigAddress, RpcError> {
        self.retry("multisig_address", || self.inner.multisig_address(min_sigs, pubkeys)).await
    }

    async fn add_multisig_address(&self, min_sigs: u32, pubkeys: &[String]) -> Result<MultisigAddress, RpcError> {
        self.retry("add_multisig_address", || self.inner.add_multisig_address(min_sigs, pubkeys)).await
    }

    async fn addresses_for_redeem(&self, redeem_script: &str) -> Result<Vec<String>, RpcError> {
        self.retry("addresses_for_redeem", || self.inner.addresses_for_redeem(redeem_script)).await
    }

    async fn address_for_redeem(&self, redeem_script: &str) -> Result<String, RpcError> {
        self.retry("address_for_redeem", || self.inner.address_for_redeem(redeem_script)).await
    }

    async fn address_is_mine(&self, address: &str) -> Result<bool, RpcError> {
        self.retry("address_is_mine", || self.inner.address_is_mine(address)).await
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        self.retry("new_address", || self.inner.new_address()).await
    }

    async fn signature_count(&self, raw_tx: &str, prevtx: &[PrevOut]) -> Result<u32, RpcError> {
        self.retry("signature_count", || self.inner.signature_count(raw_tx, prevtx)).await
    }

    async fn inputs_outputs(&self, raw_tx: &str) -> Result<(Vec<String>, String), RpcError> {
        self.retry("inputs_outputs", || self.inner.inputs_outputs(raw_tx)).await
    }
}
