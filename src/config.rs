use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

/// Seconds between consecutive oracles' signing turns.
pub const DEFAULT_HEURISTIC_DELAY_SECS: u64 = 180;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub oracle: Oracle,
    #[serde(default)]
    pub bitcoind: Bitcoind,
    pub net: Net,
    pub storage: Storage,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Oracle {
    /// Fee-receiving address of this oracle; resolved at startup when absent.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_fee_minimum")]
    pub fee_minimum: u64,                 // satoshis
    #[serde(default)]
    pub escrow_address: Option<String>,
    #[serde(default)]
    pub escrow_fee_minimum: u64,          // satoshis
    #[serde(default = "default_heuristic_delay")]
    pub heuristic_delay_secs: u64,
    #[serde(default = "default_loop_interval")]
    pub loop_interval_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for Oracle {
    fn default() -> Self {
        Self {
            address: None,
            fee_minimum: default_fee_minimum(),
            escrow_address: None,
            escrow_fee_minimum: 0,
            heuristic_delay_secs: default_heuristic_delay(),
            loop_interval_ms: default_loop_interval(),
            max_batch: default_max_batch(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Bitcoind {
    #[serde(default = "default_rpc_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for Bitcoind {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_rpc_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Net {
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap: Vec<String>,          // multiaddrs
    #[serde(default)]
    pub public_ip: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: false, bind: default_bind() }
    }
}

fn default_fee_minimum() -> u64 { 10_000 }
fn default_heuristic_delay() -> u64 { DEFAULT_HEURISTIC_DELAY_SECS }
fn default_loop_interval() -> u64 { 1_000 }
fn default_max_batch() -> usize { 256 }
fn default_max_retries() -> u32 { 30 }
fn default_rpc_url() -> String { "http://127.0.0.1:8332".into() }
fn default_rpc_timeout() -> u64 { 10 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 500 }
fn default_bind() -> String { "0.0.0.0:9101".into() }

/// Resolved settings shared by every core component.
#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub oracle_address: String,
    pub oracle_fee_minimum: u64,
    pub escrow_address: Option<String>,
    pub escrow_fee_minimum: u64,
    pub heuristic_delay_seconds: u64,
}

impl OracleSettings {
    /// Settings with the documented defaults for everything but the address.
    pub fn new(oracle_address: impl Into<String>) -> Self {
        Self::from_config(&Oracle::default(), oracle_address)
    }

    pub fn from_config(cfg: &Oracle, oracle_address: impl Into<String>) -> Self {
        Self {
            oracle_address: oracle_address.into(),
            oracle_fee_minimum: cfg.fee_minimum,
            escrow_address: cfg.escrow_address.clone(),
            escrow_fee_minimum: cfg.escrow_fee_minimum,
            heuristic_delay_seconds: cfg.heuristic_delay_secs,
        }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text)
        .with_context(|| "invalid TOML in config file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = load_from_str("[net]\nlisten_port = 7100\n[storage]\npath = \"data\"\n").unwrap();
        assert_eq!(cfg.oracle.heuristic_delay_secs, 180);
        assert_eq!(cfg.oracle.loop_interval_ms, 1_000);
        assert_eq!(cfg.bitcoind.url, "http://127.0.0.1:8332");
        assert!(cfg.oracle.address.is_none());
        assert!(!cfg.metrics.enabled);

        let settings = OracleSettings::from_config(&cfg.oracle, "1Oracle");
        assert_eq!(settings.oracle_fee_minimum, 10_000);
        assert_eq!(settings.heuristic_delay_seconds, DEFAULT_HEURISTIC_DELAY_SECS);
    }

    #[test]
    fn missing_sections_are_reported() {
        assert!(load_from_str("[oracle]\nfee_minimum = 1\n").is_err());
    }
}
