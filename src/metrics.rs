use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Counters for the oracle control loop. Metric names carry an `oracle_` prefix.
pub struct Metrics {
    registry: Registry,
    pub messages_received: IntCounter,
    pub messages_rejected: IntCounterVec,
    pub tasks_created: IntCounter,
    pub tasks_superseded: IntCounter,
    pub transactions_signed: IntCounter,
    pub conditions_false: IntCounter,
    pub transient_failures: IntCounter,
    pub pending_tasks: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let messages_received = IntCounter::new("oracle_messages_received_total", "Inbound messages processed")?;
        let messages_rejected = IntCounterVec::new(
            Opts::new("oracle_messages_rejected_total", "Inbound messages rejected, by reason"),
            &["reason"],
        )?;
        let tasks_created = IntCounter::new("oracle_tasks_created_total", "Tasks created from requests")?;
        let tasks_superseded = IntCounter::new("oracle_tasks_superseded_total", "Tasks closed by the redundancy filter")?;
        let transactions_signed = IntCounter::new("oracle_transactions_signed_total", "Transactions signed")?;
        let conditions_false = IntCounter::new("oracle_conditions_false_total", "Elected tasks closed because their condition was false")?;
        let transient_failures = IntCounter::new("oracle_transient_failures_total", "Collaborator failures left for retry")?;
        let pending_tasks = IntGauge::new("oracle_pending_tasks", "Tasks not yet done")?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_rejected.clone()))?;
        registry.register(Box::new(tasks_created.clone()))?;
        registry.register(Box::new(tasks_superseded.clone()))?;
        registry.register(Box::new(transactions_signed.clone()))?;
        registry.register(Box::new(conditions_false.clone()))?;
        registry.register(Box::new(transient_failures.clone()))?;
        registry.register(Box::new(pending_tasks.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            messages_rejected,
            tasks_created,
            tasks_superseded,
            transactions_signed,
            conditions_false,
            transient_failures,
            pending_tasks,
        })
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

pub fn serve(cfg: &crate::config::Metrics, metrics: Arc<Metrics>) -> Result<()> {
    let header: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid content-type header"))?;
    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    info!(bind = %cfg.bind, "metrics endpoint listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let buffer = match metrics.render() {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "could not encode metrics");
                    continue;
                }
            };
            let response = tiny_http::Response::from_data(buffer).with_header(header.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_counters() {
        let m = Metrics::new().unwrap();
        m.messages_rejected.with_label_values(&["malformed"]).inc();
        m.tasks_created.inc();
        let text = String::from_utf8(m.render().unwrap()).unwrap();
        assert!(text.contains("oracle_tasks_created_total 1"));
        assert!(text.contains("reason=\"malformed\""));
    }
}
