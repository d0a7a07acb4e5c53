//! # Prometheus Metrics — Monitor Exposition
//!
//! Monitor metrics in the Prometheus text exposition format. The monitor
//! writes the rendered registry to `metrics_file` after every supervisor tick
//! so node_exporter's textfile collector (or anything else that reads the
//! format) can pick it up.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `foldwatch_messages_received_total` | Counter | `client`, `message_type` | Messages that changed client state |
//! | `foldwatch_clients_connected` | Gauge | — | Sessions with a live socket |
//! | `foldwatch_slot_ppd` | Gauge | `client`, `slot` | Current estimated PPD per slot |
//! | `foldwatch_retrieve_seconds` | Histogram | — | Duration of one retrieve cycle |
//! | `foldwatch_work_units_stored_total` | Counter | `client` | History rows inserted |

use anyhow::{Context, Result};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::path::Path;
use std::sync::atomic::AtomicU64;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct MessageLabel {
    pub client: String,
    pub message_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct SlotLabel {
    pub client: String,
    pub slot: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ClientLabel {
    pub client: String,
}

/// Thread-safe metrics registry shared by every session.
pub struct Metrics {
    pub registry: Registry,
    pub messages_received: Family<MessageLabel, Counter>,
    pub clients_connected: Gauge,
    pub slot_ppd: Family<SlotLabel, Gauge<f64, AtomicU64>>,
    pub retrieve_seconds: Histogram,
    pub work_units_stored: Family<ClientLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let messages_received = Family::<MessageLabel, Counter>::default();
        registry.register(
            "foldwatch_messages_received",
            "Client messages that changed cached state",
            messages_received.clone(),
        );

        let clients_connected = Gauge::default();
        registry.register(
            "foldwatch_clients_connected",
            "Number of client sessions with a live socket",
            clients_connected.clone(),
        );

        let slot_ppd = Family::<SlotLabel, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "foldwatch_slot_ppd",
            "Estimated points per day for the slot's current work unit",
            slot_ppd.clone(),
        );

        let retrieve_seconds = Histogram::new(exponential_buckets(0.001, 4.0, 8));
        registry.register(
            "foldwatch_retrieve_seconds",
            "Duration of one client retrieve cycle",
            retrieve_seconds.clone(),
        );

        let work_units_stored = Family::<ClientLabel, Counter>::default();
        registry.register(
            "foldwatch_work_units_stored",
            "Work units inserted into history",
            work_units_stored.clone(),
        );

        Self {
            registry,
            messages_received,
            clients_connected,
            slot_ppd,
            retrieve_seconds,
            work_units_stored,
        }
    }

    pub fn record_message(&self, client: &str, message_type: &str) {
        self.messages_received
            .get_or_create(&MessageLabel {
                client: client.to_string(),
                message_type: message_type.to_string(),
            })
            .inc();
    }

    pub fn set_slot_ppd(&self, client: &str, slot: &str, ppd: f64) {
        self.slot_ppd
            .get_or_create(&SlotLabel {
                client: client.to_string(),
                slot: slot.to_string(),
            })
            .set(ppd);
    }

    pub fn record_stored(&self, client: &str, rows: u64) {
        self.work_units_stored
            .get_or_create(&ClientLabel {
                client: client.to_string(),
            })
            .inc_by(rows);
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).context("failed to encode metrics")?;
        Ok(buf)
    }

    /// Write the rendered registry to `path`, replacing it atomically.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.encode()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_returns_valid_text() {
        let m = Metrics::new();
        m.clients_connected.set(2);
        m.record_message("rig", "units");
        m.set_slot_ppd("rig", "00", 123456.0);

        let output = m.encode().unwrap();
        assert!(output.contains("foldwatch_clients_connected 2"));
        assert!(output.contains("foldwatch_messages_received_total"));
        assert!(output.contains("message_type=\"units\""));
        assert!(output.contains("foldwatch_slot_ppd"));
        assert!(output.contains("slot=\"00\""));
    }

    #[test]
    fn metrics_per_client_counters_independent() {
        let m = Metrics::new();
        m.record_stored("rig", 3);
        m.record_stored("laptop", 1);
        let output = m.encode().unwrap();
        assert!(output.contains("foldwatch_work_units_stored_total{client=\"rig\"} 3"));
        assert!(output.contains("foldwatch_work_units_stored_total{client=\"laptop\"} 1"));
    }

    #[test]
    fn textfile_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foldwatch.prom");
        let m = Metrics::new();
        m.retrieve_seconds.observe(0.25);
        m.write_textfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("foldwatch_retrieve_seconds_count 1"));
    }
}
