//! Shared registry of dependency health, fed by the periodic probes and
//! read by the gateway's health endpoint.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;

/// Outcome of a single dependency probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub up: bool,
    pub latency_ms: u64,
    pub checked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn up(latency_ms: u64) -> Self {
        Self {
            up: true,
            latency_ms,
            checked_at: Utc::now().to_rfc3339(),
            detail: None,
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            up: false,
            latency_ms: 0,
            checked_at: Utc::now().to_rfc3339(),
            detail: Some(detail.into()),
        }
    }
}

/// Last-known health per dependency name ("bus", "docstore", "relational").
#[derive(Default)]
pub struct HealthRegistry {
    inner: RwLock<HashMap<&'static str, ProbeResult>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &'static str, result: ProbeResult) {
        self.inner
            .write()
            .expect("health registry poisoned")
            .insert(name, result);
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("health registry poisoned")
            .get(name)
            .map(|r| r.up)
            .unwrap_or(false)
    }

    /// Serializable snapshot for the health endpoint.
    pub fn snapshot(&self) -> HashMap<String, ProbeResult> {
        self.inner
            .read()
            .expect("health registry poisoned")
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_back() {
        let reg = HealthRegistry::new();
        assert!(!reg.is_up("docstore"));

        reg.record("docstore", ProbeResult::up(3));
        assert!(reg.is_up("docstore"));

        reg.record("docstore", ProbeResult::down("locked"));
        assert!(!reg.is_up("docstore"));
        let snap = reg.snapshot();
        assert_eq!(snap["docstore"].detail.as_deref(), Some("locked"));
    }
}
