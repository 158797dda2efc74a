use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Global recorder behind `/metrics`. Installing twice fails.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// One public connection currently relayed to a client.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub id: String,
    pub tunnel: String,
    pub client: String,
    pub peer: String,
    pub target: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct ConnRegistry {
    conns: DashMap<String, ConnInfo>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, c: ConnInfo) {
        self.conns.insert(c.id.clone(), c);
    }

    pub fn remove(&self, id: &str) {
        self.conns.remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        let mut out: Vec<ConnInfo> = self.conns.iter().map(|c| c.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_conn_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("c{n}")
}

pub type SharedConns = Arc<ConnRegistry>;
