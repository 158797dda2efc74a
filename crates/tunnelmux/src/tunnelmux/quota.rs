//! Per-client connection and flow limits consulted before a public
//! connection is relayed.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("client {client:?} reached its connection limit ({limit})")]
    ConnectionLimitExceeded { client: String, limit: usize },
    #[error("client {client:?} exhausted its flow limit")]
    FlowExceeded { client: String },
}

pub trait QuotaOracle: Send + Sync {
    /// Reserves one connection slot for `client`.
    fn check_and_reserve(&self, client: &str) -> Result<(), QuotaError>;
    fn release(&self, client: &str);
    fn record_flow(&self, client: &str, inbound: u64, outbound: u64);
}

/// Holds a reservation for the life of one connection.
pub struct QuotaPermit {
    oracle: Arc<dyn QuotaOracle>,
    client: String,
}

impl QuotaPermit {
    pub fn acquire(oracle: Arc<dyn QuotaOracle>, client: &str) -> Result<Self, QuotaError> {
        oracle.check_and_reserve(client)?;
        Ok(Self {
            oracle,
            client: client.to_string(),
        })
    }

    pub fn record_flow(&self, inbound: u64, outbound: u64) {
        self.oracle.record_flow(&self.client, inbound, outbound);
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.oracle.release(&self.client);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientLimits {
    /// 0 means unlimited.
    pub max_conn: usize,
    /// Total bytes in both directions; 0 means unlimited.
    pub flow_limit: u64,
}

#[derive(Debug, Default)]
struct Counters {
    limits: ClientLimits,
    active: AtomicUsize,
    inbound: AtomicU64,
    outbound: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QuotaSnapshot {
    pub client_id: String,
    pub active: usize,
    pub max_conn: usize,
    pub inbound: u64,
    pub outbound: u64,
    pub flow_limit: u64,
}

/// In-memory quota table built from the configured clients. Unknown clients
/// are unlimited.
#[derive(Debug, Default)]
pub struct ClientQuotas {
    clients: HashMap<String, Counters>,
}

impl ClientQuotas {
    pub fn new<I, S>(limits: I) -> Self
    where
        I: IntoIterator<Item = (S, ClientLimits)>,
        S: Into<String>,
    {
        let clients = limits
            .into_iter()
            .map(|(id, limits)| {
                (
                    id.into(),
                    Counters {
                        limits,
                        ..Counters::default()
                    },
                )
            })
            .collect();
        Self { clients }
    }

    pub fn snapshot(&self) -> Vec<QuotaSnapshot> {
        let mut out: Vec<QuotaSnapshot> = self
            .clients
            .iter()
            .map(|(id, c)| QuotaSnapshot {
                client_id: id.clone(),
                active: c.active.load(Ordering::Relaxed),
                max_conn: c.limits.max_conn,
                inbound: c.inbound.load(Ordering::Relaxed),
                outbound: c.outbound.load(Ordering::Relaxed),
                flow_limit: c.limits.flow_limit,
            })
            .collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }
}

impl QuotaOracle for ClientQuotas {
    fn check_and_reserve(&self, client: &str) -> Result<(), QuotaError> {
        let Some(c) = self.clients.get(client) else {
            return Ok(());
        };

        if c.limits.flow_limit > 0 {
            let used = c.inbound.load(Ordering::Relaxed) + c.outbound.load(Ordering::Relaxed);
            if used >= c.limits.flow_limit {
                return Err(QuotaError::FlowExceeded {
                    client: client.to_string(),
                });
            }
        }

        let limit = c.limits.max_conn;
        let reserved = c.active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            if limit > 0 && n >= limit { None } else { Some(n + 1) }
        });
        match reserved {
            Ok(_) => Ok(()),
            Err(_) => Err(QuotaError::ConnectionLimitExceeded {
                client: client.to_string(),
                limit,
            }),
        }
    }

    fn release(&self, client: &str) {
        if let Some(c) = self.clients.get(client) {
            let _ = c
                .active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn record_flow(&self, client: &str, inbound: u64, outbound: u64) {
        if let Some(c) = self.clients.get(client) {
            c.inbound.fetch_add(inbound, Ordering::Relaxed);
            c.outbound.fetch_add(outbound, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas(max_conn: usize, flow_limit: u64) -> Arc<dyn QuotaOracle> {
        Arc::new(ClientQuotas::new([("c1", ClientLimits { max_conn, flow_limit })]))
    }

    #[test]
    fn n_plus_one_connection_is_rejected_and_existing_survive() {
        let q = quotas(3, 0);
        let permits: Vec<QuotaPermit> = (0..3).map(|_| QuotaPermit::acquire(q.clone(), "c1").unwrap()).collect();

        let err = QuotaPermit::acquire(q.clone(), "c1").err().unwrap();
        assert_eq!(
            err,
            QuotaError::ConnectionLimitExceeded {
                client: "c1".into(),
                limit: 3
            }
        );
        assert_eq!(permits.len(), 3);

        drop(permits);
        assert!(QuotaPermit::acquire(q, "c1").is_ok());
    }

    #[test]
    fn flow_limit_blocks_new_connections_once_used_up() {
        let q = quotas(0, 100);
        let p = QuotaPermit::acquire(q.clone(), "c1").unwrap();
        p.record_flow(60, 40);
        drop(p);
        assert!(matches!(
            QuotaPermit::acquire(q, "c1"),
            Err(QuotaError::FlowExceeded { .. })
        ));
    }

    #[test]
    fn unknown_clients_and_zero_limits_are_unlimited() {
        let q = quotas(0, 0);
        let _held: Vec<QuotaPermit> = (0..100).map(|_| QuotaPermit::acquire(q.clone(), "c1").unwrap()).collect();
        assert!(QuotaPermit::acquire(q, "other").is_ok());
    }
}
