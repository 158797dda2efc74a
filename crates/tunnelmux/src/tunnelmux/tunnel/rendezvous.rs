//! UDP rendezvous and hole punching for p2p tunnels.
//!
//! ```text
//! hello  (peer -> server): "TMPH" | role u8 (1 visitor, 2 provider) | ticket
//! answer (server -> peer): "TMPA" | observed address of the other role (utf-8)
//! punch  (peer -> peer):   "TMPP" | 1 syn / 2 ack
//! ```
//!
//! All datagrams are shorter than a KCP segment header, so a KCP endpoint
//! later bound to the same socket discards late strays.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use rand::{RngExt, rng};
use thiserror::Error;
use tokio::{net::UdpSocket, sync::watch};

use crate::tunnelmux::net;

const MAGIC_HELLO: &[u8; 4] = b"TMPH";
const MAGIC_ANSWER: &[u8; 4] = b"TMPA";
const MAGIC_PUNCH: &[u8; 4] = b"TMPP";
const PUNCH_SYN: u8 = 1;
const PUNCH_ACK: u8 = 2;

pub const TICKET_TTL: Duration = Duration::from_secs(30);
const HELLO_ATTEMPTS: usize = 20;
const HELLO_WAIT: Duration = Duration::from_millis(500);
const PUNCH_WAIT: Duration = Duration::from_millis(300);
const EXTRA_ACKS: usize = 3;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("no answer from rendezvous server")]
    Timeout,
    #[error("peer did not answer punching")]
    PunchTimeout,
    #[error("bad rendezvous answer")]
    BadAnswer,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerRole {
    Visitor = 1,
    Provider = 2,
}

pub fn new_ticket() -> String {
    let t: u128 = rng().random();
    format!("{t:032x}")
}

#[derive(Debug)]
struct TicketState {
    created: Instant,
    visitor: Option<SocketAddr>,
    provider: Option<SocketAddr>,
}

/// Matches the two peers of a ticket and tells each the other's observed
/// address. Only tickets issued through [`RendezvousServer::issue`] are served.
pub struct RendezvousServer {
    sock: UdpSocket,
    tickets: Mutex<HashMap<String, TicketState>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RendezvousServer {
    pub async fn bind(addr: &str) -> anyhow::Result<Arc<Self>> {
        let sock = UdpSocket::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        Ok(Arc::new(Self {
            sock,
            tickets: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr().ok()
    }

    pub fn issue(&self, ticket: &str) {
        lock(&self.tickets).insert(
            ticket.to_string(),
            TicketState {
                created: Instant::now(),
                visitor: None,
                provider: None,
            },
        );
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; 1500];
        let mut sweep = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => self.expire(),
                res = self.sock.recv_from(&mut buf) => {
                    match res {
                        Ok((n, from)) => self.on_datagram(&buf[..n], net::canonical(from)).await,
                        Err(err) => tracing::debug!(err=%err, "rendezvous: recv failed"),
                    }
                }
            }
        }
    }

    fn expire(&self) {
        lock(&self.tickets).retain(|_, t| t.created.elapsed() < TICKET_TTL);
    }

    async fn on_datagram(&self, pkt: &[u8], from: SocketAddr) {
        if pkt.len() < 6 || &pkt[..4] != MAGIC_HELLO {
            return;
        }
        let role = match pkt[4] {
            1 => PeerRole::Visitor,
            2 => PeerRole::Provider,
            _ => return,
        };
        let ticket = String::from_utf8_lossy(&pkt[5..]).into_owned();

        let pair = {
            let mut tickets = lock(&self.tickets);
            let Some(t) = tickets.get_mut(&ticket) else {
                return;
            };
            if t.created.elapsed() >= TICKET_TTL {
                tickets.remove(&ticket);
                return;
            }
            match role {
                PeerRole::Visitor => t.visitor = Some(from),
                PeerRole::Provider => t.provider = Some(from),
            }
            t.visitor.zip(t.provider)
        };

        // Answer both sides on every hello once matched; hellos are retried
        // until an answer arrives, so a lost answer heals itself.
        if let Some((visitor, provider)) = pair {
            tracing::debug!(ticket=%ticket, visitor=%visitor, provider=%provider, "rendezvous: peers matched");
            let _ = self.sock.send_to(&answer(provider), visitor).await;
            let _ = self.sock.send_to(&answer(visitor), provider).await;
        }
    }
}

fn answer(addr: SocketAddr) -> Vec<u8> {
    let mut b = MAGIC_ANSWER.to_vec();
    b.extend_from_slice(addr.to_string().as_bytes());
    b
}

fn hello(role: PeerRole, ticket: &str) -> Vec<u8> {
    let mut b = MAGIC_HELLO.to_vec();
    b.push(role as u8);
    b.extend_from_slice(ticket.as_bytes());
    b
}

/// Sends hellos to the rendezvous server until it reports the other peer's
/// observed address.
pub async fn exchange(
    sock: &UdpSocket,
    server: SocketAddr,
    role: PeerRole,
    ticket: &str,
) -> Result<SocketAddr, RendezvousError> {
    let pkt = hello(role, ticket);
    let mut buf = [0u8; 512];
    for _ in 0..HELLO_ATTEMPTS {
        sock.send_to(&pkt, server).await?;
        let deadline = tokio::time::Instant::now() + HELLO_WAIT;
        loop {
            let res = tokio::time::timeout_at(deadline, sock.recv_from(&mut buf)).await;
            let Ok(res) = res else { break };
            let (n, from) = res?;
            if net::canonical(from) != net::canonical(server) || n < 5 || &buf[..4] != MAGIC_ANSWER {
                continue;
            }
            let text = std::str::from_utf8(&buf[4..n]).map_err(|_| RendezvousError::BadAnswer)?;
            let peer: SocketAddr = text.parse().map_err(|_| RendezvousError::BadAnswer)?;
            return Ok(net::canonical(peer));
        }
    }
    Err(RendezvousError::Timeout)
}

/// Opens the NAT path towards `peer` using `sock`. Succeeds once anything
/// punch-shaped arrives from the peer; at most `attempts` rounds.
pub async fn punch(sock: &UdpSocket, peer: SocketAddr, attempts: usize) -> Result<(), RendezvousError> {
    let syn = [MAGIC_PUNCH[0], MAGIC_PUNCH[1], MAGIC_PUNCH[2], MAGIC_PUNCH[3], PUNCH_SYN];
    let ack = [MAGIC_PUNCH[0], MAGIC_PUNCH[1], MAGIC_PUNCH[2], MAGIC_PUNCH[3], PUNCH_ACK];
    let mut buf = [0u8; 512];

    for attempt in 1..=attempts {
        sock.send_to(&syn, peer).await?;
        let deadline = tokio::time::Instant::now() + PUNCH_WAIT;
        loop {
            let Ok(res) = tokio::time::timeout_at(deadline, sock.recv_from(&mut buf)).await else {
                break;
            };
            let (n, from) = res?;
            if net::canonical(from) != peer || n != 5 || &buf[..4] != MAGIC_PUNCH {
                continue;
            }
            for _ in 0..EXTRA_ACKS {
                sock.send_to(&ack, peer).await?;
            }
            tracing::debug!(peer=%peer, attempt, "rendezvous: punched");
            return Ok(());
        }
    }
    Err(RendezvousError::PunchTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_learn_each_other_and_punch_over_loopback() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.clone().run(stop_rx));

        let ticket = new_ticket();
        server.issue(&ticket);

        let v = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let p = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let v_addr = v.local_addr().unwrap();
        let p_addr = p.local_addr().unwrap();

        let t2 = ticket.clone();
        let provider = tokio::spawn(async move {
            let peer = exchange(&p, server_addr, PeerRole::Provider, &t2).await.unwrap();
            punch(&p, peer, 10).await.unwrap();
            peer
        });

        let peer = exchange(&v, server_addr, PeerRole::Visitor, &ticket).await.unwrap();
        assert_eq!(peer, p_addr);
        punch(&v, peer, 10).await.unwrap();
        assert_eq!(provider.await.unwrap(), v_addr);
    }

    #[tokio::test]
    async fn unissued_ticket_gets_no_answer() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.clone().run(stop_rx));

        let v = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(2),
            exchange(&v, server_addr, PeerRole::Visitor, "nope"),
        )
        .await;
        // Either still retrying when the outer timeout fires or gave up.
        assert!(!matches!(res, Ok(Ok(_))));
    }
}
