use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use sluice_core::{ItemHash, PeerId};
use thiserror::Error;

/// Coarse per-transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitHealthSnapshot {
    pub requests_sent: u64,
    pub requests_failed: u64,
    pub hashes_requested: u64,
    pub last_error: Option<String>,
}

/// Errors produced by the bundled transport implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmitError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("outbound queue full")]
    QueueFull,
    #[error("transport closed")]
    Closed,
}

/// Why the admission layer asks the transport to drop a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// Cost-weighted reject ratio stayed above the sustained threshold.
    SustainedRejects { ratio: f64, batches: usize },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::SustainedRejects { ratio, batches } => write!(
                f,
                "reject ratio {ratio:.3} sustained over {batches} batches"
            ),
        }
    }
}

/// Wire-send capability used by the request scheduler.
///
/// Implementations must not block: a call either hands the request to the
/// wire layer or fails immediately. Failure is treated by the fetcher as an
/// immediate timeout of the issued batch.
pub trait RequestTransport {
    /// Transport-specific send error.
    type Error: fmt::Display;

    /// Asks `peer` for the payloads behind `hashes`.
    fn request(&mut self, peer: &PeerId, hashes: &[ItemHash]) -> Result<(), Self::Error>;

    /// Best-effort health counters for policy/ops decisions.
    fn health_snapshot(&self) -> TransmitHealthSnapshot {
        TransmitHealthSnapshot::default()
    }
}

/// Penalize/disconnect capability invoked by the abuse mitigation policy.
///
/// The return value is never observed; implementations must not block.
pub trait PeerDisconnector {
    fn disconnect(&mut self, peer: &PeerId, reason: &DisconnectReason);
}

#[derive(Debug, Default)]
struct InMemoryTransportInner {
    sent: Vec<(PeerId, Vec<ItemHash>)>,
    failing: HashSet<PeerId>,
    health: TransmitHealthSnapshot,
}

/// In-memory transport for tests and simulations.
///
/// Clones share the same outbound log, so a test can keep one handle while
/// the fetcher owns another.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<InMemoryTransportInner>>,
}

impl InMemoryTransport {
    fn lock(&self) -> MutexGuard<'_, InMemoryTransportInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drains and returns all requests captured so far.
    pub fn take_sent(&self) -> Vec<(PeerId, Vec<ItemHash>)> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Number of captured requests not yet drained.
    pub fn sent_len(&self) -> usize {
        self.lock().sent.len()
    }

    /// If enabled, every request to `peer` fails.
    pub fn set_failing(&self, peer: impl Into<PeerId>, failing: bool) {
        let peer = peer.into();
        let mut inner = self.lock();
        if failing {
            inner.failing.insert(peer);
        } else {
            inner.failing.remove(&peer);
        }
    }
}

impl RequestTransport for InMemoryTransport {
    type Error = TransmitError;

    fn request(&mut self, peer: &PeerId, hashes: &[ItemHash]) -> Result<(), Self::Error> {
        let mut inner = self.lock();
        if inner.failing.contains(peer) {
            let err = TransmitError::Unreachable(peer.clone());
            inner.health.requests_failed += 1;
            inner.health.last_error = Some(err.to_string());
            return Err(err);
        }
        inner.health.requests_sent += 1;
        inner.health.hashes_requested += hashes.len() as u64;
        inner.sent.push((peer.clone(), hashes.to_vec()));
        Ok(())
    }

    fn health_snapshot(&self) -> TransmitHealthSnapshot {
        self.lock().health.clone()
    }
}

/// In-memory disconnect recorder for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDisconnector {
    events: Arc<Mutex<Vec<(PeerId, DisconnectReason)>>>,
}

impl InMemoryDisconnector {
    /// Returns every disconnect signal recorded so far.
    pub fn events(&self) -> Vec<(PeerId, DisconnectReason)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether `peer` has been signalled at least once.
    pub fn was_disconnected(&self, peer: &PeerId) -> bool {
        self.events().iter().any(|(p, _)| p == peer)
    }
}

impl PeerDisconnector for InMemoryDisconnector {
    fn disconnect(&mut self, peer: &PeerId, reason: &DisconnectReason) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((peer.clone(), reason.clone()));
    }
}
