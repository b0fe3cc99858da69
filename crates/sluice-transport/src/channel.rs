use sluice_core::{ItemHash, PeerId};
use tokio::sync::mpsc;

use crate::adapter::{
    DisconnectReason, PeerDisconnector, RequestTransport, TransmitError, TransmitHealthSnapshot,
};

/// A request handed to the wire layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub peer: PeerId,
    pub hashes: Vec<ItemHash>,
}

/// Transport that forwards requests into a bounded tokio channel drained by
/// the protocol layer's session tasks.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundRequest>,
    health: TransmitHealthSnapshot,
}

impl ChannelTransport {
    /// Creates the transport plus the receiving end for the wire layer.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                health: TransmitHealthSnapshot::default(),
            },
            rx,
        )
    }
}

impl RequestTransport for ChannelTransport {
    type Error = TransmitError;

    fn request(&mut self, peer: &PeerId, hashes: &[ItemHash]) -> Result<(), Self::Error> {
        let msg = OutboundRequest {
            peer: peer.clone(),
            hashes: hashes.to_vec(),
        };
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.health.requests_sent += 1;
                self.health.hashes_requested += hashes.len() as u64;
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    mpsc::error::TrySendError::Full(_) => TransmitError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => TransmitError::Closed,
                };
                self.health.requests_failed += 1;
                self.health.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn health_snapshot(&self) -> TransmitHealthSnapshot {
        self.health.clone()
    }
}

/// Disconnector that forwards penalize signals to the session layer.
#[derive(Debug, Clone)]
pub struct ChannelDisconnector {
    tx: mpsc::UnboundedSender<(PeerId, DisconnectReason)>,
}

impl ChannelDisconnector {
    /// Disconnector plus the receiver that sees every signal.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(PeerId, DisconnectReason)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PeerDisconnector for ChannelDisconnector {
    fn disconnect(&mut self, peer: &PeerId, reason: &DisconnectReason) {
        // Receiver gone means the session layer is shutting down.
        let _ = self.tx.send((peer.clone(), reason.clone()));
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::{ItemHash, PeerId};

    use super::{ChannelDisconnector, ChannelTransport};
    use crate::adapter::{DisconnectReason, PeerDisconnector, RequestTransport, TransmitError};

    #[tokio::test]
    async fn channel_transport_forwards_until_full() {
        let (mut transport, mut rx) = ChannelTransport::new(1);
        let peer = PeerId::from("peer-a");

        transport
            .request(&peer, &[ItemHash([7; 32])])
            .expect("first request fits");
        let err = transport
            .request(&peer, &[ItemHash([8; 32])])
            .expect_err("second request overflows");
        assert_eq!(err, TransmitError::QueueFull);

        let msg = rx.recv().await.expect("request should be queued");
        assert_eq!(msg.peer, peer);
        assert_eq!(msg.hashes, vec![ItemHash([7; 32])]);
        assert_eq!(transport.health_snapshot().requests_failed, 1);
    }

    #[tokio::test]
    async fn channel_transport_reports_closed_receiver() {
        let (mut transport, rx) = ChannelTransport::new(4);
        drop(rx);
        let err = transport
            .request(&PeerId::from("peer-a"), &[ItemHash([1; 32])])
            .expect_err("closed channel should fail");
        assert_eq!(err, TransmitError::Closed);
    }

    #[tokio::test]
    async fn channel_disconnector_forwards_reason() {
        let (mut disconnector, mut rx) = ChannelDisconnector::new();
        disconnector.disconnect(
            &PeerId::from("peer-z"),
            &DisconnectReason::SustainedRejects {
                ratio: 1.0,
                batches: 3,
            },
        );
        let (peer, reason) = rx.recv().await.expect("signal should arrive");
        assert_eq!(peer, PeerId::from("peer-z"));
        assert!(matches!(
            reason,
            DisconnectReason::SustainedRejects { batches: 3, .. }
        ));
    }
}
