//! Application-facing callbacks.

use std::net::SocketAddr;

use huddle_common::Message;
use tokio::sync::mpsc;

/// Status notifications surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Member finished its handshake; `local_address` is ours on the group network
    Connected { local_address: String },
    /// Member connection ended
    Disconnected { reason: String },
    /// Member could not open its socket
    ConnectionFailed { reason: String },
    /// Member handshake was refused or timed out
    AuthenticationFailed { reason: String },
    /// Coordinator is accepting connections
    Listening { address: SocketAddr },
    /// Coordinator admitted a member
    PeerAuthenticated { peer: SocketAddr, identifier: String },
    /// Coordinator refused a member's handshake
    PeerRejected { peer: SocketAddr, reason: String },
    /// A member left the coordinator's table
    PeerDisconnected { peer: SocketAddr },
    /// An authenticated frame could not be decrypted or parsed
    FrameDropped { peer: Option<SocketAddr>, reason: String },
}

/// Receives decrypted messages and status changes.
///
/// Called from connection tasks; implementations must not block.
pub trait NetworkEvents: Send + Sync + 'static {
    /// A decrypted, authenticated, non-control message arrived.
    fn on_content(&self, message: Message);

    fn on_status(&self, status: StatusEvent) {
        let _ = status;
    }
}

/// Everything a [`ChannelEvents`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Content(Message),
    Status(StatusEvent),
}

/// Forwards callbacks into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NetworkEvents for ChannelEvents {
    fn on_content(&self, message: Message) {
        let _ = self.tx.send(NetworkEvent::Content(message));
    }

    fn on_status(&self, status: StatusEvent) {
        let _ = self.tx.send(NetworkEvent::Status(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_events_forward_in_order() {
        let (events, mut rx) = ChannelEvents::new();
        events.on_status(StatusEvent::Connected {
            local_address: "10.0.0.2".into(),
        });
        events.on_content(Message::new("hi", "10.0.0.3"));

        assert!(matches!(
            rx.try_recv(),
            Ok(NetworkEvent::Status(StatusEvent::Connected { .. }))
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            NetworkEvent::Content(Message::new("hi", "10.0.0.3"))
        );
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (events, rx) = ChannelEvents::new();
        drop(rx);
        events.on_content(Message::new("hi", "10.0.0.3"));
    }
}
