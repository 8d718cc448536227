//! Member side: connect to the coordinator, prove the identifier, then chat.

use std::net::SocketAddr;
use std::sync::Arc;

use huddle_common::{Error, Message, NetConfig, Result};
use huddle_crypto::{Initiator, KeyMaterial};
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionState, PeerLink, SecureReader};
use crate::events::{NetworkEvents, StatusEvent};

/// An authenticated member connection.
///
/// Only exists once the handshake has completed. Received messages are
/// delivered to the [`NetworkEvents`] passed to [`Client::connect`] from a
/// dedicated receive task.
pub struct Client {
    identifier: String,
    local_address: String,
    link: PeerLink,
}

impl Client {
    /// Connect to `coordinator` and run the handshake as `identifier`.
    ///
    /// Fails with [`Error::Connection`] if the socket cannot be opened and with
    /// [`Error::Auth`] if the coordinator refuses the handshake or it times out.
    pub async fn connect(
        coordinator: SocketAddr,
        identifier: impl Into<String>,
        config: &NetConfig,
        events: Arc<dyn NetworkEvents>,
    ) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.trim().is_empty() {
            return Err(Error::config("identifier must not be empty"));
        }

        let mut conn = match Connection::connect(coordinator, config).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%coordinator, "connection failed: {e}");
                events.on_status(StatusEvent::ConnectionFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let local_address = conn.local_addr().ip().to_string();
        debug!(%coordinator, %local_address, "socket open, starting handshake");

        let initiator = Initiator::new(identifier.clone(), local_address.clone());
        let keys = match handshake(&mut conn, initiator).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(%coordinator, "handshake failed: {e}");
                conn.close();
                events.on_status(StatusEvent::AuthenticationFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let (link, reader) = conn.authenticate(keys);
        info!(%coordinator, %local_address, "joined group");
        events.on_status(StatusEvent::Connected {
            local_address: local_address.clone(),
        });

        tokio::spawn(receive_loop(reader, events));

        Ok(Self {
            identifier,
            local_address,
            link,
        })
    }

    /// Send `text` to the group.
    pub async fn send(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::protocol("message cannot be empty"));
        }
        self.send_message(&Message::new(text, &self.local_address))
            .await
    }

    /// Send a prepared message as-is.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.link.send(message).await
    }

    /// Our address on the group network.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn coordinator_addr(&self) -> SocketAddr {
        self.link.peer_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        if self.link.close() {
            info!(coordinator = %self.link.peer_addr(), "left group");
        }
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.link.closed().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The receive loop exits once it observes the close.
        self.link.close();
    }
}

async fn handshake(conn: &mut Connection, mut initiator: Initiator) -> Result<KeyMaterial> {
    conn.send_handshake(&initiator.start()?)
        .await
        .map_err(rejected)?;

    let challenge = conn.recv_handshake().await.map_err(rejected)?;
    let response = initiator.answer_challenge(&challenge)?;
    conn.send_handshake(&response).await.map_err(rejected)?;

    let acknowledgement = conn.recv_handshake().await.map_err(rejected)?;
    Ok(initiator.confirm(&acknowledgement)?)
}

/// The coordinator answers a failed handshake by hanging up.
fn rejected(err: Error) -> Error {
    match err {
        Error::Closed => Error::auth("coordinator rejected the handshake"),
        Error::Io(e) => Error::auth(format!("connection lost during handshake: {e}")),
        Error::Protocol(m) => Error::auth(format!("malformed handshake frame: {m}")),
        other => other,
    }
}

async fn receive_loop(mut reader: SecureReader, events: Arc<dyn NetworkEvents>) {
    let coordinator = reader.peer_addr();
    loop {
        match reader.recv().await {
            Ok(Some(message)) if message.is_control() => {
                trace!(%coordinator, "ignoring control message");
            }
            Ok(Some(message)) => events.on_content(message),
            Ok(None) => {
                info!(%coordinator, "disconnected");
                events.on_status(StatusEvent::Disconnected {
                    reason: "connection closed".into(),
                });
                break;
            }
            Err(e) if e.is_frame_error() => {
                warn!(%coordinator, "dropping frame: {e}");
                events.on_status(StatusEvent::FrameDropped {
                    peer: Some(coordinator),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!(%coordinator, "receive failed: {e}");
                events.on_status(StatusEvent::Disconnected {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
}
