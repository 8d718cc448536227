//! Connection state machine.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ AwaitingHandshake ─▶ Authenticated ─▶ Closed
//!                      └──────────────┴───────────────────┴──────────────▲
//! ```
//!
//! The phases are separate types. A [`Connection`] is a socket whose handshake
//! has not finished: it can only exchange plain handshake frames and carries no
//! key material. [`Connection::authenticate`] consumes it and yields a
//! [`PeerLink`] for sealed sends and a [`SecureReader`] for sealed receives,
//! both holding the peer's keys. Any failure, or either side closing, moves the
//! shared state to `Closed`, which is absorbing.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use huddle_common::{Error, Message, NetConfig, Result};
use huddle_crypto::{envelope, KeyMaterial};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::frame::{spawn_writer, FrameReader, Outbox};

/// Observable phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Authenticated,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting-handshake",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared, forward-only connection state.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<watch::Sender<ConnectionState>>);

impl StateCell {
    pub(crate) fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self(Arc::new(tx))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.0.subscribe()
    }

    /// Move to `next` if it lies ahead of the current state.
    ///
    /// Returns whether the state changed. Nothing leaves `Closed`.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.0.send_if_modified(|current| {
            if *current == ConnectionState::Closed || next <= *current {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    /// Returns `true` only for the call that actually closed.
    pub(crate) fn close(&self) -> bool {
        self.advance(ConnectionState::Closed)
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

/// A socket in its handshake phase.
pub struct Connection {
    peer: SocketAddr,
    local: SocketAddr,
    reader: FrameReader<OwnedReadHalf>,
    outbox: Outbox,
    state: StateCell,
    handshake_timeout: Duration,
}

impl Connection {
    /// Open a socket to `addr` (member side).
    pub async fn connect(addr: SocketAddr, config: &NetConfig) -> Result<Self> {
        let state = StateCell::new(ConnectionState::Disconnected);
        state.advance(ConnectionState::Connecting);
        debug!(%addr, "connecting");

        let stream = match timeout(config.connect_timeout, open_socket(addr, config)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                state.close();
                return Err(Error::connection(format!("failed to connect to {addr}: {e}")));
            }
            Err(_) => {
                state.close();
                return Err(Error::connection(format!(
                    "timed out connecting to {addr} after {:?}",
                    config.connect_timeout
                )));
            }
        };

        Self::attach(stream, state, config)
    }

    /// Wrap a socket returned by `accept` (coordinator side).
    pub fn accept(stream: TcpStream, config: &NetConfig) -> Result<Self> {
        Self::attach(stream, StateCell::new(ConnectionState::Connecting), config)
    }

    fn attach(stream: TcpStream, state: StateCell, config: &NetConfig) -> Result<Self> {
        let (peer, local) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            (Err(e), _) | (_, Err(e)) => {
                state.close();
                return Err(Error::connection(format!("socket has no address: {e}")));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "failed to set TCP_NODELAY: {e}");
        }

        let (read, write) = stream.into_split();
        let outbox = spawn_writer(write, peer, config.outbox_capacity, state.clone());
        state.advance(ConnectionState::AwaitingHandshake);

        Ok(Self {
            peer,
            local,
            reader: FrameReader::new(read, config.max_frame_bytes),
            outbox,
            state,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Send a plain handshake frame.
    pub async fn send_handshake(&self, message: &Message) -> Result<()> {
        if self.state.get() != ConnectionState::AwaitingHandshake {
            return Err(Error::Closed);
        }
        self.outbox.send(message.to_frame()?).await
    }

    /// Wait for the next plain handshake frame.
    ///
    /// End of stream is [`Error::Closed`]; exceeding the handshake timeout is
    /// an [`Error::Auth`].
    pub async fn recv_handshake(&mut self) -> Result<Message> {
        match timeout(self.handshake_timeout, self.reader.next_message()).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(Error::Closed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::auth(format!(
                "handshake timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }

    /// Finish the handshake with the peer's key material.
    pub fn authenticate(self, keys: KeyMaterial) -> (PeerLink, SecureReader) {
        self.state.advance(ConnectionState::Authenticated);
        let keys = Arc::new(keys);

        let link = PeerLink {
            peer: self.peer,
            keys: Arc::clone(&keys),
            outbox: self.outbox,
            state: self.state.clone(),
        };
        let reader = SecureReader {
            peer: self.peer,
            reader: self.reader,
            keys,
            state: self.state,
        };
        (link, reader)
    }

    /// Abandon the handshake and close the socket.
    pub fn close(self) {
        if self.state.close() {
            debug!(peer = %self.peer, "closed during handshake");
        }
    }
}

async fn open_socket(addr: SocketAddr, config: &NetConfig) -> std::io::Result<TcpStream> {
    let Some(local) = config.member_bind_address else {
        return TcpStream::connect(addr).await;
    };
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(local, 0))?;
    socket.connect(addr).await
}

/// Sending half of an authenticated connection. Cheap to clone.
#[derive(Clone)]
pub struct PeerLink {
    peer: SocketAddr,
    keys: Arc<KeyMaterial>,
    outbox: Outbox,
    state: StateCell,
}

impl PeerLink {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == ConnectionState::Authenticated
    }

    /// Seal `message` under this peer's key and queue it, waiting for room.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let frame = self.seal(message)?;
        self.outbox.send(frame).await
    }

    /// Seal and queue without waiting; fails if the peer's outbox is full.
    pub fn try_send(&self, message: &Message) -> Result<()> {
        let frame = self.seal(message)?;
        self.outbox.try_send(frame)
    }

    fn seal(&self, message: &Message) -> Result<String> {
        match self.state.get() {
            ConnectionState::Authenticated => {}
            ConnectionState::Closed => return Err(Error::Closed),
            other => {
                return Err(Error::not_authenticated(format!(
                    "connection to {} is {other}",
                    self.peer
                )))
            }
        }
        envelope::seal(message, &self.keys)?.to_frame()
    }

    /// Close the connection. Idempotent; returns `true` for the first call.
    pub fn close(&self) -> bool {
        let first = self.state.close();
        if first {
            debug!(peer = %self.peer, "connection closed");
        }
        first
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.state.closed().await;
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

/// Receiving half of an authenticated connection.
pub struct SecureReader {
    peer: SocketAddr,
    reader: FrameReader<OwnedReadHalf>,
    keys: Arc<KeyMaterial>,
    state: StateCell,
}

impl SecureReader {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next decrypted message.
    ///
    /// `Ok(None)` once the peer hangs up or the connection is closed locally;
    /// the state is `Closed` afterwards. Errors for which
    /// [`Error::is_frame_error`] holds concern one frame only and the reader
    /// may be polled again; any other error has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let mut watch = self.state.subscribe();
        let next = tokio::select! {
            next = self.reader.next_message() => next,
            _ = async { let _ = watch.wait_for(|s| *s == ConnectionState::Closed).await; } => {
                return Ok(None)
            }
        };

        match next {
            Ok(Some(frame)) => envelope::open(&frame, &self.keys).map(Some),
            Ok(None) => {
                self.state.close();
                Ok(None)
            }
            Err(e) if e.is_frame_error() => Err(e),
            Err(e) => {
                self.state.close();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_moves_forward() {
        let state = StateCell::new(ConnectionState::Disconnected);
        assert!(state.advance(ConnectionState::Connecting));
        assert!(state.advance(ConnectionState::AwaitingHandshake));
        assert!(!state.advance(ConnectionState::Connecting));
        assert_eq!(state.get(), ConnectionState::AwaitingHandshake);
    }

    #[test]
    fn test_closed_is_absorbing_and_close_is_idempotent() {
        let state = StateCell::new(ConnectionState::Authenticated);
        assert!(state.close());
        assert!(!state.close());
        assert!(!state.advance(ConnectionState::Authenticated));
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_any_state_can_close() {
        for initial in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::AwaitingHandshake,
            ConnectionState::Authenticated,
        ] {
            let state = StateCell::new(initial);
            assert!(state.close(), "{initial} should close");
        }
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_connection_error() {
        // Bind then drop to find a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = match Connection::connect(addr, &NetConfig::default()).await {
            Ok(_) => panic!("connect unexpectedly succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Connection(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_sealed_frames_roundtrip_between_links() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = NetConfig::default();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::accept(stream, &NetConfig::default()).unwrap()
        });
        let member = Connection::connect(addr, &config).await.unwrap();
        let coordinator = accept.await.unwrap();

        assert_eq!(member.state(), ConnectionState::AwaitingHandshake);
        assert_eq!(coordinator.state(), ConnectionState::AwaitingHandshake);

        let keys = KeyMaterial::derive("816012345");
        let (member_link, _member_reader) = member.authenticate(keys.clone());
        let (_coord_link, mut coord_reader) = coordinator.authenticate(keys);

        member_link
            .send(&Message::new("hello", "10.0.0.2"))
            .await
            .unwrap();
        let got = coord_reader.recv().await.unwrap().unwrap();
        assert_eq!(got.text(), "hello");
        assert_eq!(got.sender_address(), "10.0.0.2");

        // Hanging up ends the other side's reader.
        assert!(member_link.close());
        assert!(!member_link.close());
        assert!(coord_reader.recv().await.unwrap().is_none());
        assert!(matches!(
            member_link.send(&Message::new("late", "10.0.0.2")).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_handshake_read_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = NetConfig {
            handshake_timeout: Duration::from_millis(50),
            ..NetConfig::default()
        };

        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut member = Connection::connect(addr, &config).await.unwrap();
        assert!(matches!(
            member.recv_handshake().await,
            Err(Error::Auth(_))
        ));
    }
}
