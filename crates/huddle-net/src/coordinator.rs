//! Group owner side: accept members, verify them, relay their messages.
//!
//! Every accepted socket gets its own task that runs the responder handshake
//! and then the receive loop. Authenticated peers live in one table keyed by
//! their address on the group network, one entry per device; a message from one peer is handed to the local
//! consumer and re-sealed for every other peer under that peer's own key.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use huddle_common::{Error, Message, NetConfig, Result};
use huddle_crypto::{KeyMaterial, Responder};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, PeerLink};
use crate::events::{NetworkEvents, StatusEvent};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How to run a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub config: NetConfig,
    /// Sender address stamped on challenges and coordinator-originated messages
    pub advertised_address: String,
    /// Identifiers allowed to join; `None` accepts any identifier the member can prove
    pub roster: Option<HashSet<String>>,
}

impl CoordinatorOptions {
    pub fn new(config: NetConfig) -> Self {
        Self {
            advertised_address: config.coordinator_address.clone(),
            config,
            roster: None,
        }
    }

    pub fn with_advertised_address(mut self, address: impl Into<String>) -> Self {
        self.advertised_address = address.into();
        self
    }

    pub fn with_roster<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster = Some(identifiers.into_iter().map(Into::into).collect());
        self
    }
}

/// An authenticated member as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Socket of the peer's current connection
    pub address: SocketAddr,
    pub identifier: String,
}

struct PeerEntry {
    /// Distinguishes a replacement from the stale connection it replaced
    id: u64,
    identifier: String,
    link: PeerLink,
}

type PeerMap = Arc<RwLock<HashMap<IpAddr, PeerEntry>>>;

struct Shared {
    config: NetConfig,
    advertised_address: String,
    roster: Option<Arc<HashSet<String>>>,
    events: Arc<dyn NetworkEvents>,
    peers: PeerMap,
    next_entry_id: AtomicU64,
}

impl Shared {
    /// Add an authenticated peer and queue its acknowledgement.
    ///
    /// The acknowledgement is queued while the table is write-locked, so no
    /// broadcast can reach the peer ahead of it. A connection already
    /// registered for the same device address is stale: it is replaced and
    /// closed.
    async fn register(&self, identifier: String, link: PeerLink) -> Result<u64> {
        let address = link.peer_addr().ip();
        let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);

        let mut peers = self.peers.write().await;
        link.try_send(&Message::control(&self.advertised_address))?;
        let replaced = peers.insert(
            address,
            PeerEntry {
                id,
                identifier,
                link,
            },
        );
        drop(peers);

        if let Some(previous) = replaced {
            let stale = previous.link.peer_addr();
            warn!(peer = %stale, "replacing stale connection from the same address");
            previous.link.close();
            self.events
                .on_status(StatusEvent::PeerDisconnected { peer: stale });
        }
        Ok(id)
    }

    /// Remove `address` only if it still belongs to entry `id`.
    async fn unregister(&self, address: IpAddr, id: u64) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(&address) {
            Some(entry) if entry.id == id => {
                peers.remove(&address);
                true
            }
            _ => false,
        }
    }

    async fn broadcast(&self, message: &Message, exclude: Option<IpAddr>) -> usize {
        let targets: Vec<PeerLink> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(address, _)| Some(**address) != exclude)
                .map(|(_, entry)| entry.link.clone())
                .collect()
        };

        let mut delivered = 0;
        for link in targets {
            match link.try_send(message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %link.peer_addr(), "skipping peer: {e}"),
            }
        }
        delivered
    }
}

/// A running coordinator.
pub struct Coordinator {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    stopped: AtomicBool,
}

impl Coordinator {
    /// Bind the listener and start accepting members.
    pub async fn start(options: CoordinatorOptions, events: Arc<dyn NetworkEvents>) -> Result<Self> {
        options.config.validate()?;
        let listen_addr = options.config.listen_addr();
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| Error::connection(format!("failed to bind {listen_addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config: options.config,
            advertised_address: options.advertised_address,
            roster: options.roster.map(Arc::new),
            events,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_entry_id: AtomicU64::new(0),
        });

        info!(address = %local_addr, "coordinator listening");
        shared.events.on_status(StatusEvent::Listening {
            address: local_addr,
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Self {
            shared,
            local_addr,
            accept_task,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address members see on coordinator-originated messages.
    pub fn advertised_address(&self) -> &str {
        &self.shared.advertised_address
    }

    /// Re-seal `message` for every authenticated peer except the one at `exclude`.
    ///
    /// Best effort: a peer whose outbox is full or closed is skipped. Returns
    /// the number of peers the message was queued for.
    pub async fn broadcast(&self, message: &Message, exclude: Option<IpAddr>) -> usize {
        self.shared.broadcast(message, exclude).await
    }

    /// Originate `text` from the coordinator to every peer.
    pub async fn send(&self, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            return Err(Error::protocol("message cannot be empty"));
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let message = Message::new(text, &self.shared.advertised_address);
        Ok(self.shared.broadcast(&message, None).await)
    }

    /// Drop a peer and close its connection. Returns whether it was present.
    pub async fn remove_connection(&self, address: IpAddr) -> bool {
        let removed = self.shared.peers.write().await.remove(&address);
        match removed {
            Some(entry) => {
                let peer = entry.link.peer_addr();
                entry.link.close();
                info!(%peer, identifier = %entry.identifier, "peer removed");
                self.shared
                    .events
                    .on_status(StatusEvent::PeerDisconnected { peer });
                true
            }
            None => false,
        }
    }

    /// Snapshot of the authenticated peers, ordered by address.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.shared.peers.read().await;
        let mut list: Vec<PeerInfo> = peers
            .iter()
            .map(|(_, entry)| PeerInfo {
                address: entry.link.peer_addr(),
                identifier: entry.identifier.clone(),
            })
            .collect();
        list.sort_by_key(|peer| peer.address);
        list
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.read().await.len()
    }

    /// Close the listener and every connection. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the accept loop drops the listener and aborts the peer tasks.
        self.accept_task.abort();

        let drained: Vec<PeerEntry> = {
            let mut peers = self.shared.peers.write().await;
            peers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            let peer = entry.link.peer_addr();
            entry.link.close();
            self.shared
                .events
                .on_status(StatusEvent::PeerDisconnected { peer });
        }
        info!(closed = drained.len(), "coordinator stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Ok(mut peers) = self.shared.peers.try_write() {
            for (_, entry) in peers.drain() {
                entry.link.close();
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    debug!(peer = %address, "accepted connection");
                    tasks.spawn(serve_peer(stream, Arc::clone(&shared)));
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("peer task panicked: {e}");
                    }
                }
            }
        }
    }
}

async fn serve_peer(stream: TcpStream, shared: Arc<Shared>) {
    let mut conn = match Connection::accept(stream, &shared.config) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("dropping connection: {e}");
            return;
        }
    };
    let peer = conn.peer_addr();

    let mut responder = Responder::new(shared.advertised_address.clone());
    if let Some(roster) = &shared.roster {
        responder = responder.with_roster(Arc::clone(roster));
    }

    let (keys, identifier) = match respond(&mut conn, &mut responder).await {
        Ok(verified) => verified,
        Err(e) => {
            warn!(%peer, "handshake rejected: {e}");
            conn.close();
            shared.events.on_status(StatusEvent::PeerRejected {
                peer,
                reason: e.to_string(),
            });
            return;
        }
    };

    let (link, mut reader) = conn.authenticate(keys);
    let entry_id = match shared.register(identifier.clone(), link.clone()).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%peer, "failed to acknowledge handshake: {e}");
            link.close();
            return;
        }
    };
    info!(%peer, %identifier, "peer authenticated");
    shared.events.on_status(StatusEvent::PeerAuthenticated {
        peer,
        identifier: identifier.clone(),
    });

    loop {
        match reader.recv().await {
            Ok(Some(message)) if message.is_control() => {
                trace!(%peer, "ignoring control message");
            }
            Ok(Some(message)) => {
                let delivered = shared.broadcast(&message, Some(peer.ip())).await;
                debug!(%peer, delivered, "relayed message");
                shared.events.on_content(message);
            }
            Ok(None) => break,
            Err(e) if e.is_frame_error() => {
                warn!(%peer, "dropping frame: {e}");
                shared.events.on_status(StatusEvent::FrameDropped {
                    peer: Some(peer),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!(%peer, "receive failed: {e}");
                break;
            }
        }
    }

    link.close();
    if shared.unregister(peer.ip(), entry_id).await {
        info!(%peer, %identifier, "peer disconnected");
        shared
            .events
            .on_status(StatusEvent::PeerDisconnected { peer });
    }
}

async fn respond(
    conn: &mut Connection,
    responder: &mut Responder,
) -> Result<(KeyMaterial, String)> {
    let introduction = conn.recv_handshake().await?;
    let challenge = responder.challenge(&introduction)?;
    conn.send_handshake(&challenge).await?;

    let response = conn.recv_handshake().await?;
    let keys = responder.verify(&response)?;
    let identifier = responder
        .verified_identifier()
        .map(str::to_owned)
        .ok_or_else(|| Error::internal("verified identifier missing"))?;
    Ok((keys, identifier))
}
