//! TCP transport for Huddle.
//!
//! - [`frame`]: newline-delimited JSON framing and the per-connection writer task
//! - [`connection`]: the connection state machine and its authenticated halves
//! - [`client`]: member side, connects to the coordinator's fixed address
//! - [`coordinator`]: group owner side, accepts members and relays messages
//! - [`group`]: entry point for the platform layer's role announcements
//! - [`events`]: how received messages and status changes reach the application

#![forbid(unsafe_code)]

pub mod client;
pub mod connection;
pub mod coordinator;
pub mod events;
pub mod frame;
pub mod group;

pub use client::Client;
pub use connection::{Connection, ConnectionState, PeerLink, SecureReader};
pub use coordinator::{Coordinator, CoordinatorOptions, PeerInfo};
pub use events::{ChannelEvents, NetworkEvent, NetworkEvents, StatusEvent};
pub use group::{GroupRole, GroupSession};
