//! Network configuration shared by the coordinator and members.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::helpers::env_parse;
use crate::protocol::{DEFAULT_COORDINATOR_ADDRESS, DEFAULT_PORT};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_OUTBOX_CAPACITY: usize = 128;
const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Largest `max_frame_bytes` accepted; a reader buffers up to this much per frame.
pub const MAX_FRAME_BYTES_LIMIT: usize = 16 * 1024 * 1024;

/// Transport settings.
///
/// Defaults follow the platform convention: the group owner is always reachable
/// at [`DEFAULT_COORDINATOR_ADDRESS`] on [`DEFAULT_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// Port the coordinator listens on and members connect to
    pub port: u16,
    /// Interface the coordinator binds
    pub bind_address: IpAddr,
    /// Coordinator host; also the sender address of coordinator-originated messages
    pub coordinator_address: String,
    /// Local interface a member connects from; `None` lets the OS pick
    pub member_bind_address: Option<IpAddr>,
    /// Upper bound on opening the member's socket
    pub connect_timeout: Duration,
    /// Upper bound on each handshake read
    pub handshake_timeout: Duration,
    /// Frames queued per connection before sends start failing
    pub outbox_capacity: usize,
    /// Longest accepted frame, excluding the newline
    pub max_frame_bytes: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            coordinator_address: DEFAULT_COORDINATOR_ADDRESS.to_string(),
            member_bind_address: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NetConfig {
    /// Defaults overridden by `HUDDLE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("HUDDLE_PORT").map_err(Error::Config)? {
            config.port = port;
        }
        if let Some(bind) = env_parse::<IpAddr>("HUDDLE_BIND_ADDR").map_err(Error::Config)? {
            config.bind_address = bind;
        }
        if let Ok(addr) = std::env::var("HUDDLE_COORDINATOR_ADDR") {
            config.coordinator_address = addr.trim().to_string();
        }
        if let Some(local) = env_parse::<IpAddr>("HUDDLE_LOCAL_ADDR").map_err(Error::Config)? {
            config.member_bind_address = Some(local);
        }
        if let Some(secs) =
            env_parse::<u64>("HUDDLE_CONNECT_TIMEOUT_SECS").map_err(Error::Config)?
        {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_parse::<u64>("HUDDLE_HANDSHAKE_TIMEOUT_SECS").map_err(Error::Config)?
        {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) =
            env_parse::<usize>("HUDDLE_OUTBOX_CAPACITY").map_err(Error::Config)?
        {
            config.outbox_capacity = capacity;
        }
        if let Some(max) = env_parse::<usize>("HUDDLE_MAX_FRAME_BYTES").map_err(Error::Config)? {
            config.max_frame_bytes = max;
        }

        config.validate()?;
        debug!(?config, "network configuration loaded");
        Ok(config)
    }

    /// Reject settings the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator_address.is_empty() {
            return Err(Error::config("coordinator address must not be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect timeout must be positive"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::config("handshake timeout must be positive"));
        }
        if self.outbox_capacity == 0 {
            return Err(Error::config("outbox capacity must be positive"));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::config("max frame bytes must be positive"));
        }
        if self.max_frame_bytes > MAX_FRAME_BYTES_LIMIT {
            return Err(Error::config(format!(
                "max frame bytes must not exceed {MAX_FRAME_BYTES_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Socket address the coordinator binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Resolve the coordinator's socket address.
    pub fn coordinator_socket_addr(&self) -> Result<SocketAddr> {
        (self.coordinator_address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::config(format!(
                    "invalid coordinator address '{}': {e}",
                    self.coordinator_address
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::config(format!(
                    "coordinator address '{}' did not resolve",
                    self.coordinator_address
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_platform_convention() {
        let config = NetConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.coordinator_address, "192.168.49.1");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.coordinator_socket_addr().unwrap(),
            "192.168.49.1:9999".parse().unwrap()
        );
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let config = NetConfig {
            outbox_capacity: 0,
            ..NetConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = NetConfig {
            handshake_timeout: Duration::ZERO,
            ..NetConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = NetConfig {
            coordinator_address: String::new(),
            ..NetConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_max_frame_bytes_is_bounded() {
        let config = NetConfig {
            max_frame_bytes: usize::MAX,
            ..NetConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = NetConfig {
            max_frame_bytes: MAX_FRAME_BYTES_LIMIT,
            ..NetConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_addr_combines_bind_and_port() {
        let config = NetConfig {
            port: 4040,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..NetConfig::default()
        };
        assert_eq!(config.listen_addr(), "127.0.0.1:4040".parse().unwrap());
    }
}
