//! Entry point for the platform's group-formation layer.
//!
//! The platform announces "a group exists and I am (or am not) its owner" and
//! later "the group is gone". [`GroupSession`] turns those announcements into a
//! running [`Coordinator`] or [`Client`] and routes outgoing text through
//! whichever is active.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use huddle_common::helpers::is_valid_student_id;
use huddle_common::{Error, NetConfig, Result};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::Client;
use crate::coordinator::{Coordinator, CoordinatorOptions};
use crate::events::NetworkEvents;

/// What this device currently is in the group.
#[derive(Clone)]
pub enum GroupRole {
    Idle,
    /// Member handshake in flight; `generation` tells a stale join from a fresh one
    Joining { generation: u64 },
    Member(Arc<Client>),
    Coordinator(Arc<Coordinator>),
}

impl GroupRole {
    fn is_active(&self) -> bool {
        match self {
            Self::Idle => false,
            Self::Joining { .. } => true,
            Self::Member(client) => client.is_connected(),
            Self::Coordinator(coordinator) => !coordinator.is_stopped(),
        }
    }
}

impl fmt::Debug for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Joining { generation } => write!(f, "Joining({generation})"),
            Self::Member(client) => write!(f, "Member({})", client.local_address()),
            Self::Coordinator(coordinator) => write!(f, "Coordinator({})", coordinator.local_addr()),
        }
    }
}

/// One device's participation in the chat group.
pub struct GroupSession {
    identifier: String,
    config: NetConfig,
    roster: Option<HashSet<String>>,
    events: Arc<dyn NetworkEvents>,
    role: Mutex<GroupRole>,
    generation: AtomicU64,
}

impl GroupSession {
    /// `identifier` must be a student ID in `816000000..=816999999`.
    pub fn new(
        identifier: impl Into<String>,
        config: NetConfig,
        events: Arc<dyn NetworkEvents>,
    ) -> Result<Self> {
        let identifier = identifier.into().trim().to_string();
        if !is_valid_student_id(&identifier) {
            return Err(Error::config(format!(
                "'{identifier}' is not a valid student ID"
            )));
        }
        config.validate()?;

        Ok(Self {
            identifier,
            config,
            roster: None,
            events,
            role: Mutex::new(GroupRole::Idle),
            generation: AtomicU64::new(0),
        })
    }

    /// Only admit these identifiers when this device coordinates.
    pub fn with_roster<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster = Some(identifiers.into_iter().map(Into::into).collect());
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The platform decided our role in a newly formed group.
    ///
    /// `coordinator_address` overrides the configured coordinator address: the
    /// address to connect to as a member, the advertised address as owner.
    /// Ignored while a role is already active.
    pub async fn on_role_decided(
        &self,
        is_coordinator: bool,
        coordinator_address: Option<String>,
    ) -> Result<()> {
        let generation = {
            let mut role = self.role.lock().await;
            if role.is_active() {
                debug!(role = ?*role, "role already active, ignoring announcement");
                return Ok(());
            }

            if is_coordinator {
                let mut options = CoordinatorOptions::new(self.config.clone());
                if let Some(address) = coordinator_address {
                    options = options.with_advertised_address(address);
                }
                options.roster = self.roster.clone();

                let coordinator = Coordinator::start(options, Arc::clone(&self.events)).await?;
                info!(address = %coordinator.local_addr(), "coordinating group");
                *role = GroupRole::Coordinator(Arc::new(coordinator));
                return Ok(());
            }

            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            *role = GroupRole::Joining { generation };
            generation
        };

        // The lock is not held while connecting so a dissolve can cancel the join.
        let mut config = self.config.clone();
        if let Some(address) = coordinator_address {
            config.coordinator_address = address;
        }
        let result = match config.coordinator_socket_addr() {
            Ok(target) => {
                Client::connect(target, &self.identifier, &config, Arc::clone(&self.events)).await
            }
            Err(e) => Err(e),
        };

        let mut role = self.role.lock().await;
        let current = matches!(*role, GroupRole::Joining { generation: g } if g == generation);
        match result {
            Ok(client) if current => {
                *role = GroupRole::Member(Arc::new(client));
                Ok(())
            }
            Err(e) if current => {
                *role = GroupRole::Idle;
                Err(e)
            }
            Ok(client) => {
                debug!("group dissolved during join, leaving");
                client.close();
                Err(Error::Closed)
            }
            Err(e) => {
                debug!("join failed after the group dissolved: {e}");
                Err(Error::Closed)
            }
        }
    }

    /// The platform reports the group is gone. Safe to call when idle.
    pub async fn on_group_dissolved(&self) {
        let previous = std::mem::replace(&mut *self.role.lock().await, GroupRole::Idle);
        match previous {
            GroupRole::Idle => debug!("group dissolved while idle"),
            GroupRole::Joining { generation } => {
                info!(generation, "group dissolved, cancelling join");
            }
            GroupRole::Member(client) => {
                info!("group dissolved, leaving");
                client.close();
            }
            GroupRole::Coordinator(coordinator) => {
                info!("group dissolved, stopping coordinator");
                coordinator.stop().await;
            }
        }
    }

    /// Send `text` through the active role.
    pub async fn send(&self, text: &str) -> Result<()> {
        let role = self.role.lock().await.clone();
        match role {
            GroupRole::Member(client) => client.send(text).await,
            GroupRole::Coordinator(coordinator) => coordinator.send(text).await.map(|_| ()),
            GroupRole::Joining { .. } => Err(Error::not_authenticated("handshake in progress")),
            GroupRole::Idle => Err(Error::not_authenticated("not in a group")),
        }
    }

    /// Our address on the group network, once we have one.
    pub async fn local_address(&self) -> Option<String> {
        match &*self.role.lock().await {
            GroupRole::Member(client) => Some(client.local_address().to_string()),
            GroupRole::Coordinator(coordinator) => {
                Some(coordinator.advertised_address().to_string())
            }
            GroupRole::Idle | GroupRole::Joining { .. } => None,
        }
    }

    pub async fn role(&self) -> GroupRole {
        self.role.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEvents;

    fn events() -> Arc<dyn NetworkEvents> {
        Arc::new(ChannelEvents::new().0)
    }

    #[test]
    fn test_rejects_identifiers_outside_student_range() {
        for bad in ["", "815999999", "817000000", "81601234x", "8160123456"] {
            assert!(
                matches!(
                    GroupSession::new(bad, NetConfig::default(), events()),
                    Err(Error::Config(_))
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(GroupSession::new(" 816012345 ", NetConfig::default(), events()).is_ok());
    }

    #[tokio::test]
    async fn test_send_while_idle_is_not_authenticated() {
        let session = GroupSession::new("816012345", NetConfig::default(), events()).unwrap();
        assert!(matches!(
            session.send("hello").await,
            Err(Error::NotAuthenticated(_))
        ));
        assert!(session.local_address().await.is_none());
    }

    #[tokio::test]
    async fn test_dissolve_while_idle_is_harmless() {
        let session = GroupSession::new("816012345", NetConfig::default(), events()).unwrap();
        session.on_group_dissolved().await;
        session.on_group_dissolved().await;
        assert!(matches!(session.role().await, GroupRole::Idle));
    }
}
