//! Huddle command line: run a coordinator, join a group, inspect derived keys.

#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use huddle_common::{Message, NetConfig};
use huddle_crypto::{hash_identifier, KeyMaterial};
use huddle_net::{
    Coordinator, CoordinatorOptions, GroupRole, GroupSession, NetworkEvents, StatusEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Encrypted group chat over a local wireless group")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Own the group: accept members and relay their messages
    Coordinate {
        /// Port to listen on
        #[arg(long, env = "HUDDLE_PORT")]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long, env = "HUDDLE_BIND_ADDR")]
        bind: Option<IpAddr>,

        /// Address members see on coordinator messages
        #[arg(long, env = "HUDDLE_COORDINATOR_ADDR")]
        advertise: Option<String>,

        /// Only admit these student IDs (repeat or comma-separate)
        #[arg(long, value_delimiter = ',')]
        roster: Vec<String>,
    },

    /// Join a group as a member
    Join {
        /// Student ID to authenticate with
        #[arg(long, env = "HUDDLE_STUDENT_ID")]
        id: String,

        /// Coordinator host
        #[arg(long, env = "HUDDLE_COORDINATOR_ADDR")]
        coordinator: Option<String>,

        /// Coordinator port
        #[arg(long, env = "HUDDLE_PORT")]
        port: Option<u16>,

        /// Local interface to connect from
        #[arg(long, env = "HUDDLE_LOCAL_ADDR")]
        local: Option<IpAddr>,
    },

    /// Print the digest, key and IV derived from a student ID
    Derive {
        #[arg(long)]
        id: String,
    },

    /// Show version information
    Version,
}

/// Prints received messages; status changes go to the log.
struct ConsoleEvents;

impl NetworkEvents for ConsoleEvents {
    fn on_content(&self, message: Message) {
        println!("[{}] {}", message.sender_address(), message.text());
    }

    fn on_status(&self, status: StatusEvent) {
        match status {
            StatusEvent::PeerRejected { .. }
            | StatusEvent::AuthenticationFailed { .. }
            | StatusEvent::ConnectionFailed { .. }
            | StatusEvent::FrameDropped { .. } => warn!(?status, "network status"),
            _ => info!(?status, "network status"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    huddle_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Coordinate {
            port,
            bind,
            advertise,
            roster,
        } => {
            let mut config = NetConfig::from_env()?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            let mut options = CoordinatorOptions::new(config);
            if let Some(address) = advertise {
                options = options.with_advertised_address(address);
            }
            if !roster.is_empty() {
                info!(members = roster.len(), "roster enabled");
                options = options.with_roster(roster);
            }
            coordinate(options).await
        }
        Command::Join {
            id,
            coordinator,
            port,
            local,
        } => {
            let mut config = NetConfig::from_env()?;
            if let Some(port) = port {
                config.port = port;
            }
            if local.is_some() {
                config.member_bind_address = local;
            }
            join(id, config, coordinator).await
        }
        Command::Derive { id } => {
            let digest = hash_identifier(&id);
            let keys = KeyMaterial::derive(&id);
            println!("identifier: {id}");
            println!("sha256:     {}", digest.to_hex());
            println!("key:        {}", String::from_utf8_lossy(keys.key()));
            println!("key (hex):  {}", hex::encode(keys.key()));
            println!("iv:         {}", String::from_utf8_lossy(keys.iv()));
            Ok(())
        }
        Command::Version => {
            println!("huddle {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn coordinate(options: CoordinatorOptions) -> Result<()> {
    let coordinator = Coordinator::start(options, Arc::new(ConsoleEvents))
        .await
        .context("failed to start coordinator")?;
    println!(
        "coordinating on {} as {}; type to broadcast, Ctrl-C to stop",
        coordinator.local_addr(),
        coordinator.advertised_address()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match coordinator.send(&line).await {
                    Ok(delivered) => info!(delivered, "sent"),
                    Err(e) => warn!("send failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.stop().await;
    Ok(())
}

async fn join(identifier: String, config: NetConfig, coordinator: Option<String>) -> Result<()> {
    let session = GroupSession::new(identifier, config, Arc::new(ConsoleEvents))?;
    session
        .on_role_decided(false, coordinator)
        .await
        .context("failed to join group")?;

    let GroupRole::Member(client) = session.role().await else {
        bail!("join did not complete");
    };
    println!(
        "joined {} as {}; type to send, Ctrl-C to leave",
        client.coordinator_addr(),
        client.local_address()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = session.send(&line).await {
                    warn!("send failed: {e}");
                }
            }
            _ = client.closed() => {
                session.on_group_dissolved().await;
                return Err(anyhow!("coordinator closed the connection"));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.on_group_dissolved().await;
    Ok(())
}
