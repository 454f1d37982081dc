//! Directory supervisor loop.
//!
//! Owns one [`PeerLink`] per configured directory. Forwards topic/channel
//! lifecycle events as `REGISTER`/`UNREGISTER`, heartbeats every link
//! periodically, and replays the full registration set whenever a link
//! (re)connects. A single failing link logs and is retried on the next
//! event; it never halts the loop.

use std::sync::Arc;

use courier_core::protocol::FRAME_TYPE_ERROR;
use courier_core::{Command, PeerAnnounce};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, RegistrationEvent};
use crate::peer::{ConnectCallback, PeerLink};

/// Run the supervisor until broker shutdown.
pub async fn directory_loop(
    broker: Arc<Broker>,
    mut notify_rx: mpsc::UnboundedReceiver<RegistrationEvent>,
) {
    let (sync_tx, mut sync_rx) = mpsc::unbounded_channel::<Arc<PeerLink>>();
    let announce = broker.peer_announce();

    let links: Vec<Arc<PeerLink>> = broker
        .config()
        .directory_tcp_addresses
        .iter()
        .map(|addr| {
            info!(peer = %addr, "adding directory peer");
            PeerLink::new(addr.clone(), identify_callback(announce.clone(), sync_tx.clone()))
        })
        .collect();

    // Kick off the initial connections; unreachable directories stay lazy
    // and reconnect on the next command.
    for link in &links {
        if let Err(err) = link.connect().await {
            warn!(peer = %link, %err, "directory unreachable");
        }
    }

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + broker.config().directory_ping_interval,
        broker.config().directory_ping_interval,
    );
    let mut exit_rx = broker.exit_subscribe();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Heartbeat; the round-trip also detects dead connections.
                for link in &links {
                    debug!(peer = %link, "sending heartbeat");
                    log_command_outcome(link, link.command(Command::ping()).await);
                }
            }

            Some(event) = notify_rx.recv() => {
                let cmd = registration_command(&event);
                for link in &links {
                    info!(peer = %link, command = %cmd, "updating registration");
                    log_command_outcome(link, link.command(cmd.clone()).await);
                }
            }

            Some(link) = sync_rx.recv() => {
                // Freshly (re)connected: replay the whole registration set.
                let commands = broker.registration_commands();
                info!(peer = %link, count = commands.len(), "resyncing registrations");
                for cmd in commands {
                    match link.command(cmd.clone()).await {
                        Err(err) => {
                            error!(peer = %link, command = %cmd, %err, "resync aborted");
                            break;
                        }
                        Ok((frame_type, data)) if frame_type == FRAME_TYPE_ERROR => {
                            error!(
                                peer = %link,
                                command = %cmd,
                                response = %String::from_utf8_lossy(&data),
                                "directory returned error"
                            );
                        }
                        Ok(_) => {}
                    }
                }
            }

            _ = exit_rx.recv() => break,
        }
    }

    for link in &links {
        link.disconnect();
    }
    info!("directory loop exiting");
}

fn registration_command(event: &RegistrationEvent) -> Command {
    match event {
        RegistrationEvent::TopicCreated(topic) => Command::register(topic, None),
        RegistrationEvent::TopicDeleted(topic) => Command::unregister(topic, None),
        RegistrationEvent::ChannelCreated { topic, channel } => {
            Command::register(topic, Some(channel))
        }
        RegistrationEvent::ChannelDeleted { topic, channel } => {
            Command::unregister(topic, Some(channel))
        }
    }
}

fn log_command_outcome(link: &Arc<PeerLink>, outcome: crate::error::Result<(i32, bytes::Bytes)>) {
    match outcome {
        Err(err) => error!(peer = %link, %err, "directory command failed"),
        Ok((frame_type, data)) if frame_type == FRAME_TYPE_ERROR => {
            error!(
                peer = %link,
                response = %String::from_utf8_lossy(&data),
                "directory returned error"
            );
        }
        Ok(_) => {}
    }
}

/// The per-connection callback: IDENTIFY, record the directory's identity,
/// then trigger a registration resync.
fn identify_callback(
    announce: PeerAnnounce,
    sync_tx: mpsc::UnboundedSender<Arc<PeerLink>>,
) -> ConnectCallback {
    crate::peer::boxed_callback(move |link: Arc<PeerLink>| {
        let announce = announce.clone();
        let sync_tx = sync_tx.clone();
        async move {
            let cmd = match Command::identify(&announce) {
                Ok(cmd) => cmd,
                Err(err) => {
                    error!(peer = %link, %err, "failed to build IDENTIFY");
                    return;
                }
            };
            match link.command(cmd).await {
                Err(err) => {
                    error!(peer = %link, %err, "IDENTIFY failed");
                }
                Ok((frame_type, data)) if frame_type == FRAME_TYPE_ERROR => {
                    error!(
                        peer = %link,
                        response = %String::from_utf8_lossy(&data),
                        "IDENTIFY rejected"
                    );
                }
                Ok((_, data)) => {
                    match serde_json::from_slice::<PeerAnnounce>(&data) {
                        Ok(identity) => {
                            info!(
                                peer = %link,
                                hostname = %identity.hostname,
                                version = %identity.version,
                                "directory identified"
                            );
                        }
                        Err(err) => {
                            warn!(peer = %link, %err, "unparsable IDENTIFY response");
                        }
                    }
                    let _ = sync_tx.send(Arc::clone(&link));
                }
            }
        }
    })
}
