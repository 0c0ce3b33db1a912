//! Client-side session: one loop multiplexing both relay channels.
//!
//! The session connects a dealer-style control socket (identity = the
//! client's handle) and a subscriber socket filtered to the public topic
//! plus the client's own handle, so private news arrive alongside group
//! broadcasts. Each socket is drained by its own reader task into a single
//! event queue; the loop itself waits on that queue and on the outbound
//! side, so a partially received message is never abandoned mid-read.
//!
//! Outbound traffic is demand-driven: the loop waits up to half the poll
//! timeout for a queued talk from the owner and falls back to a HERE
//! heartbeat when none shows up, which both advertises liveness and
//! solicits a fresh roster. Every roster reply updates a `watch` view;
//! every broadcast lands on a chat-update queue. Both views, and the
//! outbound queue, are created when the session starts and die with it.

use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result, ensure};
use chrono::{DateTime, Utc};
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    message::ServerMessage,
    transport::{DealerSocket, Frames, SubscriberSocket},
    wire,
};

const EVENT_QUEUE_DEPTH: usize = 64;
const UPDATE_QUEUE_DEPTH: usize = 64;
const OUTBOX_DEPTH: usize = 16;

/// Settings for one peer session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address of the relay control endpoint.
    pub control: SocketAddr,
    /// Address of the relay broadcast endpoint.
    pub broadcast: SocketAddr,
    /// Handle announced to the relay; doubles as the routing identity.
    pub handle: String,
    /// Budget for any single channel operation; also paces heartbeats.
    pub timeout: Duration,
}

/// One received broadcast, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUpdate {
    pub stamp: DateTime<Utc>,
    pub sender: String,
    pub content: String,
    /// True when the broadcast was framed to this client's handle rather
    /// than the group topic.
    pub private: bool,
}

/// A message the owner wants relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingTalk {
    pub target: String,
    pub details: String,
}

impl OutgoingTalk {
    /// Talk addressed to everyone.
    pub fn public(details: impl Into<String>) -> Self {
        Self {
            target: wire::GROUP_SENDER.to_owned(),
            details: details.into(),
        }
    }

    /// Talk addressed to a single handle.
    pub fn private(target: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            details: details.into(),
        }
    }
}

/// The owner's side of a running session. Dropping the outbox asks the
/// session to leave; the views close when the session ends.
pub struct SessionHandle {
    /// Latest roster snapshot from the relay.
    pub roster: watch::Receiver<Vec<String>>,
    /// Stream of public and private broadcasts.
    pub updates: mpsc::Receiver<ChatUpdate>,
    /// Queue of talks to send; an idle queue yields heartbeats instead.
    pub outbox: mpsc::Sender<OutgoingTalk>,
}

enum Inbound {
    Control(Frames),
    Broadcast(Frames),
    Disconnected(&'static str),
}

pub struct Session {
    control: DealerSocket,
    subscription: SubscriberSocket,
    poll_timeout: Duration,
    outbox_rx: mpsc::Receiver<OutgoingTalk>,
    roster_tx: watch::Sender<Vec<String>>,
    updates_tx: mpsc::Sender<ChatUpdate>,
}

impl Session {
    /// Connect both channels and hand back the session plus its owner-side
    /// views. Connection failure here is fatal; once running, the session
    /// rides out individual operation timeouts instead.
    pub async fn connect(config: SessionConfig) -> Result<(Self, SessionHandle)> {
        ensure!(!config.handle.is_empty(), "handle must not be empty");

        let control = DealerSocket::connect(config.control, config.handle.as_bytes())
            .await
            .with_context(|| format!("failed to connect control channel to {}", config.control))?;
        let subscription = SubscriberSocket::connect(
            config.broadcast,
            &[wire::group_topic(), wire::news_frame(&config.handle)],
        )
        .await
        .with_context(|| {
            format!(
                "failed to connect broadcast channel to {}",
                config.broadcast
            )
        })?;

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (roster_tx, roster_rx) = watch::channel(Vec::new());
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);

        Ok((
            Self {
                control,
                subscription,
                poll_timeout: config.timeout,
                outbox_rx,
                roster_tx,
                updates_tx,
            },
            SessionHandle {
                roster: roster_rx,
                updates: updates_rx,
                outbox: outbox_tx,
            },
        ))
    }

    /// Run until the given future resolves, the owner drops the outbox, or
    /// the relay goes away. Sockets are released on every exit path.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Session {
            control,
            subscription,
            poll_timeout,
            mut outbox_rx,
            roster_tx,
            updates_tx,
        } = self;

        let (control_rx, mut control_tx) = control.into_split();
        let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE_DEPTH);

        // Reader tasks own the receiving halves; aborting the set closes
        // them.
        let mut readers = JoinSet::new();
        {
            let events = events_tx.clone();
            readers.spawn(async move {
                let mut control_rx = control_rx;
                loop {
                    match control_rx.recv().await {
                        Ok(Some(frames)) => {
                            if events.send(Inbound::Control(frames)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(error = ?err, "control channel read error");
                            break;
                        }
                    }
                }
                let _ = events.send(Inbound::Disconnected("control")).await;
            });
        }
        {
            let events = events_tx;
            readers.spawn(async move {
                let mut subscription = subscription;
                loop {
                    match subscription.recv().await {
                        Ok(Some(frames)) => {
                            if events.send(Inbound::Broadcast(frames)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(error = ?err, "broadcast channel read error");
                            break;
                        }
                    }
                }
                let _ = events.send(Inbound::Disconnected("broadcast")).await;
            });
        }

        tokio::pin!(shutdown);
        let heartbeat_wait = poll_timeout / 2;

        loop {
            select! {
                _ = &mut shutdown => break,
                event = events.recv() => {
                    match event {
                        Some(Inbound::Control(frames)) => handle_reply(&frames, &roster_tx),
                        Some(Inbound::Broadcast(frames)) => handle_broadcast(&frames, &updates_tx),
                        Some(Inbound::Disconnected(channel)) => {
                            warn!(channel, "relay connection lost");
                            break;
                        }
                        None => break,
                    }
                }
                queued = timeout(heartbeat_wait, outbox_rx.recv()) => {
                    let message = match queued {
                        Ok(Some(talk)) => wire::talk_message(&talk.target, &talk.details)
                            .context("failed to encode talk")?,
                        // The owner hung up the outbox; time to leave.
                        Ok(None) => break,
                        // Nothing to say: advertise liveness instead.
                        Err(_) => wire::here_message(),
                    };
                    match timeout(poll_timeout, control_tx.send(&message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(error = ?err, "failed to send on control channel");
                            break;
                        }
                        // Not fatal; the next heartbeat cycle self-heals.
                        Err(_) => warn!("control send timed out"),
                    }
                }
            }
        }

        readers.abort_all();
        control_tx.shutdown().await;
        Ok(())
    }
}

fn handle_reply(frames: &[Vec<u8>], roster: &watch::Sender<Vec<String>>) {
    match ServerMessage::decode(frames) {
        ServerMessage::List { users, .. } => {
            roster.send_replace(users);
        }
        ServerMessage::News { .. } => warn!("unexpected broadcast on the control channel"),
        ServerMessage::None => warn!("unknown message"),
    }
}

fn handle_broadcast(frames: &[Vec<u8>], updates: &mpsc::Sender<ChatUpdate>) {
    match ServerMessage::decode(frames) {
        ServerMessage::News {
            topic,
            stamp,
            sender,
            detail,
        } => {
            let update = ChatUpdate {
                stamp,
                sender,
                content: detail,
                private: topic != wire::GROUP_SENDER,
            };
            if updates.try_send(update).is_err() {
                debug!("dropping chat update for a slow consumer");
            }
        }
        ServerMessage::List { .. } => warn!("unexpected roster on the broadcast channel"),
        ServerMessage::None => warn!("unknown message"),
    }
}
