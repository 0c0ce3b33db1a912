//! The relay: one loop owning the membership registry.
//!
//! Every iteration runs purge-then-serve in strict order: leases that
//! expired at the cutoff are removed and their farewells broadcast before
//! the next request is considered, so a freshly expired client never
//! appears in a roster reply built in the same iteration. The wait for
//! traffic is bounded by the idle timeout, which keeps expiry checks
//! responsive even when no client is talking.

use std::{
    future::Future,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::select;
use tracing::{info, warn};

use crate::{
    message::ClientMessage,
    registry::Registry,
    transport::{PublisherEndpoint, RouterEndpoint},
    wire,
};

/// Settings for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address of the request/reply control endpoint.
    pub control: SocketAddr,
    /// Bind address of the publish/subscribe broadcast endpoint.
    pub broadcast: SocketAddr,
    /// How long a lease stays valid without a fresh heartbeat.
    pub lease: Duration,
    /// How long one iteration waits for traffic before re-checking leases.
    pub idle_timeout: Duration,
}

pub struct Relay {
    control: RouterEndpoint,
    publisher: PublisherEndpoint,
    registry: Registry,
    idle_timeout: Duration,
}

impl Relay {
    /// Bind both endpoints. Failure here is fatal to startup.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let control = RouterEndpoint::bind(config.control)
            .await
            .with_context(|| format!("failed to bind control endpoint at {}", config.control))?;
        let publisher = PublisherEndpoint::bind(config.broadcast)
            .await
            .with_context(|| {
                format!("failed to bind broadcast endpoint at {}", config.broadcast)
            })?;
        Ok(Self {
            control,
            publisher,
            registry: Registry::new(config.lease),
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    /// Run until the given future resolves. Endpoints are closed on the way
    /// out, on the cancellation path as much as on the error path.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let cutoff = Instant::now();
            for handle in self.registry.purge_expired_at(cutoff) {
                info!(%handle, "lease expired");
                self.broadcast_notice(&format!("Goodbye, {handle}."))?;
            }

            let request = select! {
                _ = &mut shutdown => break,
                request = self.control.recv_timeout(self.idle_timeout) => request,
            };
            // A quiet idle window; loop back around to the purge pass.
            let Some(frames) = request else { continue };
            self.serve(cutoff, &frames)?;
        }

        info!("relay shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Service one decoded request. `cutoff` is the purge instant of the
    /// current iteration; leases are stamped against it.
    fn serve(&mut self, cutoff: Instant, frames: &[Vec<u8>]) -> Result<()> {
        match ClientMessage::decode(frames) {
            ClientMessage::Here { sender } => {
                self.admit(&sender, cutoff)?;
                let reply = wire::list_message(&frames[0], Utc::now(), &self.registry.snapshot())
                    .context("failed to encode roster reply")?;
                self.control.send(reply);
            }
            ClientMessage::Talk {
                sender,
                target,
                detail,
            } => {
                self.admit(&sender, cutoff)?;
                let topic = if target == wire::GROUP_SENDER {
                    wire::GROUP_SENDER
                } else {
                    target.as_str()
                };
                let news = wire::news_message(topic, Utc::now(), &sender, &detail)
                    .context("failed to encode broadcast")?;
                self.publisher.publish(&news);
            }
            ClientMessage::None => warn!("unknown message"),
        }
        Ok(())
    }

    /// Refresh the sender's lease; a previously unseen handle gets exactly
    /// one public welcome.
    fn admit(&mut self, sender: &str, cutoff: Instant) -> Result<()> {
        if self.registry.touch_at(sender, cutoff) {
            info!(handle = %sender, "client joined");
            self.broadcast_notice(&format!("Welcome, {sender}."))?;
        }
        Ok(())
    }

    /// Publish a relay-originated public announcement. Delivery is best
    /// effort; an empty audience is not an error.
    fn broadcast_notice(&self, details: &str) -> Result<()> {
        let news = wire::news_message(wire::GROUP_SENDER, Utc::now(), wire::GROUP_SENDER, details)
            .context("failed to encode announcement")?;
        self.publisher.publish(&news);
        Ok(())
    }
}
