use std::time::Duration;

use tokio::sync::mpsc;

use lookout_core::agent::AgentRecord;

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::shutdown::ShutdownListener;

/// Events published by the roster poller.
#[derive(Debug)]
pub enum RosterEvent {
    /// A fresh snapshot replacing the previous one wholesale.
    Snapshot(Vec<AgentRecord>),
    /// A fetch failed; polling continues on the next tick.
    Error(GatewayError),
    /// The gateway rejected the credentials; the poller has stopped itself so
    /// the caller can redirect to sign-in.
    Unauthenticated,
}

/// Periodic roster fetcher.
///
/// Fetches once immediately, then every `interval` until the stop signal
/// fires, the receiver is dropped, or the gateway reports unauthenticated.
pub struct RosterPoller<G> {
    gateway: G,
    interval: Duration,
}

impl<G: Gateway> RosterPoller<G> {
    pub fn new(gateway: G, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    pub async fn run(self, tx: mpsc::UnboundedSender<RosterEvent>, mut stop: ShutdownListener) {
        loop {
            match self.gateway.fetch_roster().await {
                Ok(agents) => {
                    tracing::debug!(count = agents.len(), "roster snapshot");
                    if tx.send(RosterEvent::Snapshot(agents)).is_err() {
                        return;
                    }
                },
                Err(e) if e.is_unauthenticated() => {
                    tracing::warn!("roster fetch unauthenticated, stopping poller");
                    let _ = tx.send(RosterEvent::Unauthenticated);
                    return;
                },
                Err(e) => {
                    tracing::warn!(error = %e, "roster fetch failed");
                    if tx.send(RosterEvent::Error(e)).is_err() {
                        return;
                    }
                },
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = stop.triggered() => return,
            }
        }
    }
}
