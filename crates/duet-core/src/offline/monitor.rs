//! Primary store reachability tracking

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::state::Connectivity;
use crate::store::StoreAdapter;
use crate::sync::WorkerCommand;

/// Probes the primary store and publishes the result on a watch channel.
///
/// Read-only with respect to sync state: it never takes shard or global
/// locks.
pub struct ConnectivityMonitor {
    primary: Arc<dyn StoreAdapter>,
    state: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(primary: Arc<dyn StoreAdapter>) -> Self {
        let (state, _) = watch::channel(Connectivity::Unknown);
        Self { primary, state }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Record an observation; returns the new state when it changed
    pub fn observe(&self, next: Connectivity) -> Option<Connectivity> {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if !changed {
            return None;
        }
        match next {
            Connectivity::Offline => {
                tracing::warn!(previous = %previous, "Primary store unreachable, offline mode");
            }
            Connectivity::Online if previous == Connectivity::Offline => {
                tracing::info!("Primary store reachable again");
            }
            _ => tracing::debug!(previous = %previous, current = %next, "Connectivity changed"),
        }
        Some(next)
    }

    /// Ping the primary once and publish the outcome
    pub async fn probe(&self) -> Option<Connectivity> {
        let next = match self.primary.ping().await {
            Ok(()) => Connectivity::Online,
            Err(error) => {
                tracing::debug!(error = %error, "Primary probe failed");
                Connectivity::Offline
            }
        };
        self.observe(next)
    }

    /// Probe on `interval` until the command channel closes.
    ///
    /// Every transition to online asks the worker for a queue drain.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        commands: mpsc::Sender<WorkerCommand>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.probe().await == Some(Connectivity::Online)
                            && commands.send(WorkerCommand::Drain).await.is_err()
                        {
                            break;
                        }
                    }
                    () = commands.closed() => break,
                }
            }
            tracing::debug!("Connectivity monitor stopped");
        })
    }
}
