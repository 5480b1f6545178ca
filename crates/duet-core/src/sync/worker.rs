//! Background scheduling of sync passes, queue drains and retention purges

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::{PassReport, SyncEngine};
use crate::error::{Error, Result};
use crate::models::TenantId;
use crate::offline::{ConnectivityMonitor, OfflineQueue};
use crate::state::Connectivity;

const PURGE_INTERVAL: Duration = Duration::from_secs(3_600);
const COMMAND_BUFFER: usize = 32;

/// Requests accepted by a running [`SyncWorker`]
pub enum WorkerCommand {
    /// Run a pass for one tenant now and report back
    SyncTenant {
        tenant: TenantId,
        reply: oneshot::Sender<Result<PassReport>>,
    },
    /// Replay the offline queue
    Drain,
    /// Finish in-flight work and stop
    Shutdown,
}

/// Cloneable sender side of the worker's command channel
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Trigger a pass and wait for its report.
    ///
    /// When the tenant is mid-pass the request waits for that pass first.
    pub async fn sync_tenant(&self, tenant: TenantId) -> Result<PassReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WorkerCommand::SyncTenant { tenant, reply })
            .await
            .map_err(|_| Error::WorkerStopped)?;
        response.await.map_err(|_| Error::WorkerStopped)?
    }

    pub async fn drain(&self) -> Result<()> {
        self.commands
            .send(WorkerCommand::Drain)
            .await
            .map_err(|_| Error::WorkerStopped)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(WorkerCommand::Shutdown)
            .await
            .map_err(|_| Error::WorkerStopped)
    }
}

/// Hosts the periodic tasks: sync passes, connectivity probes, queue
/// drains and retention purges.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    queue: OfflineQueue,
    monitor: Arc<ConnectivityMonitor>,
}

impl SyncWorker {
    pub const fn new(
        engine: Arc<SyncEngine>,
        queue: OfflineQueue,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            engine,
            queue,
            monitor,
        }
    }

    /// Start the worker and its connectivity monitor
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let probe = Arc::clone(&self.monitor)
            .spawn(self.engine.settings().probe_interval, commands.clone());
        let task = tokio::spawn(self.run(receiver, probe));
        (WorkerHandle { commands }, task)
    }

    async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>, probe: JoinHandle<()>) {
        let settings = self.engine.settings().clone();
        let mut sync_ticker = tokio::time::interval(settings.sync_interval);
        let mut drain_ticker = tokio::time::interval(settings.drain_interval);
        let mut purge_ticker = tokio::time::interval(PURGE_INTERVAL);
        for ticker in [&mut sync_ticker, &mut drain_ticker, &mut purge_ticker] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let mut periodic: Option<JoinHandle<()>> = None;
        let mut tasks = JoinSet::new();
        tracing::info!(
            sync_enabled = settings.sync_enabled,
            interval_secs = settings.sync_interval.as_secs(),
            "Sync worker started"
        );

        loop {
            tokio::select! {
                _ = sync_ticker.tick(), if settings.sync_enabled => {
                    if periodic.as_ref().is_some_and(|task| !task.is_finished()) {
                        tracing::debug!("Previous periodic pass still running, skipping tick");
                    } else if self.monitor.current() == Connectivity::Offline {
                        tracing::debug!("Primary offline, skipping periodic pass");
                    } else {
                        let engine = Arc::clone(&self.engine);
                        periodic = Some(tokio::spawn(async move {
                            if let Err(error) = engine.sync_all().await {
                                tracing::error!(error = %error, "Periodic sync failed");
                            }
                        }));
                    }
                }
                _ = drain_ticker.tick() => {
                    if self.monitor.current() == Connectivity::Online {
                        self.spawn_drain(&mut tasks);
                    }
                }
                _ = purge_ticker.tick() => {
                    let engine = Arc::clone(&self.engine);
                    let retention = settings.retention;
                    tasks.spawn(async move {
                        if let Err(error) = engine.purge_expired(retention).await {
                            tracing::warn!(error = %error, "Retention purge failed");
                        }
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                command = commands.recv() => match command {
                    Some(WorkerCommand::SyncTenant { tenant, reply }) => {
                        let engine = Arc::clone(&self.engine);
                        tasks.spawn(async move {
                            let _ = reply.send(engine.sync_tenant(&tenant).await);
                        });
                    }
                    Some(WorkerCommand::Drain) => self.spawn_drain(&mut tasks),
                    Some(WorkerCommand::Shutdown) | None => break,
                },
            }
        }

        probe.abort();
        if let Some(task) = periodic {
            let _ = task.await;
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("Sync worker stopped");
    }

    fn spawn_drain(&self, tasks: &mut JoinSet<()>) {
        let queue = self.queue.clone();
        tasks.spawn(async move {
            if let Err(error) = queue.drain(None).await {
                tracing::error!(error = %error, "Offline queue drain failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::config::SyncSettings;
    use crate::db::ControlDb;
    use crate::models::RecordKey;
    use crate::store::{MemoryStore, StoreAdapter};
    use crate::sync::RetryPolicy;

    #[tokio::test(flavor = "multi_thread")]
    async fn on_demand_pass_is_answered_and_shutdown_completes() {
        let primary = Arc::new(MemoryStore::primary());
        let secondary = Arc::new(MemoryStore::secondary());
        let tenant = TenantId::new("clinic").unwrap();
        let mut fields = Map::new();
        fields.insert("name".into(), json!("Ana"));
        primary
            .write(&RecordKey::new(tenant.clone(), "patients", "p1").unwrap(), fields)
            .await
            .unwrap();

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&primary) as Arc<dyn StoreAdapter>,
            Arc::clone(&secondary) as Arc<dyn StoreAdapter>,
            ControlDb::open_in_memory().unwrap(),
            SyncSettings {
                sync_enabled: false,
                retry: RetryPolicy::immediate(1),
                tables: vec!["patients".to_string()],
                ..SyncSettings::default()
            },
        ));
        let queue = OfflineQueue::new(&engine);
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&primary) as Arc<dyn StoreAdapter>
        ));
        let (handle, task) = SyncWorker::new(Arc::clone(&engine), queue, monitor).spawn();

        let report = handle.sync_tenant(tenant.clone()).await.unwrap();
        assert_eq!(report.table("patients").unwrap().written_secondary, 1);

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            handle.sync_tenant(tenant).await,
            Err(Error::WorkerStopped)
        ));
    }
}
