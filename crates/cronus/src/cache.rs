//! Watch-backed cache of CronJobs.
//!
//! One background task owns the watch stream and is the only writer to the
//! snapshot. Readers take the latest snapshot directly; there is no
//! cross-object point-in-time guarantee beyond the order watch events arrive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::batch::v1::CronJob;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ClusterProvider, ObjectKey, WatchEvent},
    metrics::{CACHED_SCHEDULED_JOBS, CACHE_EVENTS_TOTAL},
    records::ScheduledJobRecord,
    Error, Result,
};

const EVENT_BUFFER: usize = 128;

/// Change notifications published by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Upserted(ObjectKey),
    Removed(ObjectKey),
    /// The snapshot was replaced by a full listing of this many CronJobs.
    Resynced(usize),
}

struct Shared {
    entries: RwLock<BTreeMap<ObjectKey, ScheduledJobRecord>>,
    synced: watch::Sender<bool>,
    events: broadcast::Sender<CacheEvent>,
}

pub struct ScheduledJobCache {
    provider: Arc<dyn ClusterProvider>,
    namespace: Option<String>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledJobCache {
    /// Create a cache over CronJobs in `namespace`, or all namespaces when `None`.
    /// Nothing is watched until [`initialize`](Self::initialize) is called.
    pub fn new(
        provider: Arc<dyn ClusterProvider>,
        namespace: Option<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            provider,
            namespace,
            shared: Arc::new(Shared {
                entries: RwLock::new(BTreeMap::new()),
                synced,
                events,
            }),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Start the watch and wait until the initial listing has been ingested.
    pub async fn initialize(&self, timeout: Duration) -> Result<()> {
        self.start().await;

        let mut synced = self.shared.synced.subscribe();
        let outcome = tokio::time::timeout(timeout, synced.wait_for(|ready| *ready))
            .await
            .map(|res| res.is_ok());

        match outcome {
            Ok(true) => {
                info!(
                    count = self.len().await,
                    namespace = self.namespace.as_deref().unwrap_or("<all>"),
                    "CronJob cache synced"
                );
                Ok(())
            }
            Ok(false) => Err(Error::Internal(
                "CronJob cache closed before syncing".to_string(),
            )),
            Err(_) => {
                error!(?timeout, "CronJob cache failed to sync");
                Err(Error::SyncTimeout(timeout))
            }
        }
    }

    async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let stream = self.provider.watch_cron_jobs(self.namespace.clone());
        let shared = self.shared.clone();
        let token = self.shutdown.clone();
        *task = Some(tokio::spawn(run_watch(stream, shared, token)));
    }

    /// Current snapshot, ordered by namespace then name.
    pub async fn list(&self) -> Vec<ScheduledJobRecord> {
        self.shared.entries.read().await.values().cloned().collect()
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<ScheduledJobRecord> {
        self.shared.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.shared.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Receive change notifications. Slow receivers miss events rather than
    /// holding up the cache.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the background watch. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "CronJob watch task ended abnormally");
            }
            info!("CronJob cache shut down");
        }
    }
}

async fn run_watch(
    mut stream: BoxStream<'static, Result<WatchEvent<CronJob>>>,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    info!("Starting CronJob watch");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("CronJob watch cancelled");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => shared.apply(event).await,
                Some(Err(e)) => warn!(error = %e, "CronJob watch error"),
                None => {
                    warn!("CronJob watch stream ended");
                    break;
                }
            },
        }
    }
}

impl Shared {
    async fn apply(&self, event: WatchEvent<CronJob>) {
        match event {
            WatchEvent::Applied(obj) => {
                CACHE_EVENTS_TOTAL.with_label_values(&["applied"]).inc();
                let record = match ScheduledJobRecord::from_cron_job(&obj) {
                    Some(record) => record,
                    None => {
                        warn!(name = ?obj.metadata.name, "ignoring CronJob without name or namespace");
                        return;
                    }
                };

                let key = record.key();
                {
                    let mut entries = self.entries.write().await;
                    entries.insert(key.clone(), record);
                    CACHED_SCHEDULED_JOBS.set(entries.len() as i64);
                }
                debug!(cron_job = %key, "CronJob applied");
                let _ = self.events.send(CacheEvent::Upserted(key));
            }
            WatchEvent::Deleted(obj) => {
                CACHE_EVENTS_TOTAL.with_label_values(&["deleted"]).inc();
                let key = match ScheduledJobRecord::from_cron_job(&obj) {
                    Some(record) => record.key(),
                    None => return,
                };

                let removed = {
                    let mut entries = self.entries.write().await;
                    let removed = entries.remove(&key).is_some();
                    CACHED_SCHEDULED_JOBS.set(entries.len() as i64);
                    removed
                };
                if removed {
                    debug!(cron_job = %key, "CronJob deleted");
                    let _ = self.events.send(CacheEvent::Removed(key));
                }
            }
            WatchEvent::Restarted(objs) => {
                CACHE_EVENTS_TOTAL.with_label_values(&["restarted"]).inc();
                let received = objs.len();
                let snapshot: BTreeMap<ObjectKey, ScheduledJobRecord> = objs
                    .iter()
                    .filter_map(ScheduledJobRecord::from_cron_job)
                    .map(|record| (record.key(), record))
                    .collect();
                let count = snapshot.len();
                if count != received {
                    warn!(received, kept = count, "dropped unaddressable or duplicate CronJobs from listing");
                }

                {
                    let mut entries = self.entries.write().await;
                    *entries = snapshot;
                    CACHED_SCHEDULED_JOBS.set(count as i64);
                }
                debug!(count, "CronJob listing applied");
                let _ = self.events.send(CacheEvent::Resynced(count));
                self.synced.send_replace(true);
            }
        }
    }
}
