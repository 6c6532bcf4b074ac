//! In-process [`ClusterProvider`] holding CronJobs, Jobs, Pods and pod logs in
//! memory. Used by the test suites and for running the API without a cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use k8s_openapi::api::{
    batch::v1::{CronJob, CronJobSpec, Job, JobStatus},
    core::v1::{Container, Pod, PodSpec, PodStatus},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use super::{ClusterProvider, ObjectKey, WatchEvent};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 16;

#[derive(Default)]
struct MemoryState {
    cron_jobs: BTreeMap<ObjectKey, CronJob>,
    jobs: BTreeMap<ObjectKey, Job>,
    pods: BTreeMap<ObjectKey, Pod>,
    logs: HashMap<ObjectKey, String>,
    failing_namespaces: HashSet<String>,
    failing_logs: HashSet<ObjectKey>,
    stalled_logs: HashSet<ObjectKey>,
}

pub struct MemoryProvider {
    state: Arc<RwLock<MemoryState>>,
    events: broadcast::Sender<WatchEvent<CronJob>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            events,
        }
    }

    /// Create or replace a CronJob and notify active watches.
    pub async fn add_cron_job(&self, cron_job: CronJob) {
        let key = key_of(&cron_job.metadata);
        self.state.write().await.cron_jobs.insert(key, cron_job.clone());
        let _ = self.events.send(WatchEvent::Applied(cron_job));
    }

    /// Delete a CronJob and notify active watches. Returns false if it did not exist.
    pub async fn delete_cron_job(&self, key: &ObjectKey) -> bool {
        let removed = self.state.write().await.cron_jobs.remove(key);
        match removed {
            Some(cron_job) => {
                let _ = self.events.send(WatchEvent::Deleted(cron_job));
                true
            }
            None => false,
        }
    }

    pub async fn add_job(&self, job: Job) {
        let key = key_of(&job.metadata);
        self.state.write().await.jobs.insert(key, job);
    }

    pub async fn add_pod(&self, pod: Pod) {
        let key = key_of(&pod.metadata);
        self.state.write().await.pods.insert(key, pod);
    }

    pub async fn set_pod_log(&self, pod: &ObjectKey, log: impl Into<String>) {
        self.state.write().await.logs.insert(pod.clone(), log.into());
    }

    /// Make every Job and Pod listing in `namespace` fail until restored.
    pub async fn fail_listing(&self, namespace: &str) {
        self.state
            .write()
            .await
            .failing_namespaces
            .insert(namespace.to_string());
    }

    pub async fn restore_listing(&self, namespace: &str) {
        self.state.write().await.failing_namespaces.remove(namespace);
    }

    /// Make log requests for `pod` fail as if its stream closed early.
    pub async fn fail_logs(&self, pod: &ObjectKey) {
        self.state.write().await.failing_logs.insert(pod.clone());
    }

    /// Make log requests for `pod` hang until the caller gives up.
    pub async fn stall_logs(&self, pod: &ObjectKey) {
        self.state.write().await.stalled_logs.insert(pod.clone());
    }
}

#[async_trait]
impl ClusterProvider for MemoryProvider {
    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        if state.failing_namespaces.contains(namespace) {
            return Err(Error::Kubernetes(format!(
                "failed to list jobs in namespace {}",
                namespace
            )));
        }

        Ok(state
            .jobs
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let state = self.state.read().await;
        if state.failing_namespaces.contains(namespace) {
            return Err(Error::Kubernetes(format!(
                "failed to list pods in namespace {}",
                namespace
            )));
        }

        Ok(state
            .pods
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn pod_logs(&self, pod: &ObjectKey) -> Result<Vec<u8>> {
        let stalled = self.state.read().await.stalled_logs.contains(pod);
        if stalled {
            return future::pending().await;
        }

        let state = self.state.read().await;
        if !state.pods.contains_key(pod) {
            return Err(Error::Kubernetes(format!("pods \"{}\" not found", pod.name)));
        }
        if state.failing_logs.contains(pod) {
            return Err(Error::Kubernetes(format!(
                "log stream for pod {} closed unexpectedly",
                pod
            )));
        }

        Ok(state
            .logs
            .get(pod)
            .map(|log| log.as_bytes().to_vec())
            .unwrap_or_default())
    }

    fn watch_cron_jobs(
        &self,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<WatchEvent<CronJob>>> {
        // Subscribe before taking the snapshot so no change can slip between them.
        let rx = self.events.subscribe();
        let state = self.state.clone();

        let initial = {
            let state = state.clone();
            let namespace = namespace.clone();
            stream::once(async move {
                let objs = snapshot(&state, namespace.as_deref()).await;
                debug!(count = objs.len(), "memory watch snapshot");
                Ok(WatchEvent::Restarted(objs))
            })
        };

        let filter_namespace = namespace.clone();
        let updates = stream::unfold((rx, state, namespace), |(mut rx, state, namespace)| async move {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "memory watch lagged, resending full listing");
                    WatchEvent::Restarted(snapshot(&state, namespace.as_deref()).await)
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            Some((event, (rx, state, namespace)))
        })
        .filter(move |event| {
            let keep = match event {
                WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => in_namespace(
                    filter_namespace.as_deref(),
                    obj.metadata.namespace.as_deref().unwrap_or_default(),
                ),
                WatchEvent::Restarted(_) => true,
            };
            future::ready(keep)
        })
        .map(Ok);

        initial.chain(updates).boxed()
    }
}

async fn snapshot(state: &RwLock<MemoryState>, namespace: Option<&str>) -> Vec<CronJob> {
    state
        .read()
        .await
        .cron_jobs
        .iter()
        .filter(|(key, _)| in_namespace(namespace, &key.namespace))
        .map(|(_, cron_job)| cron_job.clone())
        .collect()
}

fn in_namespace(filter: Option<&str>, namespace: &str) -> bool {
    filter.map_or(true, |ns| ns == namespace)
}

fn key_of(meta: &ObjectMeta) -> ObjectKey {
    ObjectKey::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn meta(namespace: &str, name: &str, owner: Option<OwnerReference>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        owner_references: owner.map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// An owner reference as the Job and CronJob controllers write them.
pub fn owner_reference(kind: &str, name: &str) -> OwnerReference {
    let api_version = match kind {
        "CronJob" | "Job" => "batch/v1",
        _ => "v1",
    };
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{}", name),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn cron_job(namespace: &str, name: &str, schedule: &str) -> CronJob {
    CronJob {
        metadata: meta(namespace, name, None),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            ..Default::default()
        }),
        status: None,
    }
}

/// A Job spawned by the CronJob `cron_job_name`.
pub fn job_owned_by(namespace: &str, name: &str, cron_job_name: &str) -> Job {
    Job {
        metadata: meta(
            namespace,
            name,
            Some(owner_reference("CronJob", cron_job_name)),
        ),
        spec: None,
        status: Some(JobStatus {
            start_time: Some(Time(Utc::now())),
            active: Some(1),
            ..Default::default()
        }),
    }
}

/// A Pod created by the Job `job_name`, running a single container.
pub fn pod_owned_by(
    namespace: &str,
    name: &str,
    job_name: &str,
    image: &str,
    command: &[&str],
) -> Pod {
    Pod {
        metadata: meta(namespace, name, Some(owner_reference("Job", job_name))),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                command: Some(command.iter().map(|part| part.to_string()).collect()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            start_time: Some(Time(Utc::now())),
            ..Default::default()
        }),
    }
}
