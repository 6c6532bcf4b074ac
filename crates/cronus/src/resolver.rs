//! Ownership resolution between CronJobs, Jobs and Pods.
//!
//! Children are found by listing every candidate in the parent's namespace and
//! matching owner references, without relying on labels or server-side
//! selectors. A child belongs to a parent only when it declares exactly one
//! owner of the parent's kind and that owner carries the parent's name; a
//! child naming several owners of that kind is excluded from all of them.
//!
//! Each resolution is a linear scan over the namespace. That is fine for the
//! tens to hundreds of Jobs and Pods a namespace usually holds; beyond that the
//! scan should be replaced by an owner index maintained from watch events.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{
    cluster::{ClusterProvider, ObjectKey},
    metrics::RESOLUTION_ERRORS_TOTAL,
    records::{JobRunRecord, PodRecord},
    request::RequestContext,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    CronJob,
    Job,
}

impl ParentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentKind::CronJob => "CronJob",
            ParentKind::Job => "Job",
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the only owner of `kind`, or `None` when there are zero or several.
pub fn sole_owner(refs: &[OwnerReference], kind: ParentKind) -> Option<&str> {
    let mut owners = refs.iter().filter(|r| r.kind == kind.as_str());
    match (owners.next(), owners.next()) {
        (Some(owner), None) => Some(owner.name.as_str()),
        _ => None,
    }
}

/// Keep the candidates owned by the `kind` resource named `parent_name`.
pub fn owned_children<K: ResourceExt>(
    candidates: Vec<K>,
    kind: ParentKind,
    parent_name: &str,
) -> Vec<K> {
    candidates
        .into_iter()
        .filter(|child| sole_owner(child.owner_references(), kind) == Some(parent_name))
        .collect()
}

pub struct OwnershipResolver {
    provider: Arc<dyn ClusterProvider>,
}

impl OwnershipResolver {
    pub fn new(provider: Arc<dyn ClusterProvider>) -> Self {
        Self { provider }
    }

    /// Jobs spawned by the CronJob `cron_job`, oldest first.
    pub async fn resolve_jobs(
        &self,
        ctx: &RequestContext,
        cron_job: &ObjectKey,
    ) -> Result<Vec<JobRunRecord>> {
        let candidates = ctx
            .run(self.provider.list_jobs(&cron_job.namespace))
            .await
            .map_err(|e| resolution_error(cron_job, e))?;
        let scanned = candidates.len();

        let mut runs: Vec<JobRunRecord> =
            owned_children(candidates, ParentKind::CronJob, &cron_job.name)
                .iter()
                .filter_map(JobRunRecord::from_job)
                .collect();
        runs.sort_by(|a, b| (a.start_time, &a.name).cmp(&(b.start_time, &b.name)));

        debug!(cron_job = %cron_job, scanned, matched = runs.len(), "resolved jobs");
        Ok(runs)
    }

    /// Pods created by the Job `job`.
    pub async fn resolve_pods(
        &self,
        ctx: &RequestContext,
        job: &ObjectKey,
    ) -> Result<Vec<PodRecord>> {
        let candidates = ctx
            .run(self.provider.list_pods(&job.namespace))
            .await
            .map_err(|e| resolution_error(job, e))?;

        let mut pods: Vec<PodRecord> = owned_children(candidates, ParentKind::Job, &job.name)
            .iter()
            .filter_map(PodRecord::from_pod)
            .collect();
        sort_pods(&mut pods);
        Ok(pods)
    }

    /// Pods of several Jobs in one namespace, from a single Pod listing.
    /// Every requested Job gets an entry, possibly empty.
    pub async fn resolve_pods_by_job(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        jobs: &HashSet<String>,
    ) -> Result<HashMap<String, Vec<PodRecord>>> {
        let candidates = ctx
            .run(self.provider.list_pods(namespace))
            .await
            .map_err(|e| namespace_listing_error(namespace, e))?;
        let scanned = candidates.len();

        let mut by_job: HashMap<String, Vec<PodRecord>> =
            jobs.iter().map(|job| (job.clone(), Vec::new())).collect();
        for pod in &candidates {
            let owner = match sole_owner(pod.owner_references(), ParentKind::Job) {
                Some(owner) => owner,
                None => continue,
            };
            if let (Some(pods), Some(record)) = (by_job.get_mut(owner), PodRecord::from_pod(pod)) {
                pods.push(record);
            }
        }
        by_job.values_mut().for_each(sort_pods);

        debug!(namespace, scanned, jobs = jobs.len(), "resolved pods");
        Ok(by_job)
    }
}

fn sort_pods(pods: &mut Vec<PodRecord>) {
    pods.sort_by(|a, b| (a.start_time, &a.name).cmp(&(b.start_time, &b.name)));
}

fn resolution_error(parent: &ObjectKey, err: Error) -> Error {
    if err.is_aborted() {
        return err;
    }
    RESOLUTION_ERRORS_TOTAL.inc();
    warn!(parent = %parent, error = %err, "ownership resolution failed");
    Error::Resolution {
        parent: parent.clone(),
        message: err.to_string(),
    }
}

/// A Pod listing shared by several Jobs failed; the caller attributes it to
/// each affected parent.
fn namespace_listing_error(namespace: &str, err: Error) -> Error {
    if err.is_aborted() {
        return err;
    }
    RESOLUTION_ERRORS_TOTAL.inc();
    warn!(namespace, error = %err, "pod listing failed");
    Error::Kubernetes(format!("listing pods in namespace {}: {}", namespace, err))
}
