//! Live pod log retrieval.
//!
//! Logs are read to the end of the stream and kept in memory only for the
//! duration of a request, so memory use grows with log size.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cluster::{ClusterProvider, ObjectKey},
    metrics::{LOG_FETCHES_TOTAL, LOG_FETCH_ERRORS_TOTAL},
    report::{ErrorList, ItemErrorKind},
    request::RequestContext,
    Error, Result,
};

/// Captured pod logs keyed by `job-name/pod-name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogBundle(BTreeMap<String, String>);

impl LogBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: &str, pod: &str, log: String) {
        self.0.insert(format!("{}/{}", job, pod), log);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Plain-text rendering: one `Pod: <key>` block per pod.
    pub fn render_text(&self) -> String {
        self.0
            .iter()
            .map(|(key, log)| format!("Pod: {}\n----\n{}\n", key, log))
            .collect()
    }
}

/// A pod whose logs should be fetched, with the Job that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub job: String,
    pub pod: ObjectKey,
}

pub struct LogAggregator {
    provider: Arc<dyn ClusterProvider>,
    max_concurrency: usize,
}

impl LogAggregator {
    pub fn new(provider: Arc<dyn ClusterProvider>, max_concurrency: usize) -> Self {
        Self {
            provider,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Fetch the full log of one pod.
    pub async fn fetch_log(&self, ctx: &RequestContext, pod: &ObjectKey) -> Result<String> {
        LOG_FETCHES_TOTAL.inc();

        let bytes = ctx.run(self.provider.pod_logs(pod)).await.map_err(|e| {
            if e.is_aborted() {
                debug!(pod = %pod, error = %e, "pod log fetch aborted");
                return e;
            }
            LOG_FETCH_ERRORS_TOTAL.inc();
            warn!(pod = %pod, error = %e, "failed to fetch pod logs");
            Error::LogFetch {
                pod: pod.clone(),
                message: e.to_string(),
            }
        })?;

        debug!(pod = %pod, bytes = bytes.len(), "fetched pod logs");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetch logs of every target independently. Successful fetches populate
    /// the bundle; each failure is reported against its pod.
    pub async fn fetch_all(
        &self,
        ctx: &RequestContext,
        targets: Vec<PodTarget>,
    ) -> (LogBundle, ErrorList) {
        let results: Vec<(PodTarget, Result<String>)> = stream::iter(targets)
            .map(|target| async move {
                let res = self.fetch_log(ctx, &target.pod).await;
                (target, res)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut bundle = LogBundle::new();
        let mut errors = ErrorList::new();
        for (target, res) in results {
            match res {
                Ok(log) => bundle.insert(&target.job, &target.pod.name, log),
                Err(e) => errors.record(target.pod, ItemErrorKind::LogFetch, &e),
            }
        }
        errors.sort();

        (bundle, errors)
    }
}
