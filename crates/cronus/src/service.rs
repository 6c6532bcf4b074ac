//! Request-facing facade over the cache and aggregators.
//!
//! Every call gets its own [`RequestContext`] derived from the process
//! shutdown token and bounded by the configured request timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cache::ScheduledJobCache,
    cluster::{ClusterProvider, ObjectKey},
    config::Config,
    hierarchy::{Hierarchy, HierarchyAggregator},
    logs::{LogAggregator, LogBundle},
    report::ErrorList,
    request::RequestContext,
    resolver::OwnershipResolver,
    Result,
};

pub struct CronusService {
    cache: Arc<ScheduledJobCache>,
    aggregator: HierarchyAggregator,
    shutdown: CancellationToken,
    request_timeout: Option<Duration>,
}

impl CronusService {
    pub fn new(
        cache: Arc<ScheduledJobCache>,
        aggregator: HierarchyAggregator,
        shutdown: CancellationToken,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            aggregator,
            shutdown,
            request_timeout,
        }
    }

    /// Wire a service over `provider` using the limits in `config`. The cache
    /// is created but not initialized.
    pub fn from_config(
        provider: Arc<dyn ClusterProvider>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Self {
        let cache = Arc::new(ScheduledJobCache::new(
            provider.clone(),
            config.kube.namespace.clone(),
            shutdown.child_token(),
        ));
        let max_concurrency = config.request.max_concurrency;
        let aggregator = HierarchyAggregator::new(
            cache.clone(),
            OwnershipResolver::new(provider.clone()),
            LogAggregator::new(provider, max_concurrency),
            max_concurrency,
        );

        Self::new(cache, aggregator, shutdown, Some(config.request_timeout()))
    }

    pub fn cache(&self) -> &Arc<ScheduledJobCache> {
        &self.cache
    }

    /// Parent of every request context; cancelling it aborts in-flight calls.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(&self.shutdown, self.request_timeout)
    }

    /// Every cached CronJob with its Jobs and Pods.
    pub async fn list_scheduled_job_hierarchy(&self) -> Hierarchy {
        let ctx = self.context();
        self.aggregator.build_full_hierarchy(&ctx).await
    }

    /// Logs of all pods spawned by the CronJob `name` in `namespace`.
    pub async fn fetch_logs_for_scheduled_job(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<(LogBundle, ErrorList)> {
        let ctx = self.context();
        let key = ObjectKey::new(namespace, name);
        let (bundle, errors) = self.aggregator.build_logs_for(&ctx, &key).await?;
        info!(
            cron_job = %key,
            pods = bundle.len(),
            errors = errors.len(),
            "collected CronJob logs"
        );
        Ok((bundle, errors))
    }

    pub async fn fetch_single_pod_log(&self, pod: &str, namespace: &str) -> Result<String> {
        let ctx = self.context();
        self.aggregator
            .fetch_pod_log(&ctx, &ObjectKey::new(namespace, pod))
            .await
    }
}
