//! Assembly of the CronJob → Job → Pod hierarchy.
//!
//! Only CronJobs come from the cache. Jobs and Pods are listed fresh for every
//! request, and a failure on one branch never aborts its siblings: the
//! affected CronJob keeps an empty job list and the failure is reported next
//! to the partial result.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    cache::ScheduledJobCache,
    cluster::ObjectKey,
    logs::{LogAggregator, LogBundle, PodTarget},
    metrics::HIERARCHY_BUILD_SECONDS,
    records::{JobRunRecord, ScheduledJobRecord},
    report::{ErrorList, ItemErrorKind},
    request::RequestContext,
    resolver::OwnershipResolver,
    schedule, Error, Result,
};

/// Fully resolved CronJobs plus whatever went wrong resolving them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hierarchy {
    #[serde(rename = "cronJobs")]
    pub scheduled_jobs: Vec<ScheduledJobRecord>,
    pub errors: ErrorList,
}

pub struct HierarchyAggregator {
    cache: Arc<ScheduledJobCache>,
    resolver: OwnershipResolver,
    logs: LogAggregator,
    max_concurrency: usize,
}

impl HierarchyAggregator {
    pub fn new(
        cache: Arc<ScheduledJobCache>,
        resolver: OwnershipResolver,
        logs: LogAggregator,
        max_concurrency: usize,
    ) -> Self {
        Self {
            cache,
            resolver,
            logs,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub async fn build_full_hierarchy(&self, ctx: &RequestContext) -> Hierarchy {
        self.build_full_hierarchy_at(ctx, Utc::now()).await
    }

    /// Build the hierarchy with next run times computed relative to `now`.
    pub async fn build_full_hierarchy_at(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Hierarchy {
        let timer = HIERARCHY_BUILD_SECONDS.start_timer();
        let mut errors = ErrorList::new();
        let mut records = self.cache.list().await;

        for record in &mut records {
            match schedule::next_run(&record.schedule, &now) {
                Ok(next) => record.next_run_time = Some(next),
                Err(e) => errors.record(record.key(), ItemErrorKind::InvalidSchedule, &e),
            }
        }

        let mut jobs_by_cron_job = self.resolve_jobs(ctx, &records, &mut errors).await;
        self.attach_pods(ctx, &mut jobs_by_cron_job, &mut errors).await;

        for record in &mut records {
            if let Some(runs) = jobs_by_cron_job.remove(&record.key()) {
                record.jobs = runs;
            }
        }
        errors.sort();
        timer.observe_duration();

        info!(
            cron_jobs = records.len(),
            errors = errors.len(),
            "built CronJob hierarchy"
        );
        Hierarchy {
            scheduled_jobs: records,
            errors,
        }
    }

    async fn resolve_jobs(
        &self,
        ctx: &RequestContext,
        records: &[ScheduledJobRecord],
        errors: &mut ErrorList,
    ) -> BTreeMap<ObjectKey, Vec<JobRunRecord>> {
        let resolved: Vec<(ObjectKey, Result<Vec<JobRunRecord>>)> =
            stream::iter(records.iter().map(ScheduledJobRecord::key))
                .map(|key| async move {
                    let res = self.resolver.resolve_jobs(ctx, &key).await;
                    (key, res)
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        let mut jobs_by_cron_job = BTreeMap::new();
        for (key, res) in resolved {
            match res {
                Ok(runs) => {
                    jobs_by_cron_job.insert(key, runs);
                }
                Err(e) => errors.record(key, ItemErrorKind::Resolution, &e),
            }
        }
        jobs_by_cron_job
    }

    /// List Pods once per namespace and hand them to their Jobs. If a
    /// namespace cannot be listed, every CronJob there that had Jobs loses
    /// them and gets an error instead.
    async fn attach_pods(
        &self,
        ctx: &RequestContext,
        jobs_by_cron_job: &mut BTreeMap<ObjectKey, Vec<JobRunRecord>>,
        errors: &mut ErrorList,
    ) {
        let mut jobs_by_namespace: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        for (key, runs) in jobs_by_cron_job.iter() {
            if runs.is_empty() {
                continue;
            }
            jobs_by_namespace
                .entry(key.namespace.clone())
                .or_default()
                .extend(runs.iter().map(|run| run.name.clone()));
        }

        let listed: Vec<_> = stream::iter(jobs_by_namespace)
            .map(|(namespace, jobs)| async move {
                let res = self
                    .resolver
                    .resolve_pods_by_job(ctx, &namespace, &jobs)
                    .await;
                (namespace, res)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (namespace, res) in listed {
            match res {
                Ok(mut pods_by_job) => {
                    for (_, runs) in jobs_by_cron_job
                        .iter_mut()
                        .filter(|(key, _)| key.namespace == namespace)
                    {
                        for run in runs.iter_mut() {
                            run.pods = pods_by_job.remove(&run.name).unwrap_or_default();
                        }
                    }
                }
                Err(e) => {
                    let affected: Vec<ObjectKey> = jobs_by_cron_job
                        .iter()
                        .filter(|(key, runs)| key.namespace == namespace && !runs.is_empty())
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in affected {
                        jobs_by_cron_job.remove(&key);
                        errors.record(key, ItemErrorKind::Resolution, &e);
                    }
                }
            }
        }
    }

    /// Logs of every pod of every Job spawned by one CronJob.
    pub async fn build_logs_for(
        &self,
        ctx: &RequestContext,
        cron_job: &ObjectKey,
    ) -> Result<(LogBundle, ErrorList)> {
        if self.cache.get(cron_job).await.is_none() {
            return Err(Error::NotFound(format!("CronJob {}", cron_job)));
        }

        let runs = self.resolver.resolve_jobs(ctx, cron_job).await?;
        if runs.is_empty() {
            debug!(cron_job = %cron_job, "no jobs to fetch logs for");
            return Ok((LogBundle::new(), ErrorList::new()));
        }

        let names: HashSet<String> = runs.iter().map(|run| run.name.clone()).collect();
        let pods_by_job = self
            .resolver
            .resolve_pods_by_job(ctx, &cron_job.namespace, &names)
            .await?;

        let targets: Vec<PodTarget> = pods_by_job
            .into_iter()
            .flat_map(|(job, pods)| {
                pods.into_iter().map(move |pod| PodTarget {
                    job: job.clone(),
                    pod: pod.key(),
                })
            })
            .collect();

        Ok(self.logs.fetch_all(ctx, targets).await)
    }

    pub async fn fetch_pod_log(&self, ctx: &RequestContext, pod: &ObjectKey) -> Result<String> {
        self.logs.fetch_log(ctx, pod).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{memory, ClusterProvider, MemoryProvider, MockClusterProvider, WatchEvent};
    use chrono::{TimeZone, Timelike};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn aggregator(provider: Arc<dyn ClusterProvider>) -> HierarchyAggregator {
        let cache = Arc::new(ScheduledJobCache::new(
            provider.clone(),
            None,
            CancellationToken::new(),
        ));
        cache.initialize(Duration::from_secs(5)).await.unwrap();
        HierarchyAggregator::new(
            cache,
            OwnershipResolver::new(provider.clone()),
            LogAggregator::new(provider, 4),
            4,
        )
    }

    async fn backup_cluster() -> Arc<MemoryProvider> {
        let provider = Arc::new(MemoryProvider::new());
        provider
            .add_cron_job(memory::cron_job("ops", "backup", "0 * * * *"))
            .await;
        provider
            .add_job(memory::job_owned_by("ops", "backup-28500000", "backup"))
            .await;
        provider
            .add_pod(memory::pod_owned_by(
                "ops",
                "backup-28500000-x7k2p",
                "backup-28500000",
                "postgres:16",
                &["pg_dumpall"],
            ))
            .await;
        provider
            .set_pod_log(&ObjectKey::new("ops", "backup-28500000-x7k2p"), "backup complete")
            .await;
        provider
    }

    #[tokio::test]
    async fn resolves_cron_job_jobs_and_pods() {
        let aggregator = aggregator(backup_cluster().await).await;
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap();

        let hierarchy = aggregator
            .build_full_hierarchy_at(&RequestContext::background(), now)
            .await;

        assert!(hierarchy.errors.is_empty());
        assert_eq!(hierarchy.scheduled_jobs.len(), 1);
        let backup = &hierarchy.scheduled_jobs[0];
        assert_eq!(backup.name, "backup");
        assert_eq!(
            backup.next_run_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap())
        );
        assert_eq!(backup.jobs.len(), 1);
        assert_eq!(backup.jobs[0].pods.len(), 1);
        assert_eq!(backup.jobs[0].pods[0].command, "pg_dumpall");
    }

    #[tokio::test]
    async fn next_run_is_the_coming_top_of_the_hour() {
        let aggregator = aggregator(backup_cluster().await).await;
        let before = Utc::now();

        let hierarchy = aggregator
            .build_full_hierarchy(&RequestContext::background())
            .await;

        let next = hierarchy.scheduled_jobs[0].next_run_time.unwrap();
        assert!(next > before);
        assert!(next - before <= chrono::Duration::hours(1));
        assert_eq!((next.minute(), next.second()), (0, 0));
    }

    #[tokio::test]
    async fn repeated_builds_are_structurally_identical() {
        let aggregator = aggregator(backup_cluster().await).await;
        let ctx = RequestContext::background();

        let shape = |h: &Hierarchy| -> Vec<(ObjectKey, Vec<(String, usize)>)> {
            h.scheduled_jobs
                .iter()
                .map(|r| {
                    let jobs: Vec<(String, usize)> =
                        r.jobs.iter().map(|j| (j.name.clone(), j.pods.len())).collect();
                    (r.key(), jobs)
                })
                .collect()
        };

        let first = aggregator.build_full_hierarchy(&ctx).await;
        let second = aggregator.build_full_hierarchy(&ctx).await;
        assert_eq!(shape(&first), shape(&second));
    }

    #[tokio::test]
    async fn invalid_schedule_only_clears_next_run() {
        let provider = backup_cluster().await;
        provider
            .add_cron_job(memory::cron_job("ops", "broken", "* * *"))
            .await;
        let aggregator = aggregator(provider).await;

        let hierarchy = aggregator
            .build_full_hierarchy(&RequestContext::background())
            .await;

        assert_eq!(hierarchy.scheduled_jobs.len(), 2);
        let broken = &hierarchy.scheduled_jobs[1];
        assert_eq!(broken.name, "broken");
        assert_eq!(broken.next_run_time, None);

        let backup = &hierarchy.scheduled_jobs[0];
        assert!(backup.next_run_time.is_some());
        assert_eq!(backup.jobs.len(), 1);

        assert_eq!(hierarchy.errors.len(), 1);
        let error = hierarchy.errors.iter().next().unwrap();
        assert_eq!(error.item, ObjectKey::new("ops", "broken"));
        assert_eq!(error.kind, ItemErrorKind::InvalidSchedule);
    }

    #[tokio::test]
    async fn failing_namespace_does_not_abort_other_cron_jobs() {
        let provider = backup_cluster().await;
        provider
            .add_cron_job(memory::cron_job("billing", "invoice", "0 2 * * *"))
            .await;
        provider
            .add_job(memory::job_owned_by("billing", "invoice-1", "invoice"))
            .await;
        provider.fail_listing("billing").await;
        let aggregator = aggregator(provider).await;

        let hierarchy = aggregator
            .build_full_hierarchy(&RequestContext::background())
            .await;

        assert_eq!(hierarchy.scheduled_jobs.len(), 2);
        let invoice = &hierarchy.scheduled_jobs[0];
        assert_eq!(invoice.key(), ObjectKey::new("billing", "invoice"));
        assert!(invoice.jobs.is_empty());
        assert!(invoice.next_run_time.is_some());

        let backup = &hierarchy.scheduled_jobs[1];
        assert_eq!(backup.jobs.len(), 1);
        assert_eq!(backup.jobs[0].pods.len(), 1);

        let errors: Vec<_> = hierarchy.errors.iter().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].item, ObjectKey::new("billing", "invoice"));
        assert_eq!(errors[0].kind, ItemErrorKind::Resolution);
    }

    #[tokio::test]
    async fn pod_listing_failure_clears_jobs_of_affected_cron_jobs() {
        let mut provider = MockClusterProvider::new();
        provider.expect_watch_cron_jobs().returning(|_| {
            stream::iter(vec![Ok(WatchEvent::Restarted(vec![
                memory::cron_job("ops", "backup", "0 * * * *"),
                memory::cron_job("ops", "idle", "0 0 * * *"),
            ]))])
            .chain(stream::pending())
            .boxed()
        });
        provider
            .expect_list_jobs()
            .returning(|_| Ok(vec![memory::job_owned_by("ops", "backup-1", "backup")]));
        provider
            .expect_list_pods()
            .returning(|_| Err(Error::Kubernetes("etcd timeout".to_string())));
        let aggregator = aggregator(Arc::new(provider)).await;

        let hierarchy = aggregator
            .build_full_hierarchy(&RequestContext::background())
            .await;

        assert!(hierarchy.scheduled_jobs.iter().all(|r| r.jobs.is_empty()));
        let errors: Vec<_> = hierarchy.errors.iter().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].item, ObjectKey::new("ops", "backup"));
        assert!(errors[0].message.contains("etcd timeout"));
        assert!(errors[0].message.contains("namespace ops"));
    }

    #[tokio::test]
    async fn builds_log_bundle_for_one_cron_job() {
        let provider = backup_cluster().await;
        provider
            .add_pod(memory::pod_owned_by(
                "ops",
                "backup-28500000-retry",
                "backup-28500000",
                "postgres:16",
                &["pg_dumpall"],
            ))
            .await;
        provider
            .fail_logs(&ObjectKey::new("ops", "backup-28500000-retry"))
            .await;
        let aggregator = aggregator(provider).await;

        let (bundle, errors) = aggregator
            .build_logs_for(&RequestContext::background(), &ObjectKey::new("ops", "backup"))
            .await
            .unwrap();

        assert_eq!(bundle.len(), 1);
        assert_eq!(
            bundle.get("backup-28500000/backup-28500000-x7k2p"),
            Some("backup complete")
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.iter().next().unwrap().item,
            ObjectKey::new("ops", "backup-28500000-retry")
        );
    }

    #[tokio::test]
    async fn logs_for_unknown_cron_job_are_not_found() {
        let aggregator = aggregator(backup_cluster().await).await;
        let err = aggregator
            .build_logs_for(&RequestContext::background(), &ObjectKey::new("ops", "nightly"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
