//! Value snapshots of the three resource kinds making up a CronJob hierarchy.
//!
//! Records are built once from the Kubernetes objects and never mutated
//! afterwards, only replaced.

use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::ObjectKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobRecord {
    pub name: String,
    pub namespace: String,
    /// Raw cron expression from the CronJob spec.
    pub schedule: String,
    #[serde(default)]
    pub suspended: bool,
    pub last_scheduled_time: Option<DateTime<Utc>>,
    pub last_successful_time: Option<DateTime<Utc>>,
    /// Derived from `schedule` at read time, `None` if the schedule is invalid.
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub jobs: Vec<JobRunRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunRecord {
    pub name: String,
    pub namespace: String,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub status: JobRunStatus,
    #[serde(default)]
    pub pods: Vec<PodRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunStatus {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub image: Option<String>,
    /// Container command followed by its arguments, space separated.
    pub command: String,
    pub phase: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl ScheduledJobRecord {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Build a record from a CronJob. Objects without a name or namespace are
    /// not addressable and yield `None`.
    pub fn from_cron_job(cron_job: &CronJob) -> Option<Self> {
        let key = object_key(&cron_job.metadata)?;
        let spec = cron_job.spec.as_ref();
        let status = cron_job.status.as_ref();

        Some(Self {
            name: key.name,
            namespace: key.namespace,
            schedule: spec.map(|s| s.schedule.clone()).unwrap_or_default(),
            suspended: spec.and_then(|s| s.suspend).unwrap_or(false),
            last_scheduled_time: status
                .and_then(|s| s.last_schedule_time.as_ref())
                .map(|t| t.0),
            last_successful_time: status
                .and_then(|s| s.last_successful_time.as_ref())
                .map(|t| t.0),
            next_run_time: None,
            jobs: Vec::new(),
        })
    }
}

impl JobRunRecord {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn from_job(job: &Job) -> Option<Self> {
        let key = object_key(&job.metadata)?;
        let status = job.status.as_ref();

        Some(Self {
            name: key.name,
            namespace: key.namespace,
            start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
            completion_time: status
                .and_then(|s| s.completion_time.as_ref())
                .map(|t| t.0),
            status: JobRunStatus {
                active: status.and_then(|s| s.active).unwrap_or(0),
                succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
                failed: status.and_then(|s| s.failed).unwrap_or(0),
            },
            pods: Vec::new(),
        })
    }
}

impl PodRecord {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let key = object_key(&pod.metadata)?;
        let container = pod.spec.as_ref().and_then(|spec| spec.containers.first());
        let command = container
            .map(|c| {
                c.command
                    .iter()
                    .flatten()
                    .chain(c.args.iter().flatten())
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let status = pod.status.as_ref();

        Some(Self {
            name: key.name,
            namespace: key.namespace,
            image: container.and_then(|c| c.image.clone()),
            command,
            phase: status.and_then(|s| s.phase.clone()),
            start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        })
    }
}

fn object_key(meta: &ObjectMeta) -> Option<ObjectKey> {
    match (meta.namespace.as_deref(), meta.name.as_deref()) {
        (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
            Some(ObjectKey::new(ns, name))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory;
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::CronJobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn cron_job_record_carries_schedule_and_status_times() {
        let mut cron_job = memory::cron_job("ops", "backup", "0 * * * *");
        let scheduled = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        cron_job.status = Some(CronJobStatus {
            last_schedule_time: Some(Time(scheduled)),
            ..Default::default()
        });

        let record = ScheduledJobRecord::from_cron_job(&cron_job).unwrap();
        assert_eq!(record.key(), ObjectKey::new("ops", "backup"));
        assert_eq!(record.schedule, "0 * * * *");
        assert_eq!(record.last_scheduled_time, Some(scheduled));
        assert_eq!(record.last_successful_time, None);
        assert!(!record.suspended);
        assert!(record.jobs.is_empty());
    }

    #[test]
    fn objects_without_namespace_are_rejected() {
        let mut cron_job = memory::cron_job("ops", "backup", "0 * * * *");
        cron_job.metadata.namespace = None;
        assert!(ScheduledJobRecord::from_cron_job(&cron_job).is_none());
    }

    #[test]
    fn pod_command_joins_command_and_args() {
        let mut pod = memory::pod_owned_by("ops", "backup-1-x", "backup-1", "alpine:3", &["sh", "-c"]);
        if let Some(spec) = pod.spec.as_mut() {
            spec.containers[0].args = Some(vec!["pg_dump > /backup/db.sql".to_string()]);
        }

        let record = PodRecord::from_pod(&pod).unwrap();
        assert_eq!(record.image.as_deref(), Some("alpine:3"));
        assert_eq!(record.command, "sh -c pg_dump > /backup/db.sql");
        assert_eq!(record.phase.as_deref(), Some("Running"));
    }

    #[test]
    fn serializes_with_camel_case_wire_names() {
        let job = memory::job_owned_by("ops", "backup-1", "backup");
        let record = JobRunRecord::from_job(&job).unwrap();
        let value = serde_json::to_value(&record).unwrap();

        assert!(value.get("startTime").is_some());
        assert!(value.get("completionTime").is_some());
        assert_eq!(value["status"]["active"], 1);
        assert_eq!(value["pods"], serde_json::json!([]));
    }
}
