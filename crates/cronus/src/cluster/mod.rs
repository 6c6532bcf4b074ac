//! Access to the cluster API.
//!
//! Everything the engine reads from Kubernetes goes through [`ClusterProvider`]:
//! plain namespace-scoped listings of Jobs and Pods, a watch over CronJobs and
//! a pod log stream. No server-side filtering beyond the namespace is assumed.

mod kubernetes;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use self::kubernetes::KubeProvider;
pub use self::memory::MemoryProvider;

/// Identity of a namespaced resource. Unique within its kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A change observed on a watched resource collection.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// The object was created or modified.
    Applied(K),
    /// The object was deleted.
    Deleted(K),
    /// A full listing that replaces everything seen so far. The first one
    /// marks the end of the initial sync.
    Restarted(Vec<K>),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// List every Job in `namespace`.
    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>>;

    /// List every Pod in `namespace`.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// Read the complete log stream of a pod.
    async fn pod_logs(&self, pod: &ObjectKey) -> Result<Vec<u8>>;

    /// Watch CronJobs in `namespace`, or in every namespace when `None`.
    fn watch_cron_jobs(
        &self,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<WatchEvent<CronJob>>>;
}
