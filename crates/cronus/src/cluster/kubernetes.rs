use async_trait::async_trait;
use futures::{stream::BoxStream, AsyncReadExt, StreamExt};
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use kube::{
    api::{Api, ListParams, LogParams},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::debug;

use super::{ClusterProvider, ObjectKey, WatchEvent};
use crate::{Error, Result};

/// [`ClusterProvider`] backed by the Kubernetes API server.
///
/// The underlying [`Client`] is cheap to clone and safe to share between
/// concurrent requests.
#[derive(Clone)]
pub struct KubeProvider {
    client: Client,
}

impl KubeProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration, falling back to the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Kubernetes(format!("failed to create client: {}", e)))?;

        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterProvider for KubeProvider {
    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let list = jobs.list(&ListParams::default()).await?;
        debug!(namespace, count = list.items.len(), "listed jobs");
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await?;
        debug!(namespace, count = list.items.len(), "listed pods");
        Ok(list.items)
    }

    async fn pod_logs(&self, pod: &ObjectKey) -> Result<Vec<u8>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let stream = pods.log_stream(&pod.name, &LogParams::default()).await?;

        let mut reader = Box::pin(stream);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    fn watch_cron_jobs(
        &self,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<WatchEvent<CronJob>>> {
        let api: Api<CronJob> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Applied(obj)) => Ok(WatchEvent::Applied(obj)),
                Ok(watcher::Event::Deleted(obj)) => Ok(WatchEvent::Deleted(obj)),
                Ok(watcher::Event::Restarted(objs)) => Ok(WatchEvent::Restarted(objs)),
                Err(e) => Err(Error::Kubernetes(format!("CronJob watch failed: {}", e))),
            })
            .boxed()
    }
}
