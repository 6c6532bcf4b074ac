mod routes;

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{service::CronusService, Result};

pub use routes::ApiError;

pub struct Server {
    service: Arc<CronusService>,
}

impl Server {
    pub fn new(service: Arc<CronusService>) -> Self {
        Self { service }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/api/cronjobs", get(routes::list_cron_jobs))
            .route(
                "/api/logs/{namespace}/{name}/{format}",
                get(routes::cron_job_logs),
            )
            .route("/api/pods/{namespace}/{pod}/logs", get(routes::pod_logs))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.service)
    }

    /// Serve on `addr` until `signal` resolves.
    pub async fn start<F>(self, addr: &str, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, signal).await
    }

    /// Serve on `listener` until `signal` resolves. The service's shutdown
    /// token is cancelled as soon as the signal fires, so requests still in
    /// flight abort instead of running out their deadline.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Listening on {}", listener.local_addr()?);

        let token = self.service.shutdown_token().clone();
        let shutdown = async move {
            signal.await;
            info!("Shutting down, cancelling in-flight requests");
            token.cancel();
        };

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
