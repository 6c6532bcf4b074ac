use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use http::{header, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::{hierarchy::Hierarchy, metrics::gather_metrics, service::CronusService, Error};

type AppState = Arc<CronusService>;

/// Maps service errors onto HTTP statuses with a `{error, msg}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    msg: String,
}

impl ApiError {
    fn bad_request(error: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
            msg: msg.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, error) = match &err {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not found"),
            Error::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "deadline exceeded"),
            Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "request cancelled"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        Self {
            status,
            error,
            msg: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.msg);
        } else {
            warn!(status = %self.status, "{}", self.msg);
        }
        (
            self.status,
            Json(json!({ "error": self.error, "msg": self.msg })),
        )
            .into_response()
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> Result<Response, ApiError> {
    let body = gather_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

pub async fn list_cron_jobs(State(service): State<AppState>) -> Json<Hierarchy> {
    Json(service.list_scheduled_job_hierarchy().await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ApiError::bad_request(
                "invalid format",
                format!("unsupported log format {:?}, expected text or json", other),
            )),
        }
    }
}

pub async fn cron_job_logs(
    State(service): State<AppState>,
    Path((namespace, name, format)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let format = LogFormat::parse(&format)?;
    let (bundle, errors) = service
        .fetch_logs_for_scheduled_job(&name, &namespace)
        .await?;

    Ok(match format {
        LogFormat::Text => {
            let mut body = bundle.render_text();
            body.push_str(&errors.render_text());
            body.into_response()
        }
        LogFormat::Json => Json(json!({ "logs": bundle, "errors": errors })).into_response(),
    })
}

pub async fn pod_logs(
    State(service): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
) -> Result<String, ApiError> {
    Ok(service.fetch_single_pod_log(&pod, &namespace).await?)
}
