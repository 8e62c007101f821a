//! HTTP request handlers
//!
//! Each handler extracts the request, calls the escrow service or the job
//! manager, and wraps the result in a `{"success": ..}` envelope. Failures go
//! through the [`IntoResponse`] impl for [`AppError`].

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Request, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::jobs::{JobConfig, JobKind};
use crate::models::*;
use crate::state::AppState;

const MANUAL_RELEASE_REASON: &str = "manual_release";

type ApiResult = Result<Json<Value>>;

/// `Json` whose rejections come back as a 400 in the usual error envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::validation(rejection.body_text())
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/jobs/status", get(job_statuses))
        .route("/api/jobs/health", get(job_health))
        .route("/api/jobs/trigger/{job}", post(trigger_job))
        .route("/api/jobs/config", get(job_config).post(update_job_config))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/payments/{id}/confirm", post(confirm_payment))
        .route("/api/payments/{id}/refund", post(refund_payment))
        .route("/api/escrows/{id}", get(get_escrow))
        .route("/api/escrows/{id}/release", post(release_escrow))
        .route("/api/escrows/{id}/rating", post(rate_escrow))
        .route("/api/escrows/{id}/dispute", post(open_dispute))
        .route("/api/escrows/{id}/resolve", post(resolve_dispute))
        .with_state(state)
}

pub async fn ping() -> &'static str {
    "pong"
}

pub async fn job_statuses(State(state): State<AppState>) -> Json<Value> {
    let statuses = state.jobs.statuses();
    Json(json!({
        "success": true,
        "totalJobs": statuses.len(),
        "statuses": statuses,
    }))
}

/// 503 while any job is failing more often than not.
pub async fn job_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let health = state.jobs.health();
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "success": true, "health": health })))
}

pub async fn trigger_job(State(state): State<AppState>, Path(job): Path<String>) -> ApiResult {
    let kind: JobKind = job.parse()?;
    state.jobs.trigger(kind)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Job {job} triggered successfully"),
        "jobName": kind,
    })))
}

pub async fn job_config(State(state): State<AppState>) -> ApiResult {
    let config = state.jobs.config()?;
    Ok(Json(json!({ "success": true, "config": config.as_ref() })))
}

pub async fn update_job_config(
    State(state): State<AppState>,
    ApiJson(config): ApiJson<JobConfig>,
) -> ApiResult {
    state.jobs.update_config(config.clone())?;
    Ok(Json(json!({
        "success": true,
        "message": "Job configuration updated successfully",
        "config": config,
    })))
}

pub async fn create_payment(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreatePayment>,
) -> Result<(StatusCode, Json<Value>)> {
    let payment = state.escrow.create_payment(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "payment": payment })),
    ))
}

pub async fn get_payment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let payment = state.escrow.payment(&id).await?;
    Ok(Json(json!({ "success": true, "payment": payment })))
}

pub async fn confirm_payment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let (payment, escrow) = state.escrow.confirm_payment(&id).await?;
    Ok(Json(json!({
        "success": true,
        "payment": payment,
        "escrow": escrow,
    })))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<RefundRequest>,
) -> ApiResult {
    let payment = state
        .escrow
        .refund(&id, request.amount, &request.reason)
        .await?;
    Ok(Json(json!({ "success": true, "payment": payment })))
}

pub async fn get_escrow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let escrow = state.escrow.escrow(&id).await?;
    Ok(Json(json!({ "success": true, "escrow": escrow })))
}

pub async fn release_escrow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ReleaseRequest>,
) -> ApiResult {
    let reason = request.reason.as_deref().unwrap_or(MANUAL_RELEASE_REASON);
    let escrow = state.escrow.release_escrow(&id, reason).await?;
    Ok(Json(json!({ "success": true, "escrow": escrow })))
}

pub async fn rate_escrow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<RatingRequest>,
) -> ApiResult {
    let escrow = state
        .escrow
        .record_rating(&id, request.rating, &request.reviewer_id)
        .await?;
    Ok(Json(json!({ "success": true, "escrow": escrow })))
}

pub async fn open_dispute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<DisputeRequest>,
) -> ApiResult {
    let escrow = state.escrow.open_dispute(&id, &request.reason).await?;
    Ok(Json(json!({ "success": true, "escrow": escrow })))
}

pub async fn resolve_dispute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ResolveRequest>,
) -> ApiResult {
    let escrow = state
        .escrow
        .resolve_dispute(&id, &request.resolution)
        .await?;
    Ok(Json(json!({ "success": true, "escrow": escrow })))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::PaymentFailed { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::SchedulerNotStarted
            | AppError::SchedulerStopped
            | AppError::AlreadyStarted => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            info!(error = %self, %status, "request rejected");
        }

        let mut body = json!({ "success": false, "error": self.to_string() });
        if let AppError::UnknownJob { .. } = self {
            body["validJobs"] = json!(JobKind::valid_names());
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::Settings;
    use crate::infrastructure::{MemoryStore, SandboxGateway};
    use crate::services::notification_service::SlackNotifier;

    fn test_state() -> AppState {
        AppState::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(SandboxGateway::new(true)),
            Arc::new(SlackNotifier::new(None)),
            &Settings::default(),
        )
    }

    async fn post(router: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn malformed_config_body_is_a_json_bad_request() {
        let state = test_state();
        state.jobs.start(Settings::default().jobs).unwrap();
        let router = create_router(state.clone());

        // well-formed JSON that does not fit the config shape
        let (status, body) = post(
            router.clone(),
            "/api/jobs/config",
            r#"{"autoReleaseInterval":"soon"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));

        let (status, body) = post(router, "/api/payments", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        state.jobs.stop().await;
    }

    #[test]
    fn unknown_job_is_a_bad_request() {
        let response = AppError::UnknownJob {
            name: "nightly".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn scheduler_state_maps_to_conflict() {
        assert_eq!(
            AppError::SchedulerNotStarted.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::NotFound {
                kind: "escrow",
                id: "e-1".to_string()
            }
            .into_response()
            .status(),
            StatusCode::NOT_FOUND
        );
    }
}
