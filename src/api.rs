//! HTTP API handlers for envmon.
//!
//! Request bodies are validated here and nowhere else. Readings that pass
//! validation go through the [`Ingestor`]; a `201` means the reading is
//! stored. Alert notifications continue in the background and never change
//! the response.
//!
//! Every rejected body, whether it failed to parse or failed validation,
//! gets `400` with an `{"errors": ...}` object keyed by field.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::ingest::{Ingested, Ingestor};
use crate::live;
use crate::model::{
    AgentCommand, CommandRequest, EnvironmentPage, EnvironmentReadingRequest, PageQuery,
    Pagination, RangeQuery, Reading, RecipientRequest, StatsQuery, SystemReadingRequest,
};
use crate::notify::bus::{EventBus, LiveEvent};
use crate::storage::Storage;

/// Topic carrying commands for a device's agent.
pub const AGENT_COMMAND_TOPIC: &str = "agentCommand";

/// Largest page size accepted by `GET /api/environment`.
const MAX_PAGE_LIMIT: u32 = 1000;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub ingestor: Arc<Ingestor>,
    pub bus: Arc<EventBus>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/environment",
            get(list_environment).post(post_environment),
        )
        .route("/api/environment/latest", get(latest_environment))
        .route("/api/environment/range", get(environment_range))
        .route("/api/environment/stats", get(environment_stats))
        .route("/api/system/metrics", post(post_system_metrics))
        .route("/api/system/latest", get(latest_system))
        .route("/api/system/range", get(system_range))
        .route("/api/system/devices", get(system_devices))
        .route("/api/system/command", post(post_system_command))
        .route("/api/recipients", post(post_recipient))
        .route("/ws", get(live::live_socket))
        .route("/health", get(health_check))
        .with_state(state)
}

/// A stored reading together with its row id.
#[derive(Serialize)]
struct Created {
    id: i64,
    #[serde(flatten)]
    reading: Reading,
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

fn server_error() -> Response {
    message(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
}

fn validation_failed(errors: validator::ValidationErrors) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))).into_response()
}

/// JSON body extractor whose rejections share the validation error shape.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(BodyRejection))]
pub struct JsonBody<T>(pub T);

/// A request body that could not be read as the expected JSON.
#[derive(Debug)]
pub struct BodyRejection(JsonRejection);

impl From<JsonRejection> for BodyRejection {
    fn from(rejection: JsonRejection) -> Self {
        Self(rejection)
    }
}

impl IntoResponse for BodyRejection {
    fn into_response(self) -> Response {
        let text = self.0.body_text();
        warn!(error = %text, "Rejected malformed request body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "errors": {
                    "body": [{ "code": "invalid_body", "message": text, "params": {} }]
                }
            })),
        )
            .into_response()
    }
}

/// Shared tail of both ingestion handlers.
async fn ingest(state: &AppState, reading: Reading) -> Response {
    let device_id = reading.device_id().to_string();
    let kind = reading.kind();

    match state.ingestor.ingest(reading).await {
        Ok(Ingested {
            id,
            reading,
            admitted,
            dispatch,
        }) => {
            // Notifications finish on their own.
            drop(dispatch);
            info!(
                id,
                device_id = %device_id,
                kind = ?kind,
                alert_count = admitted.len(),
                "Reading recorded"
            );
            (StatusCode::CREATED, Json(Created { id, reading })).into_response()
        }
        Err(e) => {
            warn!(device_id = %device_id, error = %e, "Failed to record reading");
            server_error()
        }
    }
}

// ============================================================================
// Environment readings
// ============================================================================

/// POST /api/environment - Record an environment sensor reading.
///
/// # Request Body
///
/// ```json
/// {
///     "deviceId": "sensor-001",
///     "temperature": 22.5,
///     "humidity": 45,
///     "airQuality": 38,
///     "pressure": 1013.2,
///     "lightLevel": 320,
///     "location": "Server Room"
/// }
/// ```
///
/// Returns `201 Created` with the stored reading, `400` with `{"errors": ...}`
/// when validation fails.
#[instrument(skip(state, request))]
pub async fn post_environment(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<EnvironmentReadingRequest>,
) -> Response {
    if let Err(errors) = request.validate() {
        warn!(error_count = errors.field_errors().len(), "Rejected environment reading");
        return validation_failed(errors);
    }

    let reading = request.into_reading(Utc::now());
    ingest(&state, reading.into()).await
}

/// GET /api/environment - Paginated readings, newest first.
///
/// # Query Parameters
///
/// - `page` (optional): 1-based page number (default: 1)
/// - `limit` (optional): Page size (default: 50)
#[instrument(skip(state))]
pub async fn list_environment(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Response {
    let page = query.page.max(1);
    let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);

    match state.storage.environment_page(page, limit).await {
        Ok((data, total)) => {
            let pages = (total + i64::from(limit) - 1) / i64::from(limit);
            Json(EnvironmentPage {
                data,
                pagination: Pagination {
                    page,
                    limit,
                    total,
                    pages,
                },
            })
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to list environment readings");
            server_error()
        }
    }
}

/// GET /api/environment/latest - Most recent reading, `404` when none exist.
#[instrument(skip(state))]
pub async fn latest_environment(State(state): State<AppState>) -> Response {
    match state.storage.latest_environment().await {
        Ok(Some(reading)) => Json(reading).into_response(),
        Ok(None) => message(StatusCode::NOT_FOUND, "No data found"),
        Err(e) => {
            warn!(error = %e, "Failed to fetch latest environment reading");
            server_error()
        }
    }
}

/// GET /api/environment/range - Readings between two instants, oldest first.
///
/// # Query Parameters
///
/// - `startDate` (required): RFC 3339 timestamp
/// - `endDate` (required): RFC 3339 timestamp
/// - `deviceId` (optional): Restrict to one device
#[instrument(skip(state))]
pub async fn environment_range(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (Some(start), Some(end)) = (query.start_date, query.end_date) else {
        return message(StatusCode::BAD_REQUEST, "Start date and end date are required");
    };

    match state
        .storage
        .environment_range(start, end, query.device_id.as_deref())
        .await
    {
        Ok(readings) => {
            info!(count = readings.len(), "Environment range queried");
            Json(readings).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to query environment range");
            server_error()
        }
    }
}

/// GET /api/environment/stats - Aggregates over `1h`, `24h` (default), `7d` or `30d`.
#[instrument(skip(state))]
pub async fn environment_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let since = Utc::now() - query.lookback();

    match state.storage.environment_stats(since).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to compute environment stats");
            server_error()
        }
    }
}

// ============================================================================
// System readings
// ============================================================================

/// POST /api/system/metrics - Record a system agent reading.
///
/// Only `deviceId` is required. The timestamp is assigned by the server.
#[instrument(skip(state, request))]
pub async fn post_system_metrics(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<SystemReadingRequest>,
) -> Response {
    if let Err(errors) = request.validate() {
        warn!(error_count = errors.field_errors().len(), "Rejected system reading");
        return validation_failed(errors);
    }

    let reading = request.into_reading(Utc::now());
    ingest(&state, reading.into()).await
}

#[instrument(skip(state))]
pub async fn latest_system(State(state): State<AppState>) -> Response {
    match state.storage.latest_system().await {
        Ok(Some(reading)) => Json(reading).into_response(),
        Ok(None) => message(StatusCode::NOT_FOUND, "No data found"),
        Err(e) => {
            warn!(error = %e, "Failed to fetch latest system reading");
            server_error()
        }
    }
}

#[instrument(skip(state))]
pub async fn system_range(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (Some(start), Some(end)) = (query.start_date, query.end_date) else {
        return message(StatusCode::BAD_REQUEST, "Start date and end date are required");
    };

    match state
        .storage
        .system_range(start, end, query.device_id.as_deref())
        .await
    {
        Ok(readings) => Json(readings).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to query system range");
            server_error()
        }
    }
}

/// POST /api/system/command - Relay a command to a device's agent.
///
/// ```json
/// { "deviceId": "laptop1", "command": "open-task-manager" }
/// ```
///
/// The command is published as an `agentCommand` event addressed to the
/// device; only live connections registered for it receive it.
#[instrument(skip(state, request))]
pub async fn post_system_command(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CommandRequest>,
) -> Response {
    if let Err(errors) = request.validate() {
        warn!(error_count = errors.field_errors().len(), "Rejected agent command");
        return validation_failed(errors);
    }

    let command = match request.command.as_deref().map(str::parse::<AgentCommand>) {
        Some(Ok(command)) => command,
        _ => return message(StatusCode::BAD_REQUEST, "Unsupported command"),
    };
    let Some(device_id) = request.device_id else {
        return message(StatusCode::BAD_REQUEST, "deviceId is required");
    };

    state.bus.publish(LiveEvent::for_device(
        device_id.clone(),
        AGENT_COMMAND_TOPIC,
        json!({ "command": command }),
    ));
    info!(device_id = %device_id, command = command.as_str(), "Agent command relayed");

    Json(json!({ "success": true })).into_response()
}

/// GET /api/system/devices - The latest reading from every known device.
#[instrument(skip(state))]
pub async fn system_devices(State(state): State<AppState>) -> Response {
    match state.storage.latest_system_per_device().await {
        Ok(devices) => {
            info!(device_count = devices.len(), "System devices queried");
            Json(devices).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to list system devices");
            server_error()
        }
    }
}

// ============================================================================
// Recipients
// ============================================================================

/// POST /api/recipients - Opt an address in or out of alert notifications.
///
/// ```json
/// { "email": "ops@example.com", "name": "Ops", "notifications": true }
/// ```
#[instrument(skip(state, request))]
pub async fn post_recipient(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<RecipientRequest>,
) -> Response {
    if let Err(errors) = request.validate() {
        return validation_failed(errors);
    }

    match state
        .storage
        .upsert_recipient(&request.email, request.name.as_deref(), request.notifications)
        .await
    {
        Ok(()) => {
            info!(notifications = request.notifications, "Recipient updated");
            (
                StatusCode::OK,
                Json(json!({
                    "email": request.email,
                    "notifications": request.notifications,
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to update recipient");
            server_error()
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
