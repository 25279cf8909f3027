use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::server::ServerConfig;
use crate::alerts::{
    AccessPolicy, Alert, AlertId, AlertRegistry, ComparisonOp, InMemoryAlertRegistry, MetricKind,
    NotificationPolicy,
};
use crate::error::{CoreError, RecordKind};
use crate::maintenance::{RetentionSweeper, SweepReport};
use crate::metrics::{
    HealthMonitor, HealthSnapshot, Metric, MetricsRecorder, NewMetric, DEFAULT_WINDOW,
};
use crate::queue::{
    EnqueueOptions, EvaluationKind, EvaluationQueue, Outcome, QueueCounts, QueueItem,
    QueueItemId, QueueStatus, ReclaimReport, WorkerLeaseManager,
};
use crate::storage::{Journal, RecoveredState};
use crate::triggers::{Observation, ResolutionKind, Trigger, TriggerId, TriggerLedger};

/// Header carrying the caller identity
pub const CALLER_HEADER: &str = "x-caller";
const ANONYMOUS: &str = "anonymous";
const DEFAULT_BATCH_SIZE: usize = 10;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<InMemoryAlertRegistry>,
    pub queue: Arc<EvaluationQueue>,
    pub leases: Arc<WorkerLeaseManager>,
    pub ledger: Arc<TriggerLedger>,
    pub recorder: Arc<MetricsRecorder>,
    pub health: Arc<HealthMonitor>,
    pub sweeper: Arc<RetentionSweeper>,
    pub policy: Arc<dyn AccessPolicy>,
}

impl AppState {
    /// Wire every component, journaling through `journal` when given
    pub fn from_config(config: &ServerConfig, journal: Option<Arc<dyn Journal>>) -> Self {
        let mut registry = InMemoryAlertRegistry::new();
        if let Some(journal) = &journal {
            registry = registry.with_journal(Arc::clone(journal));
        }
        let registry = Arc::new(registry);

        let mut queue = EvaluationQueue::new(registry.clone(), config.queue.clone());
        let mut ledger = TriggerLedger::new(registry.clone());
        let mut recorder = MetricsRecorder::new();
        if let Some(journal) = &journal {
            queue = queue.with_journal(Arc::clone(journal));
            ledger = ledger.with_journal(Arc::clone(journal));
            recorder = recorder.with_journal(Arc::clone(journal));
        }
        let queue = Arc::new(queue);
        let recorder = Arc::new(recorder);

        Self {
            leases: Arc::new(WorkerLeaseManager::new(Arc::clone(&queue))),
            ledger: Arc::new(ledger),
            health: Arc::new(HealthMonitor::with_config(
                Arc::clone(&queue),
                Arc::clone(&recorder),
                config.health.clone(),
            )),
            sweeper: Arc::new(RetentionSweeper::new(
                Arc::clone(&queue),
                Arc::clone(&recorder),
                config.retention.clone(),
            )),
            policy: config.access.policy(),
            registry,
            queue,
            recorder,
        }
    }

    /// Load replayed journal state into the in-memory components
    pub fn restore(&self, recovered: RecoveredState) {
        self.registry.restore(recovered.alerts.into_values());
        self.queue.restore(recovered.queue_items.into_values());
        self.ledger.restore(recovered.triggers.into_values());
        self.recorder.restore(recovered.metrics.into_values());
    }
}

/// Check that the caller may see records of `alert_id`. Denials are reported
/// as the absence of the record being asked for.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    alert_id: &AlertId,
    kind: RecordKind,
    id: Uuid,
) -> Result<(), ApiError> {
    state
        .registry
        .get_for(&caller(headers), alert_id, state.policy.as_ref())
        .map(|_| ())
        .map_err(|_| ApiError::Core(CoreError::not_found(kind, id)))
}

fn caller(headers: &HeaderMap) -> String {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub version: &'static str,
    pub health: HealthSnapshot,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        health: state.health.cached_snapshot(DEFAULT_WINDOW),
    })
}

#[derive(Deserialize)]
pub struct SnapshotParams {
    pub window_secs: Option<u64>,
}

pub async fn health_snapshot(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SnapshotParams>,
) -> Result<Json<HealthSnapshot>, ApiError> {
    let window = match params.window_secs {
        Some(0) => return Err(ApiError::BadRequest("window_secs must be positive".into())),
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_WINDOW,
    };
    Ok(Json(state.health.snapshot(window)))
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Deserialize)]
pub struct AlertRequest {
    pub metric_kind: MetricKind,
    pub comparison: ComparisonOp,
    pub threshold: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub consecutive_breaches_required: Option<u32>,
    #[serde(default)]
    pub evaluation_window_secs: Option<u64>,
    #[serde(default)]
    pub notification: Option<NotificationPolicy>,
}

impl AlertRequest {
    fn into_alert(self, owner: &str) -> Alert {
        let mut alert = Alert::new(owner, self.metric_kind, self.comparison, self.threshold);
        if let Some(unit) = self.unit {
            alert = alert.with_unit(unit);
        }
        if let Some(active) = self.active {
            alert = alert.with_active(active);
        }
        if let Some(required) = self.consecutive_breaches_required {
            alert = alert.with_consecutive_breaches(required);
        }
        if let Some(secs) = self.evaluation_window_secs {
            alert = alert.with_evaluation_window(Duration::from_secs(secs));
        }
        if let Some(notification) = self.notification {
            alert = alert.with_notification(notification);
        }
        alert
    }
}

pub async fn create_alert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AlertRequest>,
) -> Result<(StatusCode, Json<Alert>), ApiError> {
    let alert = request.into_alert(&caller(&headers));
    let id = state.registry.create(alert)?;
    Ok((StatusCode::CREATED, Json(state.registry.get(&id)?)))
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Vec<Alert>> {
    Json(
        state
            .registry
            .list_for(&caller(&headers), state.policy.as_ref()),
    )
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AlertId>,
) -> Result<Json<Alert>, ApiError> {
    let alert = state
        .registry
        .get_for(&caller(&headers), &id, state.policy.as_ref())?;
    Ok(Json(alert))
}

pub async fn update_alert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AlertId>,
    Json(request): Json<AlertRequest>,
) -> Result<Json<Alert>, ApiError> {
    let caller = caller(&headers);
    let mut alert = request.into_alert(&caller);
    alert.id = id;
    Ok(Json(state.registry.update(&caller, alert)?))
}

#[derive(Serialize)]
pub struct RemoveAlertResponse {
    pub id: AlertId,
    pub purged_queue_items: usize,
}

pub async fn delete_alert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AlertId>,
) -> Result<Json<RemoveAlertResponse>, ApiError> {
    state.registry.remove(&caller(&headers), &id)?;
    let purged_queue_items = state.queue.purge_alert(&id)?;
    Ok(Json(RemoveAlertResponse {
        id,
        purged_queue_items,
    }))
}

pub async fn alert_queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AlertId>,
) -> Result<Json<Vec<QueueItem>>, ApiError> {
    state
        .registry
        .get_for(&caller(&headers), &id, state.policy.as_ref())?;
    Ok(Json(state.queue.list_by_alert(&id)))
}

pub async fn alert_triggers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<AlertId>,
) -> Result<Json<Vec<Trigger>>, ApiError> {
    let triggers =
        state
            .ledger
            .list_for_alert_as(&caller(&headers), &id, state.policy.as_ref())?;
    Ok(Json(triggers))
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub alert_id: AlertId,
    #[serde(default)]
    pub kind: Option<EvaluationKind>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<QueueItem>), ApiError> {
    state
        .registry
        .get_for(&caller(&headers), &request.alert_id, state.policy.as_ref())?;

    let options = EnqueueOptions {
        priority: request.priority,
        scheduled_at: request.scheduled_at,
    };
    let id = state.queue.enqueue_with(
        request.alert_id,
        request.kind.unwrap_or(EvaluationKind::Manual),
        options,
    )?;
    Ok((StatusCode::CREATED, Json(state.queue.get(&id)?)))
}

pub async fn queue_counts(State(state): State<Arc<AppState>>) -> Json<QueueCounts> {
    Json(state.queue.counts())
}

pub async fn get_queue_item(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<QueueItemId>,
) -> Result<Json<QueueItem>, ApiError> {
    let item = state.queue.get(&id)?;
    authorize(&state, &headers, &item.alert_id, RecordKind::QueueItem, id)?;
    Ok(Json(item))
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Serialize)]
pub struct ClaimResponse {
    pub worker_id: String,
    pub items: Vec<QueueItem>,
}

pub async fn claim(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let items = state.leases.claim_batch(
        request.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        &request.worker_id,
    )?;
    Ok(Json(ClaimResponse {
        worker_id: request.worker_id,
        items,
    }))
}

/// Evaluated value carried alongside a successful outcome
#[derive(Deserialize)]
pub struct ObservationInput {
    pub metric_value: f64,
    pub is_breach: bool,
}

#[derive(Deserialize)]
pub struct OutcomeRequest {
    pub worker_id: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub observation: Option<ObservationInput>,
}

#[derive(Serialize)]
pub struct OutcomeResponse {
    pub item: QueueItem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    /// Set when the outcome was committed but its observation was not recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_error: Option<String>,
}

pub async fn report_outcome(
    State(state): State<Arc<AppState>>,
    Path(id): Path<QueueItemId>,
    Json(request): Json<OutcomeRequest>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let item = state
        .queue
        .report_outcome(id, &request.worker_id, request.outcome)?;

    let mut response = OutcomeResponse {
        item,
        observation: None,
        observation_error: None,
    };
    if let Some(input) = request.observation {
        if response.item.status == QueueStatus::Completed {
            match state.ledger.record_observation(
                response.item.alert_id,
                input.metric_value,
                input.is_breach,
            ) {
                Ok(observation) => response.observation = Some(observation),
                Err(e) => {
                    tracing::warn!(
                        item_id = %id,
                        alert_id = %response.item.alert_id,
                        error = %e,
                        "Outcome committed but observation was not recorded"
                    );
                    response.observation_error = Some(e.to_string());
                }
            }
        }
    }

    Ok(Json(response))
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Deserialize)]
pub struct ObserveRequest {
    pub alert_id: AlertId,
    pub metric_value: f64,
    pub is_breach: bool,
}

pub async fn observe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ObserveRequest>,
) -> Result<Json<Observation>, ApiError> {
    state
        .registry
        .get_for(&caller(&headers), &request.alert_id, state.policy.as_ref())?;
    let observation =
        state
            .ledger
            .record_observation(request.alert_id, request.metric_value, request.is_breach)?;
    Ok(Json(observation))
}

#[derive(Serialize)]
pub struct TriggerResponse {
    #[serde(flatten)]
    pub trigger: Trigger,
    pub actionable: bool,
}

pub async fn get_trigger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TriggerId>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let trigger = state.ledger.get(&id)?;
    authorize(&state, &headers, &trigger.alert_id, RecordKind::Trigger, id)?;
    let actionable = state.ledger.is_actionable(&id)?;
    Ok(Json(TriggerResponse {
        trigger,
        actionable,
    }))
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub resolution: Option<ResolutionKind>,
}

pub async fn resolve_trigger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TriggerId>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Trigger>, ApiError> {
    let alert_id = state.ledger.get(&id)?.alert_id;
    authorize(&state, &headers, &alert_id, RecordKind::Trigger, id)?;

    let trigger = match request.resolution.unwrap_or(ResolutionKind::Manual) {
        ResolutionKind::Manual => state.ledger.resolve_manually(id)?,
        ResolutionKind::Timeout => state.ledger.resolve_by_timeout(id)?,
        ResolutionKind::Automatic => {
            return Err(ApiError::BadRequest(
                "automatic resolution is recorded by observations".into(),
            ))
        }
    };
    Ok(Json(trigger))
}

// ============================================================================
// Metrics & Maintenance
// ============================================================================

pub async fn record_metric(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewMetric>,
) -> Result<(StatusCode, Json<Metric>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.recorder.record(request)?)))
}

pub async fn sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.sweeper.sweep()?))
}

pub async fn reclaim(State(state): State<Arc<AppState>>) -> Result<Json<ReclaimReport>, ApiError> {
    Ok(Json(state.leases.reclaim_expired()?))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Core(CoreError),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            ApiError::Core(err) => {
                let status = match &err {
                    CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                    CoreError::InvalidTransition { .. } | CoreError::ExhaustedRetries { .. } => {
                        StatusCode::CONFLICT
                    }
                    CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    CoreError::StorageFailure(_) => {
                        tracing::error!(error = %err, "Request failed on storage");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                };

                let mut body = serde_json::json!({ "error": err.to_string() });
                if let CoreError::ExhaustedRetries {
                    attempts,
                    last_error,
                    ..
                } = &err
                {
                    body["attempts"] = serde_json::json!(attempts);
                    body["last_error"] = serde_json::json!(last_error);
                }
                (status, body)
            }
        };

        (status, Json(body)).into_response()
    }
}
