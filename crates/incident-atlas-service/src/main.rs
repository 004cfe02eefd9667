use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use incident_atlas_core::{
    compute_stepwise, compute_toddow, parse_capabilities, parse_zone_offset, select_view,
    shape_record, AtlasError, AuditAction, AuditLogQuery, CallerContext, Capability, Record,
    RecordId, RecordInput, RecordPredicate,
};
use incident_atlas_store_sqlite::{render_tile_sql, SqliteAtlasStore};
use incident_atlas_tile_cache::{CacheError, MemoryTileCache, TileCache};
use serde::Serialize;
use serde_json::{json, Value};
use time::UtcOffset;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "atlas.v1";

#[derive(Clone)]
struct ServiceState {
    store: Arc<Mutex<SqliteAtlasStore>>,
    cache: Arc<dyn TileCache>,
    zone: UtcOffset,
    audit_max_span: time::Duration,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    validation_error_total: AtomicU64,
    permission_denied_total: AtomicU64,
    not_found_total: AtomicU64,
    cache_unavailable_total: AtomicU64,
    write_conflict_total: AtomicU64,
    audit_write_failure_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    validation_error_total: u64,
    permission_denied_total: u64,
    not_found_total: u64,
    cache_unavailable_total: u64,
    write_conflict_total: u64,
    audit_write_failure_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Parser)]
#[command(name = "incident-atlas-service")]
#[command(about = "HTTP service for incident record aggregation and audit queries")]
struct Args {
    #[arg(long, default_value = "./incident_atlas.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Tenant reference zone for date-part extraction, e.g. +08:00.
    #[arg(long, default_value = "Z")]
    zone_offset: String,
    #[arg(long, default_value_t = 31)]
    audit_max_span_days: i64,
    #[arg(long, default_value_t = 30)]
    tile_ttl_secs: i64,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            rejection.status(),
            "validation_error",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn atlas_failure(&self, err: &AtlasError) -> ServiceFailure {
        let (status, code) = match err {
            AtlasError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AtlasError::Permission(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            AtlasError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AtlasError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        self.telemetry.record_failure(code, false);
        Self::failure(status, code, err.to_string(), None)
    }

    fn cache_failure(&self, err: &CacheError) -> ServiceFailure {
        self.telemetry.record_failure("cache_unavailable", false);
        Self::failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "cache_unavailable",
            format!("{err}; retry without tilekey to list uncached"),
            None,
        )
    }

    fn classify_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        if let Some(atlas) = err.downcast_ref::<AtlasError>() {
            let (status, code) = match atlas {
                AtlasError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                AtlasError::Permission(_) => (StatusCode::FORBIDDEN, "permission_denied"),
                AtlasError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                AtlasError::Serialization(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            };
            return Self::failure(status, code, atlas.to_string(), None);
        }

        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("unique constraint failed")
            || normalized.contains("already exists")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteAtlasStore) -> Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|_| anyhow!("record store mutex poisoned"))?;
            op(&mut *guard)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "operation_timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn note_audit_failure(&self, action: AuditAction, record_id: RecordId, message: &str) {
        self.telemetry
            .audit_write_failure_total
            .fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            action = action.as_str(),
            record_id = %record_id,
            error = message,
            "audit append failed after a successful mutation; compliance gap"
        );
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "permission_denied" => {
                self.permission_denied_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "cache_unavailable" => {
                self.cache_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "write_conflict" => {
                self.write_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            permission_denied_total: self.permission_denied_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            cache_unavailable_total: self.cache_unavailable_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            audit_write_failure_total: self.audit_write_failure_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn header_capabilities(headers: &HeaderMap) -> Vec<Capability> {
    headers
        .get("x-caller-capabilities")
        .and_then(|value| value.to_str().ok())
        .map(parse_capabilities)
        .unwrap_or_default()
}

/// Identity arrives from the authenticating proxy; the service itself never
/// resolves or creates accounts.
fn caller_from_headers(headers: &HeaderMap) -> Option<CallerContext> {
    let actor_id = headers
        .get("x-caller-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Ulid::from_string(raw).ok())?;
    let username = headers
        .get("x-caller-username")
        .and_then(|value| value.to_str().ok())?
        .to_string();
    Some(CallerContext {
        actor_id,
        username,
        capabilities: header_capabilities(headers),
    })
}

fn require_writer(
    state: &ServiceState,
    headers: &HeaderMap,
) -> Result<CallerContext, ServiceFailure> {
    let Some(caller) = caller_from_headers(headers) else {
        state.telemetry.record_failure("validation_error", false);
        return Err(ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "x-caller-id and x-caller-username headers are required for mutations",
            None,
        ));
    };

    let can_write = caller
        .capabilities
        .iter()
        .any(|cap| matches!(cap, Capability::Admin | Capability::RecordWrite));
    if !can_write {
        state.telemetry.record_failure("permission_denied", false);
        return Err(ServiceState::failure(
            StatusCode::FORBIDDEN,
            "permission_denied",
            "record mutations require the record_write capability",
            None,
        ));
    }

    Ok(caller)
}

fn parse_record_id(state: &ServiceState, raw: &str) -> Result<RecordId, ServiceFailure> {
    Ulid::from_string(raw).map(RecordId).map_err(|err| {
        state.telemetry.record_failure("validation_error", false);
        ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("record id is not a valid identifier: {err}"),
            None,
        )
    })
}

fn build_predicate(
    state: &ServiceState,
    params: &BTreeMap<String, String>,
) -> Result<RecordPredicate, ServiceFailure> {
    RecordPredicate::from_params(params).map_err(|err| state.atlas_failure(&err))
}

fn require_record_type(
    state: &ServiceState,
    predicate: &RecordPredicate,
) -> Result<(), ServiceFailure> {
    if predicate.record_type.is_none() {
        state.telemetry.record_failure("validation_error", false);
        return Err(ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "record_type is required",
            None,
        ));
    }
    Ok(())
}

fn shape_records(
    state: &ServiceState,
    records: &[Record],
    headers: &HeaderMap,
) -> Result<Vec<Value>, ServiceFailure> {
    let view = select_view(&header_capabilities(headers));
    records
        .iter()
        .map(|record| shape_record(record, view))
        .collect::<Result<Vec<Value>, AtlasError>>()
        .map_err(|err| state.atlas_failure(&err))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/records", get(records_list).post(records_create))
        .route("/api/records/toddow", get(records_toddow))
        .route("/api/records/stepwise", get(records_stepwise))
        .route(
            "/api/records/:record_id",
            get(record_detail).put(records_update).delete(records_delete),
        )
        .route("/api/audit-log", get(audit_log_list).post(audit_log_reject))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let zone = parse_zone_offset(&args.zone_offset)?;

    let store = SqliteAtlasStore::open(&args.db)?;
    store.migrate()?;

    let state = ServiceState {
        store: Arc::new(Mutex::new(store)),
        cache: Arc::new(MemoryTileCache::new(time::Duration::seconds(
            args.tile_ttl_secs,
        ))),
        zone,
        audit_max_span: time::Duration::days(args.audit_max_span_days),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let purge_cache = Arc::clone(&state.cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if let Err(err) = purge_cache.purge_expired() {
                tracing::warn!(error = %err, "tile cache purge failed");
            }
        }
    });

    tracing::info!(bind = %args.bind, "incident-atlas-service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn records_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let predicate = build_predicate(&state, &params)?;
    let wants_tilekey = params.get("tilekey").map(String::as_str) == Some("true");

    let query_predicate = predicate.clone();
    let records = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "records_list",
            move |store| store.query_records(&query_predicate),
        )
        .await?;

    let shaped = shape_records(&state, &records, &headers)?;
    let mut payload = json!({ "records": shaped });

    // The cache write happens only on explicit request; plain listings
    // never touch the tile cache.
    if wants_tilekey {
        let sql = render_tile_sql(&predicate).map_err(|err| {
            let failure = ServiceState::classify_error(
                &err,
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            );
            state.telemetry.record_failure(failure.code, false);
            failure
        })?;
        let token = state
            .cache
            .store(&sql)
            .map_err(|err| state.cache_failure(&err))?;
        payload["tilekey"] = json!(token.to_string());
    }

    Ok(Json(envelope(payload)))
}

async fn record_detail(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let record_id = parse_record_id(&state, &record_id)?;

    let record = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "record_detail",
            move |store| store.get_record(record_id),
        )
        .await?
        .ok_or_else(|| {
            state.telemetry.record_failure("not_found", false);
            ServiceState::failure(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("record {record_id} does not exist"),
                None,
            )
        })?;

    let shaped = shape_records(&state, std::slice::from_ref(&record), &headers)?;
    let body = shaped.into_iter().next().unwrap_or(Value::Null);
    Ok(Json(envelope(body)))
}

async fn records_toddow(
    State(state): State<ServiceState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let predicate = build_predicate(&state, &params)?;
    require_record_type(&state, &predicate)?;

    let zone = state.zone;
    let bins = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "aggregation_failed",
            "records_toddow",
            move |store| compute_toddow(&*store, &predicate, zone),
        )
        .await?;

    Ok(Json(envelope(json!(bins))))
}

async fn records_stepwise(
    State(state): State<ServiceState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let predicate = build_predicate(&state, &params)?;
    require_record_type(&state, &predicate)?;

    let zone = state.zone;
    let bins = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "aggregation_failed",
            "records_stepwise",
            move |store| compute_stepwise(&*store, &predicate, zone),
        )
        .await?;

    Ok(Json(envelope(json!(bins))))
}

async fn records_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<RecordInput>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Value>>), ServiceFailure> {
    let caller = require_writer(&state, &headers)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;

    let (record, audit_error) = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "records_create",
            move |store| {
                let record = store.create_record(&input)?;
                let audit_error = store
                    .append_audit(
                        caller.actor_id,
                        &caller.username,
                        record.record_id,
                        AuditAction::Create,
                    )
                    .err()
                    .map(|err| err.to_string());
                Ok((record, audit_error))
            },
        )
        .await?;

    if let Some(message) = audit_error {
        state.note_audit_failure(AuditAction::Create, record.record_id, &message);
    }

    let shaped = shape_records(&state, std::slice::from_ref(&record), &headers)?;
    let body = shaped.into_iter().next().unwrap_or(Value::Null);
    Ok((StatusCode::CREATED, Json(envelope(body))))
}

async fn records_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
    payload: Result<Json<RecordInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let caller = require_writer(&state, &headers)?;
    let record_id = parse_record_id(&state, &record_id)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;

    let (record, audit_error) = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "records_update",
            move |store| {
                let record = store.update_record(record_id, &input)?;
                let audit_error = store
                    .append_audit(
                        caller.actor_id,
                        &caller.username,
                        record_id,
                        AuditAction::Update,
                    )
                    .err()
                    .map(|err| err.to_string());
                Ok((record, audit_error))
            },
        )
        .await?;

    if let Some(message) = audit_error {
        state.note_audit_failure(AuditAction::Update, record_id, &message);
    }

    let shaped = shape_records(&state, std::slice::from_ref(&record), &headers)?;
    let body = shaped.into_iter().next().unwrap_or(Value::Null);
    Ok(Json(envelope(body)))
}

async fn records_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let caller = require_writer(&state, &headers)?;
    let record_id = parse_record_id(&state, &record_id)?;

    let audit_error = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "records_delete",
            move |store| {
                store.delete_record(record_id)?;
                Ok(store
                    .append_audit(
                        caller.actor_id,
                        &caller.username,
                        record_id,
                        AuditAction::Delete,
                    )
                    .err()
                    .map(|err| err.to_string()))
            },
        )
        .await?;

    if let Some(message) = audit_error {
        state.note_audit_failure(AuditAction::Delete, record_id, &message);
    }

    Ok(Json(envelope(json!({
        "record_id": record_id.to_string(),
        "deleted": true
    }))))
}

async fn audit_log_list(
    State(state): State<ServiceState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let query = AuditLogQuery::from_params(&params).map_err(|err| state.atlas_failure(&err))?;
    let (min_date, max_date) = query
        .validate(state.audit_max_span)
        .map_err(|err| state.atlas_failure(&err))?;

    let action = query.action;
    let username = query.username.clone();
    let entries = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "audit_log_list",
            move |store| store.query_audit_log(min_date, max_date, action, username.as_deref()),
        )
        .await?;

    Ok(Json(envelope(json!(entries))))
}

/// The audit log has exactly one writer: the mutation path. Every direct
/// write attempt is rejected, whatever the caller's capabilities.
async fn audit_log_reject(State(state): State<ServiceState>) -> ServiceFailure {
    state.telemetry.record_failure("permission_denied", false);
    ServiceState::failure(
        StatusCode::FORBIDDEN,
        "permission_denied",
        "audit log entries are written by the mutation path only",
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use incident_atlas_core::parse_rfc3339;
    use std::sync::atomic::AtomicUsize;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    const ADMIN_ID: &str = "01J0SQQP7M70P6Y3R4T8D8G8M2";
    const TYPE_ID: &str = "01J0SQQP7M70P6Y3R4T8D8G8M3";

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    struct RecordingCache {
        inner: MemoryTileCache,
        store_calls: AtomicUsize,
    }

    impl RecordingCache {
        fn new() -> Self {
            Self {
                inner: MemoryTileCache::new(time::Duration::seconds(30)),
                store_calls: AtomicUsize::new(0),
            }
        }
    }

    impl TileCache for RecordingCache {
        fn store(&self, sql: &str) -> Result<incident_atlas_tile_cache::TileToken, CacheError> {
            let _ = self.store_calls.fetch_add(1, Ordering::Relaxed);
            self.inner.store(sql)
        }

        fn fetch(
            &self,
            token: &incident_atlas_tile_cache::TileToken,
        ) -> Result<Option<String>, CacheError> {
            self.inner.fetch(token)
        }

        fn purge_expired(&self) -> Result<usize, CacheError> {
            self.inner.purge_expired()
        }
    }

    struct FailingCache;

    impl TileCache for FailingCache {
        fn store(&self, _sql: &str) -> Result<incident_atlas_tile_cache::TileToken, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        fn fetch(
            &self,
            _token: &incident_atlas_tile_cache::TileToken,
        ) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        fn purge_expired(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    fn test_state(dir: &tempfile::TempDir, cache: Arc<dyn TileCache>) -> ServiceState {
        let store = must_ok(SqliteAtlasStore::open(&dir.path().join("atlas.sqlite3")));
        must_ok(store.migrate());
        ServiceState {
            store: Arc::new(Mutex::new(store)),
            cache,
            zone: must_ok(parse_zone_offset("+08:00")),
            audit_max_span: time::Duration::days(31),
            operation_timeout: Duration::from_millis(2500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str, capabilities: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(capabilities) = capabilities {
            builder = builder.header("x-caller-capabilities", capabilities);
        }
        match builder.body(Body::empty()) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    fn write_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .uri(uri)
            .method(method)
            .header("x-caller-id", ADMIN_ID)
            .header("x-caller-username", "admin")
            .header("x-caller-capabilities", "admin")
            .header("content-type", "application/json");
        let payload = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        match builder.body(payload) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    fn record_body(occurred: &str, data: Value) -> Value {
        json!({
            "record_type": TYPE_ID,
            "schema_version": 1,
            "occurred_from": occurred,
            "occurred_to": occurred,
            "geom": "POINT (120.81 15.18)",
            "location_text": "Gapan",
            "data": data
        })
    }

    async fn create_record(router: &Router, occurred: &str, data: Value) -> Value {
        let response = send(
            router,
            write_request("POST", "/api/records", Some(record_body(occurred, data))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await
    }

    fn local_parts(instant: &str) -> (u8, u8, u8) {
        let zone = must_ok(parse_zone_offset("+08:00"));
        let local = must_ok(parse_rfc3339(instant)).to_offset(zone);
        (
            local.weekday().number_from_monday() + 1,
            local.hour(),
            local.iso_week(),
        )
    }

    const NOW: &str = "2026-08-07T10:30:00Z";
    const THEN: &str = "2026-07-28T10:30:00Z";
    const BEFORE_THEN: &str = "2026-07-27T10:30:00Z";

    async fn seeded_router() -> (tempfile::TempDir, Router, Arc<RecordingCache>) {
        let dir = must_ok(tempfile::tempdir());
        let cache = Arc::new(RecordingCache::new());
        let state = test_state(&dir, cache.clone());
        let router = app(state);

        let _ = create_record(&router, NOW, json!({"Incident Details": {"Severity": 1}})).await;
        let _ = create_record(&router, THEN, json!({"Incident Details": {"Severity": 2}})).await;
        let _ = create_record(&router, THEN, json!({"Incident Details": {"Severity": 3}})).await;
        (dir, router, cache)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        let response = send(&router, get_request("/api/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.get("contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], json!("ok"));
    }

    #[tokio::test]
    async fn toddow_bins_three_records_into_two_cells() {
        let (_dir, router, _cache) = seeded_router().await;

        let uri = format!("/api/records/toddow?record_type={TYPE_ID}");
        let response = send(&router, get_request(&uri, Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let bins = match value["data"].as_array() {
            Some(bins) => bins,
            None => panic!("expected bin array, got {value}"),
        };
        assert_eq!(bins.len(), 2);

        let (now_dow, now_tod, _) = local_parts(NOW);
        let (then_dow, _, _) = local_parts(THEN);
        for bin in bins {
            if bin["dow"] == json!(now_dow) {
                assert_eq!(bin["tod"], json!(now_tod));
                assert_eq!(bin["count"], json!(1));
            } else {
                assert_eq!(bin["dow"], json!(then_dow));
                assert_eq!(bin["count"], json!(2));
            }
        }
    }

    #[tokio::test]
    async fn toddow_requires_record_type() {
        let (_dir, router, _cache) = seeded_router().await;
        let response = send(&router, get_request("/api/records/toddow", Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value["error"]["message"]
            .as_str()
            .is_some_and(|message| message.contains("record_type")));
    }

    #[tokio::test]
    async fn stepwise_buckets_by_week_and_requires_bounds() {
        let (_dir, router, _cache) = seeded_router().await;

        let uri = format!(
            "/api/records/stepwise?record_type={TYPE_ID}&occurred_min={}&occurred_max={}",
            BEFORE_THEN.replace(':', "%3A"),
            NOW.replace(':', "%3A"),
        );
        let response = send(&router, get_request(&uri, Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let bins = match value["data"].as_array() {
            Some(bins) => bins,
            None => panic!("expected bin array, got {value}"),
        };
        assert_eq!(bins.len(), 2);
        let total: u64 = bins
            .iter()
            .filter_map(|bin| bin["count"].as_u64())
            .sum();
        assert_eq!(total, 3);

        let (_, _, now_week) = local_parts(NOW);
        for bin in bins {
            if bin["week"] == json!(now_week) {
                assert_eq!(bin["count"], json!(1));
            } else {
                assert_eq!(bin["count"], json!(2));
            }
        }

        let unbounded = format!("/api/records/stepwise?record_type={TYPE_ID}");
        let response = send(&router, get_request(&unbounded, Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value["error"]["message"]
            .as_str()
            .is_some_and(|message| message.contains("occurred_min")));
    }

    #[tokio::test]
    async fn narrowing_bounds_filters_aggregation() {
        let (_dir, router, _cache) = seeded_router().await;

        let wide = format!(
            "/api/records/toddow?record_type={TYPE_ID}&occurred_min={}&occurred_max={}",
            BEFORE_THEN.replace(':', "%3A"),
            NOW.replace(':', "%3A"),
        );
        let response = send(&router, get_request(&wide, Some("admin"))).await;
        let wide_value = response_json(response).await;
        assert_eq!(wide_value["data"].as_array().map_or(0, Vec::len), 2);

        let narrow = format!(
            "/api/records/toddow?record_type={TYPE_ID}&occurred_min={}&occurred_max={}",
            "2026-08-06T10%3A30%3A00Z", NOW.replace(':', "%3A"),
        );
        let response = send(&router, get_request(&narrow, Some("admin"))).await;
        let narrow_value = response_json(response).await;
        assert_eq!(narrow_value["data"].as_array().map_or(0, Vec::len), 1);
    }

    #[tokio::test]
    async fn tilekey_flag_controls_cache_writes() {
        let (_dir, router, cache) = seeded_router().await;

        // Plain listings never touch the cache.
        for _ in 0..3 {
            let response = send(&router, get_request("/api/records", Some("admin"))).await;
            assert_eq!(response.status(), StatusCode::OK);
            let value = response_json(response).await;
            assert!(value["data"].get("tilekey").is_none());
        }
        assert_eq!(cache.store_calls.load(Ordering::Relaxed), 0);

        let uri = format!("/api/records?tilekey=true&record_type={TYPE_ID}");
        let response = send(&router, get_request(&uri, Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let token_raw = match value["data"]["tilekey"].as_str() {
            Some(token) => token.to_string(),
            None => panic!("expected tilekey in response, got {value}"),
        };
        assert_eq!(cache.store_calls.load(Ordering::Relaxed), 1);

        // The token resolves to replayable SQL for the tile renderer.
        let token = match incident_atlas_tile_cache::TileToken::parse(&token_raw) {
            Some(token) => token,
            None => panic!("tilekey is not a parseable token: {token_raw}"),
        };
        let sql = match must_ok(cache.fetch(&token)) {
            Some(sql) => sql,
            None => panic!("tilekey did not resolve to a cached query"),
        };
        assert!(sql.contains("FROM records"));
        assert!(!sql.contains('?'));
    }

    #[tokio::test]
    async fn cache_outage_is_distinct_from_a_miss() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(FailingCache));
        let router = app(state);

        // Listing without the flag never touches the failing cache.
        let response = send(&router, get_request("/api/records", Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, get_request("/api/records?tilekey=true", Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("cache_unavailable"));
    }

    #[tokio::test]
    async fn create_appends_exactly_one_audit_entry() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        let _ = create_record(&router, NOW, json!({})).await;

        let uri = audit_uri(None, None);
        let response = send(&router, get_request(&uri, Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let entries = match value["data"].as_array() {
            Some(entries) => entries,
            None => panic!("expected audit entries, got {value}"),
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["action"], json!("create"));
        assert_eq!(entries[0]["username"], json!("admin"));
    }

    fn audit_uri(action: Option<&str>, username: Option<&str>) -> String {
        let now = OffsetDateTime::now_utc();
        let min = must_ok(incident_atlas_core::format_rfc3339(
            now - time::Duration::days(10),
        ));
        let max = must_ok(incident_atlas_core::format_rfc3339(
            now + time::Duration::days(10),
        ));
        let mut uri = format!(
            "/api/audit-log?min_date={}&max_date={}",
            min.replace(':', "%3A"),
            max.replace(':', "%3A"),
        );
        if let Some(action) = action {
            uri.push_str(&format!("&action={action}"));
        }
        if let Some(username) = username {
            uri.push_str(&format!("&username={username}"));
        }
        uri
    }

    #[tokio::test]
    async fn audit_query_validates_span_and_filters() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        // One audit row per mutation: create, update, delete.
        let created = create_record(&router, NOW, json!({})).await;
        let record_id = match created["data"]["record_id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("expected record_id, got {created}"),
        };
        let update_uri = format!("/api/records/{record_id}");
        let response = send(
            &router,
            write_request("PUT", &update_uri, Some(record_body(NOW, json!({"City": "Gapan"})))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&router, write_request("DELETE", &update_uri, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Missing bounds and oversized spans are validation failures.
        let response = send(&router, get_request("/api/audit-log", Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value["error"]["message"]
            .as_str()
            .is_some_and(|message| message.contains("min_date")));

        let now = OffsetDateTime::now_utc();
        let long_ago = must_ok(incident_atlas_core::format_rfc3339(
            now - time::Duration::days(300),
        ));
        let today = must_ok(incident_atlas_core::format_rfc3339(now));
        let wide = format!(
            "/api/audit-log?min_date={}&max_date={}",
            long_ago.replace(':', "%3A"),
            today.replace(':', "%3A"),
        );
        let response = send(&router, get_request(&wide, Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // A bounded query sees all three actions in append order.
        let response = send(&router, get_request(&audit_uri(None, None), Some("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let actions: Vec<&str> = value["data"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry["action"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(actions, vec!["create", "update", "delete"]);

        let response = send(
            &router,
            get_request(&audit_uri(Some("delete"), None), Some("admin")),
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(value["data"].as_array().map_or(0, Vec::len), 1);

        let response = send(
            &router,
            get_request(&audit_uri(None, Some("not-a-user")), Some("admin")),
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(value["data"].as_array().map_or(0, Vec::len), 0);

        let response = send(
            &router,
            get_request(&audit_uri(None, Some("admin")), Some("admin")),
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(value["data"].as_array().map_or(0, Vec::len), 3);
    }

    #[tokio::test]
    async fn audit_log_rejects_writes_for_every_caller() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        // Admin capability does not open the write path.
        let response = send(&router, write_request("POST", "/api/audit-log", Some(json!({})))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let anonymous = match Request::builder()
            .uri("/api/audit-log")
            .method("POST")
            .body(Body::empty())
        {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        let response = send(&router, anonymous).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("permission_denied"));
    }

    #[tokio::test]
    async fn view_shaping_is_consistent_across_list_and_detail() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        let created = create_record(
            &router,
            NOW,
            json!({
                "Incident Details": {"Description": "collision"},
                "Person": [{"Name": "sensitive"}]
            }),
        )
        .await;
        let record_id = match created["data"]["record_id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("expected record_id, got {created}"),
        };

        // Elevated caller: full payload on both paths.
        let detail_uri = format!("/api/records/{record_id}");
        let response = send(&router, get_request(&detail_uri, Some("admin"))).await;
        let value = response_json(response).await;
        assert!(value["data"]["data"].get("Person").is_some());

        let response = send(&router, get_request("/api/records", Some("admin"))).await;
        let value = response_json(response).await;
        assert!(value["data"]["records"][0]["data"].get("Person").is_some());

        // Read-only caller: details sections only, on both paths.
        let response = send(&router, get_request(&detail_uri, Some("record_read"))).await;
        let value = response_json(response).await;
        assert!(value["data"]["data"].get("Person").is_none());
        assert!(value["data"]["data"].get("Incident Details").is_some());

        let response = send(&router, get_request("/api/records", None)).await;
        let value = response_json(response).await;
        assert!(value["data"]["records"][0]["data"].get("Person").is_none());
    }

    #[tokio::test]
    async fn mutations_require_identity_and_write_capability() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        // No identity headers at all.
        let anonymous = match Request::builder()
            .uri("/api/records")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(record_body(NOW, json!({})).to_string()))
        {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        let response = send(&router, anonymous).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Identity without write capability.
        let read_only = match Request::builder()
            .uri("/api/records")
            .method("POST")
            .header("x-caller-id", ADMIN_ID)
            .header("x-caller-username", "viewer")
            .header("x-caller-capabilities", "record_read")
            .header("content-type", "application/json")
            .body(Body::from(record_body(NOW, json!({})).to_string()))
        {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        let response = send(&router, read_only).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn record_detail_handles_bad_and_missing_ids() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        let response = send(&router, get_request("/api/records/not-an-id", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let missing = format!("/api/records/{}", Ulid::new());
        let response = send(&router, get_request(&missing, None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_record_submission_names_the_field() {
        let dir = must_ok(tempfile::tempdir());
        let state = test_state(&dir, Arc::new(RecordingCache::new()));
        let router = app(state);

        let mut body = record_body(NOW, json!({}));
        body["occurred_to"] = json!("2026-08-01T00:00:00Z");
        let response = send(&router, write_request("POST", "/api/records", Some(body))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value["error"]["message"]
            .as_str()
            .is_some_and(|message| message.contains("occurred_from")));
    }
}
