use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use sefi_api::{
    init_tracing, HealthReport, SefiApi, SefiConfig, StatusReport, SubmitRequest, SubmitResponse,
    API_CONTRACT_VERSION,
};
use sefi_core::{SefiError, UnitKind, WorkUnit};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: Arc<SefiApi>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WorkQuery {
    #[serde(default = "default_kind")]
    kind: UnitKind,
}

fn default_kind() -> UnitKind {
    UnitKind::VerifyFinding
}

#[derive(Debug, Clone, Serialize)]
struct WorkResponse {
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<WorkUnit>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssignRequest {
    worker_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct UnitStateResponse {
    unit_id: String,
    worker_id: Option<String>,
    completed: bool,
}

#[derive(Debug, Parser)]
#[command(name = "sefi-service")]
#[command(about = "Local HTTP service for SEFI work units")]
struct Args {
    /// YAML configuration file; `SEFI_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<SefiError>() {
            Some(SefiError::UnknownUnit(_)) => StatusCode::NOT_FOUND,
            Some(
                SefiError::AlreadyAssigned { .. }
                | SefiError::AlreadyCompleted(_)
                | SefiError::DuplicateUnit(_)
                | SefiError::SourceInFlight(_),
            ) => StatusCode::CONFLICT,
            Some(SefiError::Collaborator(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        let error = format!("{err:#}");
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(%error, "collaborator failure");
        }
        ServiceError { status, service_contract_version: SERVICE_CONTRACT_VERSION, error }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/work", get(next_work))
        .route("/v1/work/:unit_id/assign", post(assign_work))
        .route("/v1/work/:unit_id/complete", post(complete_work))
        .route("/v1/result", post(submit_result))
        .route("/v1/status", get(status))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SefiConfig::load(args.config.as_deref())?;
    init_tracing(&config.log_level)?;

    let state = ServiceState { api: Arc::new(SefiApi::open(&config)?) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "sefi service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthReport>> {
    Json(envelope(state.api.health()))
}

async fn next_work(
    State(state): State<ServiceState>,
    Query(query): Query<WorkQuery>,
) -> Result<Json<ServiceEnvelope<WorkResponse>>, ServiceError> {
    let unit = state.api.next_unit(query.kind)?;
    Ok(Json(envelope(WorkResponse { available: unit.is_some(), unit })))
}

async fn assign_work(
    State(state): State<ServiceState>,
    Path(unit_id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<ServiceEnvelope<UnitStateResponse>>, ServiceError> {
    state.api.assign(&unit_id, &request.worker_id)?;
    Ok(Json(envelope(UnitStateResponse {
        unit_id,
        worker_id: Some(request.worker_id),
        completed: false,
    })))
}

async fn complete_work(
    State(state): State<ServiceState>,
    Path(unit_id): Path<String>,
) -> Result<Json<ServiceEnvelope<UnitStateResponse>>, ServiceError> {
    state.api.complete(&unit_id)?;
    Ok(Json(envelope(UnitStateResponse { unit_id, worker_id: None, completed: true })))
}

async fn submit_result(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<ServiceEnvelope<SubmitResponse>>, ServiceError> {
    let response = state.api.submit(&request)?;
    Ok(Json(envelope(response)))
}

async fn status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StatusReport>>, ServiceError> {
    Ok(Json(envelope(state.api.status()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use sefi_store_sqlite::SqliteProvenanceLookup;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        router: Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let data_dir = dir.path().join("data");
        let config = SefiConfig {
            findings_db_path: data_dir.join("findings.db"),
            corpus_db_path: data_dir.join("sefi.db"),
            claims_path: data_dir.join("claims.json"),
            relationships_path: data_dir.join("relationships.json"),
            data_dir,
            ..SefiConfig::default()
        };
        std::fs::create_dir_all(&config.data_dir)
            .unwrap_or_else(|err| panic!("failed to create data dir: {err}"));
        std::fs::write(
            &config.claims_path,
            json!([{"claim_id": "c-1", "claim": "The ledger shows a wire transfer.", "cited_eftas": ["EFTA00000300"], "primary_datasets": [9]}])
                .to_string(),
        )
        .unwrap_or_else(|err| panic!("failed to write claims: {err}"));

        let corpus = SqliteProvenanceLookup::open(&config.corpus_db_path)
            .unwrap_or_else(|err| panic!("failed to open corpus db: {err:#}"));
        corpus.ensure_schema().unwrap_or_else(|err| panic!("failed to create schema: {err:#}"));
        corpus.insert_range(9, 1, 999).unwrap_or_else(|err| panic!("failed to seed range: {err:#}"));
        drop(corpus);

        let api = SefiApi::open(&config).unwrap_or_else(|err| panic!("failed to open api: {err:#}"));
        Fixture { _dir: dir, router: app(ServiceState { api: Arc::new(api) }) }
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

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn unit_id_of(value: &Value) -> String {
        value
            .pointer("/data/unit/unit_id")
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing unit id in {value}"))
            .to_string()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let fx = fixture();
        let response = send(&fx.router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/findings_db_reachable"), Some(&Value::Bool(true)));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn work_is_handed_out_once_until_completed() {
        let fx = fixture();
        let first = response_json(send(&fx.router, "GET", "/v1/work", None).await).await;
        assert_eq!(first.pointer("/data/available"), Some(&Value::Bool(true)));
        let unit_id = unit_id_of(&first);

        let exhausted = response_json(send(&fx.router, "GET", "/v1/work", None).await).await;
        assert_eq!(exhausted.pointer("/data/available"), Some(&Value::Bool(false)));
        assert!(exhausted.pointer("/data/unit").is_none());

        let assign_uri = format!("/v1/work/{unit_id}/assign");
        let assigned =
            send(&fx.router, "POST", &assign_uri, Some(json!({"worker_id": "w-1"}))).await;
        assert_eq!(assigned.status(), StatusCode::OK);
        let again = send(&fx.router, "POST", &assign_uri, Some(json!({"worker_id": "w-2"}))).await;
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let complete_uri = format!("/v1/work/{unit_id}/complete");
        assert_eq!(send(&fx.router, "POST", &complete_uri, None).await.status(), StatusCode::OK);
        let reissued = response_json(send(&fx.router, "GET", "/v1/work", None).await).await;
        assert_ne!(unit_id_of(&reissued), unit_id);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn result_submission_accepts_and_updates_status() {
        let fx = fixture();
        let work = response_json(send(&fx.router, "GET", "/v1/work", None).await).await;
        let unit_id = unit_id_of(&work);

        let submitted = send(
            &fx.router,
            "POST",
            "/v1/result",
            Some(json!({
                "unit_id": unit_id,
                "worker_id": "w-1",
                "result": {"citations": [{"efta_number": "EFTA00000300"}]}
            })),
        )
        .await;
        assert_eq!(submitted.status(), StatusCode::OK);
        let value = response_json(submitted).await;
        assert_eq!(value.pointer("/data/accepted"), Some(&Value::Bool(true)), "{value}");
        assert_eq!(value.pointer("/data/next_unit_available"), Some(&Value::Bool(true)));

        let status = response_json(send(&fx.router, "GET", "/v1/status", None).await).await;
        assert_eq!(status.pointer("/data/total_findings_accepted"), Some(&json!(1)));
        assert_eq!(status.pointer("/data/total_completed"), Some(&json!(1)));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_unit_maps_to_not_found() {
        let fx = fixture();
        let submitted = send(
            &fx.router,
            "POST",
            "/v1/result",
            Some(json!({"unit_id": "verify-000000000000", "worker_id": "w-1", "result": {}})),
        )
        .await;
        assert_eq!(submitted.status(), StatusCode::NOT_FOUND);
        let value = response_json(submitted).await;
        assert!(value.get("error").and_then(Value::as_str).is_some());

        let unknown_kind = send(&fx.router, "GET", "/v1/work?kind=summarize", None).await;
        assert_eq!(unknown_kind.status(), StatusCode::BAD_REQUEST);
    }
}
