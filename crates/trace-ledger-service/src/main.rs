use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use trace_ledger_api::{
    AnnounceShipmentRequest, AppendCteRequest, CancelAnnouncementRequest, CreateTlcRequest,
    FindAnnouncementRequest, ReceiveShipmentRequest, RegisterLocationRequest, TraceLedgerApi,
    API_CONTRACT_VERSION,
};
use trace_ledger_core::{CteId, LedgerError, LocationId, TlcId};
use trace_ledger_store_sqlite::{CteFilter, StoreError};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: TraceLedgerApi,
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

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Domain(LedgerError::Validation(message)) => {
                Self::new(StatusCode::BAD_REQUEST, message.clone())
            }
            StoreError::Domain(LedgerError::NotFound { .. }) => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            StoreError::Domain(LedgerError::Forbidden(message)) => {
                Self::new(StatusCode::FORBIDDEN, message.clone())
            }
            // Integrity details (matched key, candidate ids) go to the log,
            // never to the caller.
            StoreError::Domain(LedgerError::Integrity(_)) => {
                tracing::error!(error = %err, "ledger integrity violation");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal integrity violation")
            }
            StoreError::Busy(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "database busy; retry the request")
            }
            StoreError::Sqlite(_) | StoreError::Internal(_) => {
                tracing::error!(error = %err, "storage failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "trace-ledger-service")]
#[command(about = "Local HTTP service for the traceability event ledger")]
struct Args {
    #[arg(long, default_value = "./trace_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
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

fn parse_id(raw: &str, what: &str) -> Result<Ulid, ServiceError> {
    Ulid::from_str(raw).map_err(|err| ServiceError::bad_request(format!("invalid {what}: {err}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/locations", post(location_register))
        .route("/v1/locations/:location_id", get(location_show))
        .route("/v1/tlc", post(tlc_create))
        .route("/v1/tlc/:tlc_id", get(tlc_show))
        .route("/v1/cte", post(cte_append))
        .route("/v1/cte/list", post(cte_list))
        .route("/v1/cte/:cte_id", get(cte_show))
        .route("/v1/lineage/:tlc_id", get(lineage_show))
        .route("/v1/shipments/announce", post(shipment_announce))
        .route("/v1/shipments/find", post(shipment_find))
        .route("/v1/shipments/receive", post(shipment_receive))
        .route("/v1/shipments/cancel", post(shipment_cancel))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let state = ServiceState { api: TraceLedgerApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "trace-ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<trace_ledger_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_api::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<trace_ledger_store_sqlite::IntegrityReport>>, ServiceError> {
    let report = state.api.integrity_check()?;
    Ok(Json(envelope(report)))
}

async fn location_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterLocationRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::Location>>, ServiceError> {
    let location = state.api.register_location(request)?;
    Ok(Json(envelope(location)))
}

async fn location_show(
    State(state): State<ServiceState>,
    Path(location_id): Path<String>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::Location>>, ServiceError> {
    let location_id = LocationId(parse_id(&location_id, "location id")?);
    let location = state.api.get_location(location_id)?;
    Ok(Json(envelope(location)))
}

async fn tlc_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateTlcRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::TraceabilityLotCode>>, ServiceError> {
    let tlc = state.api.create_tlc(request)?;
    Ok(Json(envelope(tlc)))
}

async fn tlc_show(
    State(state): State<ServiceState>,
    Path(tlc_id): Path<String>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::TraceabilityLotCode>>, ServiceError> {
    let tlc_id = TlcId(parse_id(&tlc_id, "trace lot code id")?);
    let tlc = state.api.get_tlc(tlc_id)?;
    Ok(Json(envelope(tlc)))
}

async fn cte_append(
    State(state): State<ServiceState>,
    Json(request): Json<AppendCteRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::CteRecord>>, ServiceError> {
    let record = state.api.append_cte(request)?;
    Ok(Json(envelope(record)))
}

async fn cte_show(
    State(state): State<ServiceState>,
    Path(cte_id): Path<String>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::CteRecord>>, ServiceError> {
    let cte_id = CteId(parse_id(&cte_id, "event id")?);
    let record = state.api.get_cte(cte_id)?;
    Ok(Json(envelope(record)))
}

async fn cte_list(
    State(state): State<ServiceState>,
    Json(filter): Json<CteFilter>,
) -> Result<Json<ServiceEnvelope<Vec<trace_ledger_core::CteRecord>>>, ServiceError> {
    let records = state.api.list_ctes(&filter)?;
    Ok(Json(envelope(records)))
}

async fn lineage_show(
    State(state): State<ServiceState>,
    Path(tlc_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<trace_ledger_core::CteRecord>>>, ServiceError> {
    let tlc_id = TlcId(parse_id(&tlc_id, "trace lot code id")?);
    let records = state.api.trace_lineage(tlc_id)?;
    Ok(Json(envelope(records)))
}

async fn shipment_announce(
    State(state): State<ServiceState>,
    Json(request): Json<AnnounceShipmentRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::ShipmentAnnouncement>>, ServiceError> {
    let announcement = state.api.announce_shipment(request)?;
    Ok(Json(envelope(announcement)))
}

async fn shipment_find(
    State(state): State<ServiceState>,
    Json(request): Json<FindAnnouncementRequest>,
) -> Result<Json<ServiceEnvelope<Option<trace_ledger_core::ShipmentAnnouncement>>>, ServiceError> {
    let announcement = state.api.find_announcement(&request)?;
    Ok(Json(envelope(announcement)))
}

async fn shipment_receive(
    State(state): State<ServiceState>,
    Json(request): Json<ReceiveShipmentRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::ReceiveOutcome>>, ServiceError> {
    let outcome = state.api.receive_shipment(request)?;
    Ok(Json(envelope(outcome)))
}

async fn shipment_cancel(
    State(state): State<ServiceState>,
    Json(request): Json<CancelAnnouncementRequest>,
) -> Result<Json<ServiceEnvelope<trace_ledger_core::ShipmentAnnouncement>>, ServiceError> {
    let announcement = state.api.cancel_announcement(request)?;
    Ok(Json(envelope(announcement)))
}
