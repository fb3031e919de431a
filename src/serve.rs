use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Number};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::{
    admin::AdminService,
    oracle::{BalanceOracle, OracleError},
    store::{AddOutcome, StoreError, SubscriberId},
};

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
    pub oracle: Arc<BalanceOracle>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any);

    Router::new()
        .route("/healthz", get(health))
        .route(
            "/api/subscribers/:id/addresses",
            get(list_addresses).post(add_address),
        )
        .route(
            "/api/subscribers/:id/addresses/:address",
            delete(remove_address),
        )
        .route(
            "/api/subscribers/:id/threshold",
            get(get_threshold).put(set_threshold),
        )
        .route("/api/addresses/:address/balances", get(address_balances))
        .route("/api/sweep", post(trigger_sweep))
        .with_state(state)
        .layer(cors)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidAddress(_) | StoreError::InvalidThreshold(_) => {
                ApiError::BadRequest(err.to_string())
            }
            StoreError::Persistence(_) => internal_error(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

pub fn internal_error<E>(err: E) -> ApiError
where
    E: std::error::Error,
{
    error!(%err, "request failed");
    ApiError::Internal(err.to_string())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let monitor = state.admin.monitor();
    Json(json!({
        "monitor": monitor.state().await,
        "last_sweep": monitor.last_sweep().await,
    }))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    balances: bool,
}

async fn list_addresses(
    State(state): State<AppState>,
    Path(id): Path<SubscriberId>,
    Query(params): Query<ListParams>,
) -> Response {
    if params.balances {
        Json(state.admin.list_addresses_with_balances(id).await).into_response()
    } else {
        Json(json!({ "addresses": state.admin.list_addresses(id).await })).into_response()
    }
}

#[derive(Deserialize)]
struct AddAddressBody {
    address: String,
}

async fn add_address(
    State(state): State<AppState>,
    Path(id): Path<SubscriberId>,
    Json(body): Json<AddAddressBody>,
) -> Result<Response, ApiError> {
    let added = state.admin.add_address(id, &body.address).await?;
    let status = match added.outcome {
        AddOutcome::Added => StatusCode::CREATED,
        AddOutcome::AlreadyPresent => StatusCode::OK,
    };
    Ok((status, Json(added)).into_response())
}

async fn remove_address(
    State(state): State<AppState>,
    Path((id, address)): Path<(SubscriberId, String)>,
) -> Result<StatusCode, ApiError> {
    if state.admin.remove_address(id, &address).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "address {} is not monitored",
            address
        )))
    }
}

async fn get_threshold(
    State(state): State<AppState>,
    Path(id): Path<SubscriberId>,
) -> impl IntoResponse {
    let threshold = state.admin.get_threshold(id).await;
    Json(json!({ "threshold": threshold.to_string() }))
}

// Accepts both `"0.1"` and `0.1`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdValue {
    Text(String),
    Number(Number),
}

#[derive(Deserialize)]
struct ThresholdBody {
    threshold: ThresholdValue,
}

async fn set_threshold(
    State(state): State<AppState>,
    Path(id): Path<SubscriberId>,
    Json(body): Json<ThresholdBody>,
) -> Result<impl IntoResponse, ApiError> {
    let value = match body.threshold {
        ThresholdValue::Text(text) => text,
        ThresholdValue::Number(number) => number.to_string(),
    };
    let threshold = state.admin.set_threshold(id, &value).await?;
    Ok(Json(json!({ "threshold": threshold.to_string() })))
}

async fn address_balances(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // shares the sources' rate budget with the sweeps
    let balances = state
        .admin
        .monitor()
        .with_sweep_lock(state.oracle.fetch_all_balances(&address))
        .await
        .map_err(|err| match err {
            OracleError::InvalidAddress(_) => ApiError::BadRequest(err.to_string()),
            OracleError::AllSourcesExhausted(_) => internal_error(err),
        })?;

    let assets = balances
        .assets
        .into_iter()
        .map(|asset| match asset.balance {
            Ok(balance) => json!({ "symbol": asset.symbol, "balance": balance }),
            Err(err) => json!({ "symbol": asset.symbol, "error": err.to_string() }),
        })
        .collect::<Vec<_>>();

    Ok(Json(json!({ "address": balances.address, "balances": assets })))
}

async fn trigger_sweep(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.admin.trigger_immediate_sweep().await)
}
