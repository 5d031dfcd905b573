//! REST surface over the contract registry.
//!
//! - `POST /contracts` `{address, network, abi}`: `200 OK`, or `400 {"error": [fields]}`
//! - `GET /contracts`: registered contracts in insertion order
//! - `DELETE /contracts/:address`: `200 OK`, or `404 {"error": ["address"]}`
//! - `GET /health`

use crate::error::Error;
use crate::registry::{ContractRegistry, ContractSpec};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ContractRegistry>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: Vec<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) | Error::Duplicate(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = self.fields().unwrap_or_else(|| vec![self.to_string()]);
        (status, Json(ErrorResponse { error })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/contracts", post(add_contract).get(list_contracts))
        .route("/contracts/:address", delete(remove_contract))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    address: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!(address = %listener.local_addr()?, "REST API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// A body that is not JSON is treated like an empty object, so every field is reported.
async fn add_contract(State(state): State<AppState>, body: Bytes) -> Result<&'static str, Error> {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match state.registry.add(&body).await {
        Ok(_) => Ok("OK"),
        Err(e) => {
            tracing::warn!(reason = %e, "contract registration rejected");
            Err(e)
        }
    }
}

async fn list_contracts(State(state): State<AppState>) -> Json<Vec<ContractSpec>> {
    Json(state.registry.list().await)
}

async fn remove_contract(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<&'static str, Error> {
    state.registry.remove(&address).await?;
    Ok("OK")
}
