// src/secrets/agent.rs

//! HTTP delivery endpoint for the guest agent (feature `agent`)
//!
//! Exposes the delivery state machine over `POST /secrets` with JSON
//! bodies of the form `{"secrets": {name: value}}`. Responses:
//!
//! - `204 No Content` — accepted, required set complete, targets sealed
//! - `202 Accepted`   — accepted, required set still incomplete
//! - `400 Bad Request` — schema violation (generic body, names logged)
//! - `409 Conflict`   — already sealed
//! - `422 Unprocessable Entity` — unknown keys while `reject_unknown`
//!
//! Error bodies carry a generic message only; secret values never appear
//! in responses or logs.

use crate::error::{Error, Result};
use crate::secrets::{DeliveryEngine, DeliveryOutcome};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Default bind address of the delivery endpoint.
pub const DEFAULT_BIND: &str = "0.0.0.0:8081";

#[derive(Debug, Deserialize)]
struct DeliveryBody {
    secrets: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

type SharedEngine = Arc<Mutex<DeliveryEngine>>;

/// Build the delivery router around a shared engine.
pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/secrets", post(handle_delivery))
        .with_state(engine)
}

async fn handle_delivery(
    State(engine): State<SharedEngine>,
    Json(body): Json<DeliveryBody>,
) -> Response {
    let outcome = {
        let mut guard = match engine.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("delivery engine mutex poisoned");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "delivery unavailable",
                    }),
                )
                    .into_response();
            }
        };
        guard.deliver(&body.secrets)
    };

    match outcome {
        Ok(DeliveryOutcome::Complete) => StatusCode::NO_CONTENT.into_response(),
        Ok(DeliveryOutcome::Partial { .. }) => StatusCode::ACCEPTED.into_response(),
        Ok(DeliveryOutcome::SchemaViolation { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "schema validation failed",
            }),
        )
            .into_response(),
        Ok(DeliveryOutcome::UnknownKeys { .. }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: "unknown secrets",
            }),
        )
            .into_response(),
        Ok(DeliveryOutcome::Sealed) => (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: "delivery sealed",
            }),
        )
            .into_response(),
        Err(e) => {
            error!(code = e.code(), "delivery failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "delivery failed",
                }),
            )
                .into_response()
        }
    }
}

/// Serve the delivery endpoint until the process exits. Intended to run
/// as the guest agent behind `runtime-init`.
pub async fn serve(engine: SharedEngine, bind: Option<SocketAddr>) -> Result<()> {
    let addr = match bind {
        Some(addr) => addr,
        None => DEFAULT_BIND
            .parse()
            .map_err(|e| Error::validation(format!("Invalid bind address: {e}")))?,
    };
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "secret delivery endpoint listening");
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| Error::backend(format!("Delivery endpoint failed: {e}")).with_operation("serve"))
}
