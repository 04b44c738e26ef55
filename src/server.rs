//! Thin HTTP front end: `POST /expand` in, JSON out.

use crate::validator::{ExpandError, ValidationResult, Validator};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ExpandRequest {
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ExpandError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.user_message().to_string(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(validator: Arc<Validator>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/expand", post(expand))
        .with_state(validator)
}

async fn health() -> &'static str {
    "Shortened URL Validator is running!"
}

async fn expand(
    State(validator): State<Arc<Validator>>,
    payload: Result<Json<ExpandRequest>, JsonRejection>,
) -> Result<Json<ValidationResult>, ExpandError> {
    let url = match payload {
        Ok(Json(request)) => request.url,
        Err(rejection) => {
            log::debug!("Rejected /expand body: {rejection}");
            None
        }
    };

    // A panic inside validation must not take the connection down with it.
    let task = tokio::spawn(async move { validator.expand(url.as_deref()).await });
    match task.await {
        Ok(result) => result.map(Json),
        Err(e) => {
            log::error!("Validation task failed: {e}");
            Err(ExpandError::Internal(e.to_string()))
        }
    }
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(validator: Arc<Validator>, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(validator))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
