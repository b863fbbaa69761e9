//! chronai-gateway: REST API over the task store and scheduler.
//!
//! Thin plumbing: validation, credential encryption, and persistence happen
//! here, then the scheduler is notified. A task create/update succeeds as
//! soon as the store write does; scheduler registration is non-fatal and
//! re-runs from the store at the next startup.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use tracing::info;

use chronai_scheduler::Scheduler;
use chronai_security::CredentialCipher;
use chronai_store::TaskStore;

/// Shared gateway state.
pub struct GatewayState {
    pub store: TaskStore,
    pub scheduler: Arc<Scheduler>,
    pub cipher: Arc<CredentialCipher>,
    pub auth_token: Option<String>,
}

/// Build the gateway router. `/health` is open; everything under `/api`
/// requires the bearer token when one is configured.
pub fn router(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route(
            "/api/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/api/tasks/{id}",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/api/tasks/{id}/logs", get(handlers::list_logs))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .with_state(state)
}

/// Start the gateway server. Runs until `shutdown` resolves.
pub async fn start_gateway(
    state: Arc<GatewayState>,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {addr}");
    info!("  API:    http://{addr}/api/tasks");
    info!("  Health: http://{addr}/health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Check the configured bearer token against request headers.
pub(crate) fn authorize(
    auth_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<(), StatusCode> {
    let Some(expected) = auth_token else {
        return Ok(());
    };
    match extract_bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => {
            tracing::warn!("API authentication failed");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
