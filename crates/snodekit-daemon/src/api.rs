use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use snodekit_net::{NetworkStatus, SnodeNetwork};

#[derive(Clone)]
pub struct AppState {
    pub network: Arc<SnodeNetwork>,
    pub account_id: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    account_id: String,
    #[serde(flatten)]
    network: NetworkStatus,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        account_id: state.account_id.clone(),
        network: state.network.status(),
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting status API");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::LoggingHooks;
    use snodekit_net::{HttpLink, IdentityAuth, NetworkConfig, PollerHooks};
    use snodekit_shared::Identity;
    use snodekit_store::MemoryStore;

    fn state() -> AppState {
        let identity = Identity::generate();
        let account_id = identity.account_id();
        let hooks = Arc::new(LoggingHooks::new(Vec::new(), Vec::new()));
        let network = SnodeNetwork::new(
            NetworkConfig::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(HttpLink::new(false).unwrap()),
            account_id.clone(),
            PollerHooks {
                membership: hooks.clone(),
                configs: hooks.clone(),
                pipeline: hooks,
                auth: Arc::new(IdentityAuth::new(identity)),
            },
        );
        AppState {
            network: Arc::new(network),
            account_id,
        }
    }

    #[tokio::test]
    async fn test_health_reports_version() {
        let Json(health) = health_check().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_status_before_bootstrap() {
        let state = state();
        let account_id = state.account_id.clone();
        let Json(response) = status(State(state)).await;

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["account_id"], account_id);
        assert_eq!(body["pool_size"], 0);
        assert_eq!(body["polling"], false);
        assert!(body["paths"].as_array().unwrap().is_empty());
    }
}
