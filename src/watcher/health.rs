//! Health/status endpoint for the watcher

use super::propagator::Propagator;
use crate::common::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Router};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HealthState {
    pub propagator: Arc<Propagator>,
}

pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/status", axum::routing::get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Propagator state, watched keys and installed entries.
async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    let entries: BTreeMap<String, String> = match state.propagator.table().entries() {
        Ok(entries) => entries
            .into_iter()
            .map(|(addr, host)| (addr.to_string(), host.to_string()))
            .collect(),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": e.to_string() })),
            );
        }
    };

    (
        StatusCode::OK,
        axum::Json(json!({
            "state": state.propagator.state(),
            "watched": state.propagator.watched(),
            "entries": entries,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// Serve until `cancel` fires.
pub async fn serve(addr: SocketAddr, state: HealthState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoint listening on {}", addr);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventory;
    use crate::ipam::KeyLayout;
    use crate::store::MemoryStore;
    use crate::watcher::MemoryFastPath;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_health_and_status() {
        let propagator = Arc::new(Propagator::new(
            Arc::new(MemoryStore::new()),
            KeyLayout::new("test/ipam", Ipv4Addr::new(10, 244, 0, 0), 16),
            "node-a",
            Arc::new(StaticInventory::default()),
            Arc::new(MemoryFastPath::new()),
        ));
        propagator
            .table()
            .put(Ipv4Addr::new(10, 244, 5, 10), Ipv4Addr::new(192, 168, 1, 12))
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let cancel = cancel.clone();
            let router = create_router(HealthState { propagator });
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
            }
        });

        let base = format!("http://{}", addr);
        let body = reqwest::get(format!("{}/health", base)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");

        let status: serde_json::Value = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["state"], "idle");
        assert_eq!(status["entries"]["10.244.5.10"], "192.168.1.12");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
