// Jackson Coxson

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use log::{debug, warn};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::registry::{SharedRegistry, TunnelRegistryEntry};
use super::strongbox::Strongbox;
use crate::RemoteXpcError;

/// Builds the registry's HTTP API
///
/// Routes, all under `/remotexpc/tunnels`:
/// - `GET  /remotexpc/tunnels` → full registry with metadata
/// - `GET  /remotexpc/tunnels/{udid}` → entry or 404
/// - `GET  /remotexpc/tunnels/device/{deviceId}` → first matching entry,
///   400 on a non-integer id
/// - `PUT  /remotexpc/tunnels/{udid}` → upsert; the body UDID must match
///   the path
///
/// Everything else answers 404 `{"error":"Not found"}`.
pub fn registry_router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/remotexpc/tunnels", get(get_all))
        .route(
            "/remotexpc/tunnels/{udid}",
            get(get_by_udid).put(put_tunnel),
        )
        .route("/remotexpc/tunnels/device/{device_id}", get(get_by_device))
        .fallback(not_found)
        .with_state(registry)
}

async fn get_all(State(registry): State<SharedRegistry>) -> Response {
    let registry = registry.read().await;
    Json(json!({
        "tunnels": registry.entries(),
        "metadata": registry.metadata(),
    }))
    .into_response()
}

async fn get_by_udid(
    State(registry): State<SharedRegistry>,
    Path(udid): Path<String>,
) -> Response {
    let registry = registry.read().await;
    match registry.get(&udid) {
        Some(entry) => Json(entry.clone()).into_response(),
        None => not_found().await,
    }
}

async fn get_by_device(
    State(registry): State<SharedRegistry>,
    Path(device_id): Path<String>,
) -> Response {
    let device_id: u32 = match device_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Device ID must be an integer" })),
            )
                .into_response();
        }
    };
    let registry = registry.read().await;
    match registry.find_by_device_id(device_id) {
        Some(entry) => Json(entry.clone()).into_response(),
        None => not_found().await,
    }
}

async fn put_tunnel(
    State(registry): State<SharedRegistry>,
    Path(udid): Path<String>,
    body: Bytes,
) -> Response {
    let entry: TunnelRegistryEntry = match serde_json::from_slice(&body) {
        Ok(entry) => entry,
        Err(e) => {
            warn!("Rejecting malformed tunnel body: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Malformed JSON body" })),
            )
                .into_response();
        }
    };
    if entry.udid != udid {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Body UDID does not match path UDID" })),
        )
            .into_response();
    }

    let stored = registry.write().await.upsert(entry);
    Json(json!({ "success": true, "tunnel": stored })).into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

/// The registry's HTTP server
///
/// Binds an OS-assigned loopback port, publishes it in the strongbox so
/// sibling processes can find it, and tears down cleanly on stop.
pub struct RegistryServer {
    port: u16,
    strongbox: Strongbox,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryServer {
    pub async fn start(registry: SharedRegistry) -> Result<Self, RemoteXpcError> {
        Self::start_with_strongbox(registry, Strongbox::default()).await
    }

    pub async fn start_with_strongbox(
        registry: SharedRegistry,
        strongbox: Strongbox,
    ) -> Result<Self, RemoteXpcError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        strongbox.store_registry_port(port)?;
        debug!("Tunnel registry listening on 127.0.0.1:{port}");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = registry_router(registry);
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                warn!("Registry server exited with error: {e}");
            }
        });

        Ok(Self {
            port,
            strongbox,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// The bound port, also published in the strongbox
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops the server and withdraws the strongbox entry. Safe to call
    /// multiple times.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            if let Err(e) = self
                .strongbox
                .remove(super::strongbox::REGISTRY_PORT_KEY)
            {
                warn!("Failed to withdraw strongbox entry: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelRegistry, TunnelRegistryEntry};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn entry(udid: &str, device_id: u32) -> TunnelRegistryEntry {
        TunnelRegistryEntry {
            udid: udid.to_string(),
            device_id,
            address: "fe80::1".to_string(),
            rsd_port: 58783,
            packet_stream_port: Some(50000),
            connection_type: "USB".to_string(),
            product_id: None,
            created_at: 0,
            last_updated: 0,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put_request(udid: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/remotexpc/tunnels/{udid}"))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let registry = TunnelRegistry::shared();
        let router = registry_router(registry);

        let body = serde_json::to_string(&entry("udid-1", 3)).unwrap();
        let response = router
            .clone()
            .oneshot(put_request("udid-1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        let created_at = json["tunnel"]["createdAt"].as_i64().unwrap();
        assert!(created_at > 0);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/remotexpc/tunnels/udid-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["udid"], "udid-1");
        assert_eq!(json["rsdPort"], 58783);

        // Updating refreshes lastUpdated and keeps createdAt
        let body = serde_json::to_string(&entry("udid-1", 3)).unwrap();
        let response = router
            .clone()
            .oneshot(put_request("udid-1", body))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["tunnel"]["createdAt"].as_i64().unwrap(), created_at);
        assert!(json["tunnel"]["lastUpdated"].as_i64().unwrap() > created_at);
    }

    #[tokio::test]
    async fn full_listing_reports_totals() {
        let registry = TunnelRegistry::shared();
        registry.write().await.upsert(entry("udid-1", 1));
        registry.write().await.upsert(entry("udid-2", 2));
        let router = registry_router(registry);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/remotexpc/tunnels")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["metadata"]["totalTunnels"], 2);
        assert!(json["tunnels"]["udid-1"].is_object());
        assert!(json["tunnels"]["udid-2"].is_object());
    }

    #[tokio::test]
    async fn udid_mismatch_is_rejected() {
        let registry = TunnelRegistry::shared();
        let router = registry_router(registry.clone());

        let body = serde_json::to_string(&entry("udid-other", 1)).unwrap();
        let response = router
            .oneshot(put_request("udid-1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(registry.read().await.metadata().total_tunnels, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let registry = TunnelRegistry::shared();
        let router = registry_router(registry);

        let response = router
            .oneshot(put_request("udid-1", "{not json".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn device_id_lookup() {
        let registry = TunnelRegistry::shared();
        registry.write().await.upsert(entry("udid-1", 42));
        let router = registry_router(registry);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/remotexpc/tunnels/device/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["udid"], "udid-1");

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/remotexpc/tunnels/device/not-a-number")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/remotexpc/tunnels/device/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let registry = TunnelRegistry::shared();
        let router = registry_router(registry);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/remotexpc/something-else")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Not found");
    }

    #[tokio::test]
    async fn server_lifecycle_publishes_port() {
        let strongbox = Strongbox::at(std::env::temp_dir().join(format!(
            "remotexpc-strongbox-server-test-{}.json",
            std::process::id()
        )));
        let registry = TunnelRegistry::shared();
        let mut server = RegistryServer::start_with_strongbox(registry, strongbox.clone())
            .await
            .unwrap();
        assert_eq!(strongbox.read_registry_port(), Some(server.port()));

        server.stop().await;
        server.stop().await; // idempotent
        assert_eq!(strongbox.read_registry_port(), None);
        let _ = std::fs::remove_file(strongbox.path());
    }
}
