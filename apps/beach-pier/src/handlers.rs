use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::hub::RelayHub;
use crate::websocket::websocket_handler;

pub struct AppState {
    pub hub: RelayHub,
    /// Absent when no recorder was installed, in which case `/metrics` is 404.
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/pairing/:code", get(pairing_lookup))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.status())
}

pub async fn pairing_lookup(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match state.hub.pairing_lookup(&code) {
        Some(lookup) => Json(lookup).into_response(),
        None => {
            debug!(%code, "pairing code lookup missed");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "pairing code not found" })),
            )
                .into_response()
        }
    }
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::protocol::{ConnectionId, Envelope};
    use crate::registry::PairingMode;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::Value;
    use tower::util::ServiceExt;

    fn app(mode: PairingMode, metrics: Option<PrometheusHandle>) -> (RelayHub, Router) {
        let hub = RelayHub::new(HubConfig {
            mode,
            ..HubConfig::default()
        });
        let router = build_router(Arc::new(AppState {
            hub: hub.clone(),
            metrics,
        }));
        (hub, router)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_ok() {
        let (_, router) = app(PairingMode::AutoDiscovery, None);
        let (status, body) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_reflects_registry() {
        let (hub, router) = app(PairingMode::CodePairing, None);
        let (controller, _rx) = hub.connect();
        hub.handle_envelope(
            controller,
            Envelope::new("register", json!({ "role": "controller" })),
        );

        let (status, body) = get_json(router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "paired");
        assert_eq!(body["controllers"], 1);
        assert_eq!(body["agents"], 0);
        assert_eq!(body["pairing_codes"], 1);
        assert_eq!(body["connections"], 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn pairing_lookup_finds_live_codes_only() {
        let (hub, router) = app(PairingMode::CodePairing, None);
        let (controller, mut rx) = hub.connect();
        hub.handle_envelope(
            controller,
            Envelope::new(
                "register",
                json!({ "role": "controller", "info": { "name": "ops-desk" } }),
            ),
        );
        let ack = rx.try_recv().unwrap();
        let code = ack.data["code"].as_str().unwrap().to_string();

        let (status, body) = get_json(router.clone(), &format!("/pairing/{code}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], code.as_str());
        assert_eq!(body["controller_id"], controller.to_string());
        assert_eq!(body["agents"], 0);
        assert_eq!(body["controller_info"]["name"], "ops-desk");
        assert!(body["controller_registered_at"].is_string());

        hub.disconnect(controller);
        let (status, _) = get_json(router.clone(), &format!("/pairing/{code}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(router, "/pairing/not-a-code").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_endpoint_requires_recorder() {
        let (_, router) = app(PairingMode::AutoDiscovery, None);
        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let (_, router) = app(PairingMode::AutoDiscovery, Some(handle));
        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_endpoint_renders_relay_activity() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let (hub, router) = app(PairingMode::AutoDiscovery, Some(recorder.handle()));

        metrics::with_local_recorder(&recorder, || {
            let (controller, _controller_rx) = hub.connect();
            hub.handle_envelope(
                controller,
                Envelope::new("register", json!({ "role": "controller" })),
            );
            let (agent, _agent_rx) = hub.connect();
            hub.handle_envelope(agent, Envelope::new("register", json!({ "role": "agent" })));
            hub.handle_envelope(
                controller,
                Envelope::new(
                    "mouse-click",
                    json!({ "agentId": ConnectionId::generate().to_string() }),
                ),
            );
        });

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let rendered = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(rendered.contains("beach_pier_connections_total 2"), "{rendered}");
        assert!(
            rendered.contains(r#"beach_pier_messages_dropped_total{reason="unknown_destination"} 1"#),
            "{rendered}"
        );
        assert!(rendered.contains("beach_pier_agents_active"), "{rendered}");
        assert!(rendered.contains("beach_pier_controllers_active"), "{rendered}");
    }
}
