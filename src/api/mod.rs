pub mod error;
mod handlers;
pub mod ws;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::broker::BrokerHandle;
use crate::shell::ShellSession;
use crate::shutdown::ShutdownCoordinator;
use crate::workspace::Workspace;

use handlers::*;

/// Upper bound on request bodies. File content travels over the WebSocket,
/// so HTTP requests stay small.
const BODY_LIMIT: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub workspace: Arc<Workspace>,
    pub shell: ShellSession,
    pub shutdown: ShutdownCoordinator,
    /// Counter for open WebSocket connections.
    pub ws_count: Arc<AtomicUsize>,
    pub max_connections: usize,
}

/// Configuration for the HTTP/WS router.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Allowed CORS origins. Empty disables CORS, `"*"` allows any origin.
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws::ws))
        .route("/files", get(files))
        .route("/files/content", get(file_content))
        .route("/session", get(session_status))
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http());

    if config.cors_origins.is_empty() {
        return router;
    }
    let allow_origin = if config.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };
    router.layer(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::OPTIONS]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerSettings};
    use crate::shell::ShellState;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use bytes::Bytes;
    use tokio::sync::{mpsc, watch};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt; // for oneshot()

    struct TestState {
        state: AppState,
        _dir: tempfile::TempDir,
        _input_rx: mpsc::Receiver<Bytes>,
    }

    fn create_test_state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::open(dir.path()).unwrap());
        let (input_tx, input_rx) = mpsc::channel(64);
        let shell_state = Arc::new(watch::channel(ShellState::Running).0);
        let shell = ShellSession::from_parts(input_tx, shell_state);
        let (broker, _task) = Broker::spawn(
            workspace.clone(),
            shell.clone(),
            BrokerSettings::default(),
            CancellationToken::new(),
        );
        TestState {
            state: AppState {
                broker,
                workspace,
                shell,
                shutdown: ShutdownCoordinator::new(),
                ws_count: Arc::new(AtomicUsize::new(0)),
                max_connections: 64,
            },
            _dir: dir,
            _input_rx: input_rx,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let t = create_test_state();
        let (status, json) = get_json(router(t.state, RouterConfig::default()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_root_banner() {
        let t = create_test_state();
        let (status, json) = get_json(router(t.state, RouterConfig::default()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["service"], "sandshell");
    }

    #[tokio::test]
    async fn test_files_returns_tree() {
        let t = create_test_state();
        let root = t.state.workspace.root().to_path_buf();
        std::fs::create_dir(root.join("a")).unwrap();
        std::fs::write(root.join("a").join("b.txt"), "").unwrap();
        std::fs::write(root.join("c.txt"), "").unwrap();

        let (status, json) = get_json(router(t.state.clone(), RouterConfig::default()), "/files").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({ "tree": { "a": { "b.txt": null }, "c.txt": null } })
        );
    }

    #[tokio::test]
    async fn test_file_content() {
        let t = create_test_state();
        std::fs::write(t.state.workspace.root().join("hello.txt"), "hi there").unwrap();

        let (status, json) = get_json(
            router(t.state.clone(), RouterConfig::default()),
            "/files/content?path=/hello.txt",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["content"], "hi there");
    }

    #[tokio::test]
    async fn test_file_content_traversal_is_forbidden() {
        let t = create_test_state();
        let (status, json) = get_json(
            router(t.state, RouterConfig::default()),
            "/files/content?path=../../etc/passwd",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "path_escape");
    }

    #[tokio::test]
    async fn test_file_content_missing_file() {
        let t = create_test_state();
        let (status, json) = get_json(
            router(t.state, RouterConfig::default()),
            "/files/content?path=nope.txt",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_file_content_requires_path() {
        let t = create_test_state();
        let (status, json) =
            get_json(router(t.state, RouterConfig::default()), "/files/content").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_session_status() {
        let t = create_test_state();
        let (status, json) = get_json(router(t.state, RouterConfig::default()), "/session").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "running");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_security_headers() {
        let t = create_test_state();
        let response = router(t.state, RouterConfig::default())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("referrer-policy").unwrap(), "no-referrer");
    }

    #[tokio::test]
    async fn test_cors_wildcard() {
        let t = create_test_state();
        let config = RouterConfig {
            cors_origins: vec!["*".into()],
        };
        let response = router(t.state, config)
            .oneshot(
                Request::builder()
                    .uri("/files")
                    .header("origin", "http://editor.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_disabled_by_default() {
        let t = create_test_state();
        let response = router(t.state, RouterConfig::default())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://editor.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let t = create_test_state();
        let response = router(t.state, RouterConfig::default())
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
