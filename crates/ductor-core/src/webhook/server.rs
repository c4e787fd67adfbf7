//! Webhook HTTP server: axum-based ingress for external triggers.
//!
//! Routes:
//! - `GET  /health`          -- health check for tunnel/proxy monitoring.
//! - `POST /hooks/{hook_id}` -- catch-all webhook endpoint.

use std::sync::{Arc, Mutex};

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::webhook::auth::{validate_hook_auth, RateLimiter};
use crate::webhook::models::WebhookResult;
use crate::webhook::WebhookManager;

/// Callback invoked for each accepted request: `(hook_id, payload)`.
pub type DispatchCallback =
    Arc<dyn Fn(String, Map<String, Value>) -> BoxFuture<'static, WebhookResult> + Send + Sync>;

struct ServerState {
    config: WebhookConfig,
    manager: Arc<Mutex<WebhookManager>>,
    rate_limiter: Mutex<RateLimiter>,
    dispatch: Mutex<Option<DispatchCallback>>,
}

/// HTTP server accepting webhook payloads and dispatching them.
pub struct WebhookServer {
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookServer {
    pub fn new(config: WebhookConfig, manager: Arc<Mutex<WebhookManager>>) -> Self {
        let rate_limit = config.rate_limit_per_minute;
        Self {
            state: Arc::new(ServerState {
                config,
                manager,
                rate_limiter: Mutex::new(RateLimiter::new(rate_limit)),
                dispatch: Mutex::new(None),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Set the callback invoked for each valid webhook request.
    pub fn set_dispatch_handler(&self, handler: DispatchCallback) {
        *self.state.dispatch.lock().expect("dispatch lock") = Some(handler);
    }

    /// Bind the listener and start serving.
    pub async fn start(&self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/hooks/{hook_id}", post(handle_hook))
            .layer(DefaultBodyLimit::max(self.state.config.max_body_bytes))
            .with_state(Arc::clone(&self.state));

        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Webhook server listening");

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                warn!(%err, "Webhook server exited with error");
            }
        });
        *self.task.lock().expect("task lock") = Some(handle);
        Ok(())
    }

    /// Shut down the server.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().expect("task lock").take() {
            let _ = task.await;
        }
        info!("Webhook server stopped");
    }
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// The dispatch pipeline, in strict order: rate limit, content type, body,
/// JSON shape, hook lookup, auth, fire-and-forget.
async fn handle_hook(
    State(state): State<Arc<ServerState>>,
    Path(hook_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    info!(hook = %hook_id, "Webhook request received");

    // 1. Rate limit
    if !state.rate_limiter.lock().expect("limiter lock").check() {
        warn!(hook = %hook_id, "Webhook rejected: rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate_limited"})),
        );
    }

    // 2. Content-Type
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        warn!(hook = %hook_id, "Webhook rejected: bad content-type");
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(json!({"error": "content_type_must_be_json"})),
        );
    }

    // 3.+4. Raw body (bounded by the body-limit layer), parsed as JSON
    let payload: Map<String, Value> = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(hook = %hook_id, "Webhook rejected: body not object");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "body_must_be_object"})),
            );
        }
        Err(_) => {
            warn!(hook = %hook_id, "Webhook rejected: invalid JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_json"})),
            );
        }
    };

    // 5. Hook lookup
    let hook = state
        .manager
        .lock()
        .expect("manager lock")
        .get_hook(&hook_id);
    let Some(hook) = hook else {
        warn!(hook = %hook_id, "Webhook rejected: not found");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "hook_not_found"})),
        );
    };
    if !hook.enabled {
        warn!(hook = %hook_id, "Webhook rejected: disabled");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "hook_disabled"})),
        );
    }

    // 6. Per-hook auth (bearer token or HMAC signature)
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let signature = if hook.hmac_header.is_empty() {
        ""
    } else {
        headers
            .get(hook.hmac_header.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    };
    if !validate_hook_auth(&hook, authorization, signature, &body, &state.config.token) {
        warn!(hook = %hook_id, "Webhook rejected: unauthorized");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        );
    }

    debug!(hook = %hook_id, "Webhook validation passed");

    // 7. Fire-and-forget so slow agent work cannot time out the HTTP call.
    let dispatch = state.dispatch.lock().expect("dispatch lock").clone();
    if let Some(dispatch) = dispatch {
        let id = hook_id.clone();
        tokio::spawn(async move {
            let result = dispatch(id.clone(), payload).await;
            debug!(hook = %id, status = %result.status, "Webhook dispatch finished");
        });
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "hook_id": hook_id})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::models::WebhookEntry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(hooks: Vec<WebhookEntry>, token: &str) -> Arc<ServerState> {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = WebhookManager::new(dir.path().join("webhooks.json"));
        for hook in hooks {
            manager.add_hook(hook).unwrap();
        }
        Arc::new(ServerState {
            config: WebhookConfig {
                enabled: true,
                token: token.into(),
                ..Default::default()
            },
            manager: Arc::new(Mutex::new(manager)),
            rate_limiter: Mutex::new(RateLimiter::new(30)),
            dispatch: Mutex::new(None),
        })
    }

    fn router(state: Arc<ServerState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/hooks/{hook_id}", post(handle_hook))
            .with_state(state)
    }

    fn post_request(uri: &str, body: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn wake_hook(id: &str) -> WebhookEntry {
        WebhookEntry {
            id: id.into(),
            title: "Test".into(),
            prompt_template: "Do {{msg}}".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(test_state(vec![], "tok"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_codes_in_order() {
        let mut disabled = wake_hook("off");
        disabled.enabled = false;
        let state = test_state(vec![wake_hook("h1"), disabled], "tok");

        // 415: wrong content type.
        let app = router(Arc::clone(&state));
        let request = Request::post("/hooks/h1")
            .header("content-type", "text/plain")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(
            app.oneshot(request).await.unwrap().status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );

        // 400: invalid JSON, then non-object body.
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/h1", "{not json", Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/h1", "[1,2]", Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // 404: unknown hook.
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/none", "{}", Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // 403: disabled hook.
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/off", "{}", Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // 401: missing/wrong credentials.
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/h1", "{}", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // 202: accepted.
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/h1", r#"{"msg":"build"}"#, Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_rate_limit_429() {
        let state = test_state(vec![wake_hook("h1")], "tok");
        *state.rate_limiter.lock().unwrap() = RateLimiter::new(1);

        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(post_request("/hooks/h1", "{}", Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let app = router(state);
        let response = app
            .oneshot(post_request("/hooks/h1", "{}", Some("tok")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
