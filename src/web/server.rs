//! Axum HTTP server for the practice API.
//!
//! Builds the router (public and bearer-protected routes), shared state,
//! request throttling, and the serve loop with graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    handler::Handler,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, patch, post},
};
use tokio::sync::{RwLock, oneshot};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::{BillingConfig, Config, UploadConfig};
use crate::db::Database;
use crate::email::Mailer;
use crate::error::ServerError;
use crate::legal::audit::AuditLog;
use crate::legal::uploads::UploadStore;
use crate::web::auth::{TokenSigner, auth_middleware};
use crate::web::handlers::{
    auth as auth_api, case_files, dashboard, documents, invoices, matters, notices,
    notifications, tasks, users,
};
use crate::web::types::HealthResponse;

/// Default cap for JSON request bodies.
const JSON_BODY_LIMIT: usize = 1024 * 1024;

/// Room for multipart boundaries and the small text fields sent with a file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Once the keyed limiter tracks this many keys, expired windows are pruned.
const KEYED_PRUNE_THRESHOLD: usize = 4096;

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fixed-window request limiter shared by every caller.
pub struct RateLimiter {
    /// Requests remaining in the current window.
    remaining: AtomicU64,
    /// Epoch second when the current window started.
    window_start: AtomicU64,
    max_requests: u64,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            remaining: AtomicU64::new(max_requests),
            window_start: AtomicU64::new(epoch_secs()),
            max_requests,
            window_secs,
        }
    }

    /// Try to consume one request. Returns `false` when the window is spent.
    pub fn check(&self) -> bool {
        self.check_at(epoch_secs())
    }

    fn check_at(&self, now: u64) -> bool {
        let window = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(window) >= self.window_secs
            && self
                .window_start
                .compare_exchange(window, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.remaining
                .store(self.max_requests.saturating_sub(1), Ordering::Relaxed);
            return self.max_requests > 0;
        }

        loop {
            let current = self.remaining.load(Ordering::Relaxed);
            if current == 0 {
                return false;
            }
            if self
                .remaining
                .compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyWindow {
    started: u64,
    used: u64,
}

/// Fixed-window limiter with one window per key, e.g. per login email.
pub struct KeyedRateLimiter {
    windows: Mutex<HashMap<String, KeyWindow>>,
    max_requests: u64,
    window_secs: u64,
}

impl KeyedRateLimiter {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window_secs,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, epoch_secs())
    }

    /// Forget a key, e.g. after a successful login.
    pub fn reset(&self, key: &str) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(key);
        }
    }

    fn check_at(&self, key: &str, now: u64) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            // A poisoned map only loses throttling state; let the request through.
            return true;
        };
        if windows.len() >= KEYED_PRUNE_THRESHOLD {
            let window_secs = self.window_secs;
            windows.retain(|_, w| now.saturating_sub(w.started) < window_secs);
        }
        let window = windows.entry(key.to_string()).or_insert(KeyWindow {
            started: now,
            used: 0,
        });
        if now.saturating_sub(window.started) >= self.window_secs {
            *window = KeyWindow {
                started: now,
                used: 0,
            };
        }
        if window.used >= self.max_requests {
            return false;
        }
        window.used += 1;
        true
    }
}

/// Shared state for all API handlers.
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub tokens: TokenSigner,
    pub uploads: UploadStore,
    pub upload_limits: UploadConfig,
    pub billing: BillingConfig,
    pub cors_origins: Vec<String>,
    pub mailer: Arc<Mailer>,
    /// Security audit trail for authentication and role changes.
    pub audit: AuditLog,
    /// Per-email login throttle.
    pub login_limiter: KeyedRateLimiter,
    /// Throttle for all authenticated routes.
    pub api_limiter: RateLimiter,
    /// Shutdown signal sender.
    pub shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
    /// Server startup time for uptime calculation.
    pub startup_time: Instant,
}

impl AppState {
    pub fn new(
        config: &Config,
        db: Arc<dyn Database>,
        mailer: Arc<Mailer>,
        audit: AuditLog,
    ) -> Self {
        Self {
            db,
            tokens: TokenSigner::new(config.auth.jwt_secret.clone(), config.auth.token_ttl_hours),
            uploads: UploadStore::new(config.uploads.dir.clone()),
            upload_limits: config.uploads.clone(),
            billing: config.billing.clone(),
            cors_origins: config.server.cors_origins.clone(),
            mailer,
            audit,
            login_limiter: KeyedRateLimiter::new(
                config.auth.login_max_attempts,
                config.auth.login_window_secs,
            ),
            api_limiter: RateLimiter::new(
                config.auth.api_max_requests,
                config.auth.api_window_secs,
            ),
            shutdown_tx: RwLock::new(None),
            startup_time: Instant::now(),
        }
    }

    /// Ask a running server to stop accepting connections.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Assemble the full router. Exposed separately from `start_server` so
/// tests can drive it without a socket.
pub fn router(state: Arc<AppState>) -> Router {
    let document_limit = state.upload_limits.max_document_bytes + MULTIPART_OVERHEAD;
    let photo_limit = state.upload_limits.max_photo_bytes + MULTIPART_OVERHEAD;

    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/auth/login", post(auth_api::login_handler));

    let protected = Router::new()
        // Session
        .route("/api/auth/me", get(auth_api::me_handler))
        .route("/api/auth/password", post(auth_api::change_password_handler))
        // Users
        .route(
            "/api/users",
            get(users::list_handler).post(users::create_handler),
        )
        .route(
            "/api/users/{id}",
            get(users::get_handler)
                .put(users::update_handler)
                .delete(users::delete_handler),
        )
        .route(
            "/api/users/{id}/photo",
            get(users::photo_get_handler)
                .post(users::photo_upload_handler.layer(DefaultBodyLimit::max(photo_limit))),
        )
        // Matters
        .route(
            "/api/matters",
            get(matters::list_handler).post(matters::create_handler),
        )
        .route(
            "/api/matters/{id}",
            get(matters::get_handler)
                .put(matters::update_handler)
                .delete(matters::delete_handler),
        )
        .route("/api/matters/{id}/stats", get(matters::stats_handler))
        // Case files
        .route(
            "/api/case-files",
            get(case_files::list_handler).post(case_files::create_handler),
        )
        .route(
            "/api/case-files/{id}",
            get(case_files::get_handler)
                .put(case_files::update_handler)
                .delete(case_files::delete_handler),
        )
        // Documents
        .route(
            "/api/documents",
            get(documents::list_handler)
                .post(documents::upload_handler.layer(DefaultBodyLimit::max(document_limit))),
        )
        .route(
            "/api/documents/{id}",
            get(documents::get_handler)
                .put(documents::update_handler)
                .delete(documents::delete_handler),
        )
        .route("/api/documents/{id}/download", get(documents::download_handler))
        // Tasks
        .route(
            "/api/tasks",
            get(tasks::list_handler).post(tasks::create_handler),
        )
        .route("/api/tasks/counts", get(tasks::counts_handler))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_handler)
                .put(tasks::update_handler)
                .delete(tasks::delete_handler),
        )
        .route("/api/tasks/{id}/status", patch(tasks::status_handler))
        .route("/api/tasks/{id}/checklist", post(tasks::checklist_add_handler))
        .route(
            "/api/tasks/{id}/checklist/{item_id}",
            patch(tasks::checklist_toggle_handler).delete(tasks::checklist_delete_handler),
        )
        // Invoices
        .route(
            "/api/invoices",
            get(invoices::list_handler).post(invoices::create_handler),
        )
        .route("/api/invoices/export.csv", get(invoices::export_handler))
        .route(
            "/api/invoices/{id}",
            get(invoices::get_handler)
                .put(invoices::update_handler)
                .delete(invoices::delete_handler),
        )
        .route("/api/invoices/{id}/issue", post(invoices::issue_handler))
        .route(
            "/api/invoices/{id}/payments",
            get(invoices::payments_list_handler).post(invoices::payment_create_handler),
        )
        // Notices
        .route(
            "/api/notices",
            get(notices::list_handler).post(notices::create_handler),
        )
        .route(
            "/api/notices/{id}",
            get(notices::get_handler)
                .put(notices::update_handler)
                .delete(notices::delete_handler),
        )
        // Notifications and activity
        .route("/api/notifications", get(notifications::list_handler))
        .route(
            "/api/notifications/unread-count",
            get(notifications::unread_count_handler),
        )
        .route(
            "/api/notifications/read-all",
            post(notifications::read_all_handler),
        )
        .route(
            "/api/notifications/{id}/read",
            post(notifications::read_handler),
        )
        .route("/api/activity", get(notifications::activity_handler))
        // Dashboard
        .route("/api/dashboard", get(dashboard::summary_handler))
        .route("/api/dashboard/leaderboard", get(dashboard::leaderboard_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(cors_layer(&state.cors_origins))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Only configured origins may call the API from a browser. Origins were
/// validated when the config was resolved; anything unparsable is skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("ignoring CORS origin {:?}: {}", origin, e);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]))
}

/// Start the API server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<SocketAddr, ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::StartupFailed {
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ServerError::StartupFailed {
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(Arc::clone(&state));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("API server shutting down");
            })
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    tracing::info!("API server listening on {}", bound_addr);
    Ok(bound_addr)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.startup_time.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_blocks_after_budget_and_resets_with_window() {
        let limiter = RateLimiter::new(2, 60);
        let start = limiter.window_start.load(Ordering::Relaxed);
        assert!(limiter.check_at(start));
        assert!(limiter.check_at(start + 1));
        assert!(!limiter.check_at(start + 2));
        assert!(limiter.check_at(start + 60));
        assert!(!limiter.check_at(start + 61));
    }

    #[test]
    fn keyed_limiter_tracks_keys_independently() {
        let limiter = KeyedRateLimiter::new(1, 300);
        assert!(limiter.check_at("a@firm.test", 1000));
        assert!(!limiter.check_at("a@firm.test", 1001));
        assert!(limiter.check_at("b@firm.test", 1001));
        assert!(limiter.check_at("a@firm.test", 1300));
    }

    #[test]
    fn keyed_limiter_reset_forgets_key() {
        let limiter = KeyedRateLimiter::new(1, 300);
        assert!(limiter.check_at("a@firm.test", 10));
        limiter.reset("a@firm.test");
        assert!(limiter.check_at("a@firm.test", 11));
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (state, _dir) = crate::testing::test_state().await;
        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }

    async fn call(
        app: Router,
        request: axum::http::Request<axum::body::Body>,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        use tower::ServiceExt;

        let response = app.oneshot(request).await.expect("router is infallible");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn bearer_token_gates_protected_routes() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};

        use crate::db::Role;
        use crate::testing::{TEST_PASSWORD, seed_user, test_state};

        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let app = router(Arc::clone(&state));

        let (status, _) = call(
            app.clone(),
            Request::get("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            app.clone(),
            Request::get("/api/auth/me").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let login = serde_json::json!({ "email": admin.email, "password": TEST_PASSWORD });
        let (status, body) = call(
            app.clone(),
            Request::post("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(login.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().expect("token").to_string();

        let (status, me) = call(
            app,
            Request::get("/api/auth/me")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["id"], admin.id.to_string());
    }
}
