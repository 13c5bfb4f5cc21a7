//! Axum-based HTTP gateway for a synchronizing site.
//!
//! - `GET /` is the synchronization entry point and the host page
//! - Local account registration, login and logout under `/api/auth`
//! - Request body size limits (64KB max)
//! - Request timeouts (30s) to prevent slow-loris attacks
//! - Per-client sliding-window rate limits on sync and auth endpoints
//! - `GET /?action=logout` only honored from this site's own pages

use crate::auth::store::DEFAULT_SESSION_TTL_SECS;
use crate::auth::{AuthStore, UserDirectory, UserRecord};
use crate::config::{Config, ConfigStore};
use crate::notify::{HttpNotifier, Notifier};
use crate::sync::handshake::sanitize_email;
use crate::sync::{
    beacon_html, AuthState, BroadcastEmitter, ClientIdentity, SessionSynchronizer, SyncError,
    SyncOutcome, SyncParams,
};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Session cookie name.
pub const SESSION_COOKIE: &str = "ussync_session";

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes
/// How often expired sessions are deleted from the store.
const SESSION_SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

#[derive(Debug)]
pub struct GatewayRateLimiter {
    sync: SlidingWindowRateLimiter,
    auth: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    pub fn new(sync_per_minute: u32, auth_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            sync: SlidingWindowRateLimiter::new(sync_per_minute, window),
            auth: SlidingWindowRateLimiter::new(auth_per_minute, window),
        }
    }

    fn allow_sync(&self, key: &str) -> bool {
        self.sync.allow(key)
    }

    fn allow_auth(&self, key: &str) -> bool {
        self.auth.allow(key)
    }
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SessionSynchronizer>,
    pub auth_store: Arc<AuthStore>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
    pub allow_registration: bool,
    /// Cookie `Max-Age`.
    pub session_ttl_secs: u64,
    /// Site is served over https; cookies get `Secure; SameSite=None` so they
    /// survive the cross-site beacon request.
    pub secure_cookies: bool,
}

impl AppState {
    /// Wire the store, notifier, emitter and synchronizer from config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db_path = config.database_file();
        let auth_store = Arc::new(
            AuthStore::new(&db_path, config.gateway.session_ttl_secs)
                .with_context(|| format!("Failed to open user database {}", db_path.display()))?,
        );
        tracing::info!("User directory initialized at {}", db_path.display());

        let notifier: Arc<dyn Notifier> = Arc::new(HttpNotifier::new(
            Duration::from_secs(config.notifier.timeout_secs),
            config.notifier.max_concurrent,
        )?);

        Ok(Self::assemble(config, auth_store, notifier))
    }

    /// Same wiring with an injected store and notifier.
    pub fn assemble(
        config: &Config,
        auth_store: Arc<AuthStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let key_ring: Arc<dyn ConfigStore> = Arc::new(config.key_ring());
        let emitter = Arc::new(BroadcastEmitter::new(
            Arc::clone(&key_ring),
            notifier,
            &config.site_url,
            &config.notifier.peer_scheme,
        ));
        let directory: Arc<dyn UserDirectory> = auth_store.clone();
        let sync = Arc::new(SessionSynchronizer::new(
            key_ring,
            directory,
            emitter,
            &config.site_url,
        ));

        Self {
            sync,
            auth_store,
            rate_limiter: Arc::new(GatewayRateLimiter::new(
                config.gateway.sync_rate_limit_per_minute,
                config.gateway.auth_rate_limit_per_minute,
            )),
            allow_registration: config.gateway.allow_registration,
            session_ttl_secs: config
                .gateway
                .session_ttl_secs
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
            secure_cookies: config.site_url.trim().starts_with("https://"),
        }
    }
}

/// Routes plus body-limit and timeout layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_sync))
        .route("/health", get(handle_health))
        .route("/api/auth/register", post(handle_auth_register))
        .route("/api/auth/login", post(handle_auth_login))
        .route("/api/auth/logout", post(handle_auth_logout))
        .route("/api/sync/beacons", get(handle_sync_beacons))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(REQUEST_TIMEOUT_SECS),
                )),
        )
}

/// Delete expired sessions on every tick, starting immediately.
fn spawn_session_sweep(store: Arc<AuthStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.cleanup_expired_sessions() {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Swept expired sessions"),
                Err(e) => tracing::warn!("Session sweep failed: {e}"),
            }
        }
    })
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();

    let state = AppState::from_config(&config)?;
    let key_sets = config.key_sets.len();

    println!("🔗 ussync gateway listening on http://{host}:{actual_port}");
    println!("  Site:     {}", config.site_url);
    println!("  Key sets: {key_sets}");
    println!("  GET  /                    — sync entry point");
    println!("  POST /api/auth/register   — local registration");
    println!("  POST /api/auth/login      — local login (returns beacons)");
    println!("  POST /api/auth/logout     — local logout + peer broadcast");
    println!("  GET  /api/sync/beacons    — beacon URLs for the session");
    println!("  GET  /health              — health check");
    println!("  Press Ctrl+C to stop.\n");
    tracing::info!(site = %config.site_url, key_sets, "Gateway started");

    let sweep = spawn_session_sweep(
        Arc::clone(&state.auth_store),
        Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS),
    );
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    sweep.abort();
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// SESSION HELPERS
// ══════════════════════════════════════════════════════════════════════════════

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract the session cookie value.
fn extract_session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty())
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    extract_bearer_token(headers).or_else(|| extract_session_cookie(headers))
}

/// Current user for the request, if any.
fn current_user(state: &AppState, headers: &HeaderMap) -> Option<UserRecord> {
    let token = session_token(headers)?;
    match state.auth_store.validate_session(token) {
        Ok(user) => user,
        Err(e) => {
            tracing::error!("Session lookup failed: {e}");
            None
        }
    }
}

fn session_cookie(state: &AppState, token: &str) -> String {
    let attrs = if state.secure_cookies {
        "Secure; SameSite=None"
    } else {
        "SameSite=Lax"
    };
    format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; Max-Age={}; {attrs}",
        state.session_ttl_secs
    )
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("ussync_session=; Path=/; HttpOnly; Max-Age=0")
}

/// Was the request started from one of this site's own pages (or typed in)?
fn is_same_origin(state: &AppState, headers: &HeaderMap) -> bool {
    let value = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(site) = value(HeaderName::from_static("sec-fetch-site")) {
        return matches!(site, "same-origin" | "none");
    }
    value(header::ORIGIN)
        .or_else(|| value(header::REFERER))
        .is_some_and(|url| {
            let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
            let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
            authority.eq_ignore_ascii_case(state.sync.emitter().site_host())
        })
}

/// Rate limits key on the socket address; `Client-IP` is client-controlled.
fn rate_limit_key(peer: SocketAddr) -> String {
    peer.ip().to_string()
}

fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> ClientIdentity {
    ClientIdentity::from_headers(headers, Some(peer.ip()))
}

fn text(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// 302 to `location`, or to the site root when it is not a valid header value.
fn redirect(state: &AppState, location: &str, cookie: Option<String>) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    let value = HeaderValue::from_str(location)
        .or_else(|_| HeaderValue::from_str(&state.sync.site_root()))
        .unwrap_or_else(|_| HeaderValue::from_static("/"));
    headers.insert(header::LOCATION, value);
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(header::SET_COOKIE, value);
    }
    response
}

fn too_many_requests() -> Response {
    text(StatusCode::TOO_MANY_REQUESTS, "Too many requests")
}

fn sync_error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidEmail | SyncError::Decode => StatusCode::BAD_REQUEST,
        SyncError::UntrustedReferer => StatusCode::FORBIDDEN,
        SyncError::UserNotFound | SyncError::UnknownUser => StatusCode::NOT_FOUND,
        SyncError::UsernameConflict => StatusCode::CONFLICT,
        SyncError::RegistrationFailed | SyncError::LoginFailed | SyncError::Directory => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn render_page(user: Option<&UserRecord>, beacons: &[String]) -> Response {
    let greeting = match user {
        Some(_) => "<p>You are logged in.</p>",
        None => "<p>You are not logged in.</p>",
    };
    Html(format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>ussync</title></head>\
         <body>{greeting}{}</body></html>",
        beacon_html(beacons)
    ))
    .into_response()
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET / — sync entry point. Terminal branches answer with plain text; sync
/// logins answer with a redirect carrying the new session cookie.
async fn handle_sync(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<SyncParams>, axum::extract::rejection::QueryRejection>,
) -> Response {
    let mut params = match query {
        Ok(Query(p)) => p,
        Err(e) => {
            tracing::debug!("Ignoring unparseable query: {e}");
            SyncParams::default()
        }
    };
    if params.is_logout_action() && !is_same_origin(&state, &headers) {
        tracing::warn!("Ignoring logout action from another origin");
        params.action = None;
    }
    let identity = client_identity(&headers, peer);

    let is_sync_traffic = params.has_sync_tokens() || params.is_logout_action();
    if is_sync_traffic && !state.rate_limiter.allow_sync(&rate_limit_key(peer)) {
        tracing::warn!("/ rate limit exceeded for sync request");
        return too_many_requests();
    }

    let user = current_user(&state, &headers);
    let auth = AuthState::from(user.clone());

    match state.sync.handle(&params, &identity, &auth).await {
        Err(err) => text(sync_error_status(&err), err.message()),
        Ok(SyncOutcome::LoggedIn {
            session_token,
            redirect_to,
            ..
        }) => redirect(&state, &redirect_to, Some(session_cookie(&state, &session_token))),
        Ok(SyncOutcome::Redirect(location)) => redirect(&state, &location, None),
        Ok(SyncOutcome::PassThrough) => {
            let beacons = state.sync.passive_beacons(&auth, &params, &identity);
            render_page(user.as_ref(), &beacons)
        }
        Ok(outcome @ SyncOutcome::LocalLogout(_)) => {
            let mut response = text(StatusCode::OK, outcome.message().unwrap_or_default());
            response
                .headers_mut()
                .insert(header::SET_COOKIE, clear_session_cookie());
            response
        }
        Ok(outcome) => text(StatusCode::OK, outcome.message().unwrap_or_default()),
    }
}

/// GET /health — always public (no secrets leaked)
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "site": state.sync.emitter().site_host(),
    }))
}

/// Concrete return type for JSON handlers.
type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({"error": msg.into()})))
}

/// Request body for user registration.
#[derive(Deserialize)]
struct AuthRegisterBody {
    login: String,
    email: String,
    password: String,
}

/// Request body for login.
#[derive(Deserialize)]
struct AuthLoginBody {
    login: String,
    password: String,
}

/// POST /api/auth/register — create a local account.
async fn handle_auth_register(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<AuthRegisterBody>, JsonRejection>,
) -> Response {
    if !state.rate_limiter.allow_auth(&rate_limit_key(peer)) {
        return too_many_requests();
    }
    if !state.allow_registration {
        return api_error(StatusCode::FORBIDDEN, "Registration is disabled").into_response();
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return api_error(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"))
                .into_response();
        }
    };

    let Some(email) = sanitize_email(&body.email) else {
        return api_error(StatusCode::BAD_REQUEST, SyncError::InvalidEmail.message())
            .into_response();
    };

    match state.auth_store.register(&body.login, &email, &body.password) {
        Ok(user) => {
            tracing::info!(user_id = %user.id, "Registered local user");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "status": "registered",
                    "user_id": user.id,
                    "login": user.login,
                })),
            )
                .into_response()
        }
        Err(e) => {
            let msg = e.to_string();
            let status = if msg.contains("already taken") {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            };
            api_error(status, msg).into_response()
        }
    }
}

/// POST /api/auth/login — authenticate, set the session cookie and return the
/// beacon URLs the page should render.
async fn handle_auth_login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<AuthLoginBody>, JsonRejection>,
) -> Response {
    if !state.rate_limiter.allow_auth(&rate_limit_key(peer)) {
        return too_many_requests();
    }
    let identity = client_identity(&headers, peer);

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return api_error(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"))
                .into_response();
        }
    };

    let Ok(user) = state.auth_store.authenticate(&body.login, &body.password) else {
        return api_error(StatusCode::UNAUTHORIZED, "Invalid login or password").into_response();
    };

    let token = match state.auth_store.create_session(&user.id) {
        Ok(t) => t,
        Err(e) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Session creation failed: {e}"),
            )
            .into_response();
        }
    };

    let beacons = state.sync.passive_beacons(
        &AuthState::LoggedIn(user.clone()),
        &SyncParams::default(),
        &identity,
    );
    tracing::info!(user_id = %user.id, peers = beacons.len(), "Local login");

    let mut response = (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "authenticated",
            "token": token,
            "user_id": user.id,
            "login": user.login,
            "beacons": beacons,
        })),
    )
        .into_response();
    if let Ok(cookie) = HeaderValue::from_str(&session_cookie(&state, &token)) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

/// POST /api/auth/logout — end every session of the current user and notify peers.
async fn handle_auth_logout(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let identity = client_identity(&headers, peer);
    let Some(user) = current_user(&state, &headers) else {
        return api_error(StatusCode::UNAUTHORIZED, "Invalid or expired session").into_response();
    };

    let outcome = state
        .sync
        .logout_local(&AuthState::LoggedIn(user), &identity)
        .await;
    let report = match outcome {
        SyncOutcome::LocalLogout(report) => report,
        _ => Default::default(),
    };

    let mut response = (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "logged_out",
            "peers_notified": report.delivered,
            "peers_failed": report.failed,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, clear_session_cookie());
    response
}

/// GET /api/sync/beacons — beacon URLs (and markup) for the current session.
async fn handle_sync_beacons(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResponse {
    let identity = client_identity(&headers, peer);
    let Some(user) = current_user(&state, &headers) else {
        return api_error(StatusCode::UNAUTHORIZED, "Invalid or expired session");
    };

    let beacons = state.sync.passive_beacons(
        &AuthState::LoggedIn(user),
        &SyncParams::default(),
        &identity,
    );
    let html = beacon_html(&beacons);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "beacons": beacons,
            "html": html,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::KeySetConfig;
    use crate::sync::broadcast::tests::{parse_url, RecordingNotifier};
    use crate::sync::codec;
    use http_body_util::BodyExt;

    const SECRET: &str = "alpha";
    const UA: &str = "Mozilla/5.0 test";

    fn config(site_url: &str, unknown_user: &str) -> Config {
        let mut config = Config::from_toml_str(&format!("site_url = \"{site_url}\"")).unwrap();
        config.key_sets.push(KeySetConfig {
            num: 1,
            secret: SECRET.into(),
            domains: crate::config::schema::DomainList::List(vec![
                "site1.com".into(),
                "site2.com".into(),
            ]),
            unknown_user: unknown_user.into(),
        });
        config
    }

    fn state(unknown_user: &str) -> (AppState, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(AuthStore::in_memory(None).unwrap());
        let state = AppState::assemble(
            &config("https://site2.com", unknown_user),
            store,
            notifier.clone(),
        );
        (state, notifier)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([203, 0, 113, 7], 50_000))
    }

    fn browser_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(UA));
        headers
    }

    fn identity() -> ClientIdentity {
        ClientIdentity::new(UA, "203.0.113.7")
    }

    fn sync_query(email: &str, login: &str, status: Option<&str>) -> SyncParams {
        let id = identity();
        SyncParams {
            token: Some(codec::encrypt(email, SECRET, &id).unwrap()),
            id: Some(codec::encrypt(login, SECRET, &id).unwrap()),
            referer: Some(codec::encrypt("site1.com", SECRET, &id).unwrap()),
            status: status.map(str::to_string),
            ..SyncParams::default()
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn with_session(token: &str) -> HeaderMap {
        let mut headers = browser_headers();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn security_body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }

    #[test]
    fn security_timeout_is_30_seconds() {
        assert_eq!(REQUEST_TIMEOUT_SECS, 30);
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn gateway_rate_limiter_blocks_after_limit() {
        let limiter = GatewayRateLimiter::new(2, 1);
        assert!(limiter.allow_sync("127.0.0.1"));
        assert!(limiter.allow_sync("127.0.0.1"));
        assert!(!limiter.allow_sync("127.0.0.1"));
        assert!(limiter.allow_sync("127.0.0.2"));

        assert!(limiter.allow_auth("127.0.0.1"));
        assert!(!limiter.allow_auth("127.0.0.1"));
    }

    #[test]
    fn rate_limiter_zero_means_unlimited() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.allow("ip"));
        }
    }

    #[test]
    fn session_token_prefers_bearer_then_cookie() {
        let mut headers = with_session("cookie-token");
        assert_eq!(session_token(&headers), Some("cookie-token"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer bearer-token"),
        );
        assert_eq!(session_token(&headers), Some("bearer-token"));

        assert_eq!(session_token(&HeaderMap::new()), None);
    }

    #[test]
    fn https_sites_issue_cross_site_cookies() {
        let (state, _) = state("");
        let cookie = session_cookie(&state, "abc");
        assert!(cookie.starts_with("ussync_session=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure; SameSite=None"));
    }

    #[tokio::test]
    async fn sync_login_redirects_with_cookie() {
        let (state, _) = state("");
        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();

        let response = handle_sync(
            State(state.clone()),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://site2.com/?ussync-status=loggedin"
        );

        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        let token = cookie
            .strip_prefix("ussync_session=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        let user = state.auth_store.validate_session(token).unwrap().unwrap();
        assert_eq!(user.id, alice.id);
    }

    #[tokio::test]
    async fn sync_errors_are_plain_text() {
        let (state, _) = state("");
        let response = handle_sync(
            State(state.clone()),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "This user doesn't exist...");
        assert_eq!(state.auth_store.user_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_identity_is_a_decode_error() {
        let (state, _) = state("register_subscriber");
        let mut headers = browser_headers();
        headers.insert("Client-IP", HeaderValue::from_static("198.51.100.9"));

        let response = handle_sync(
            State(state.clone()),
            ConnectInfo(peer()),
            headers,
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_ne!(response.status(), StatusCode::FOUND);
        assert_eq!(state.auth_store.user_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn loggedin_marker_acknowledges() {
        let (state, _) = state("");
        let params = SyncParams {
            status: Some("loggedin".into()),
            ..SyncParams::default()
        };
        let response = handle_sync(
            State(state),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Query(params)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "User logged in!");
    }

    #[tokio::test]
    async fn page_view_renders_beacons_for_verified_user() {
        let (state, _) = state("");
        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();
        let token = state.auth_store.create_session(&alice.id).unwrap();

        let response = handle_sync(
            State(state),
            ConnectInfo(peer()),
            with_session(&token),
            Ok(Query(SyncParams::default())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_string(response).await;
        assert!(html.contains("You are logged in."));
        assert!(html.contains("<img class=\"ussync\" src=\"http://site1.com/?ussync-token="));
        assert!(!html.contains("site2.com/?"));
    }

    #[tokio::test]
    async fn anonymous_page_view_has_no_beacons() {
        let (state, _) = state("");
        let response = handle_sync(
            State(state),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Query(SyncParams::default())),
        )
        .await;
        let html = body_string(response).await;
        assert!(html.contains("You are not logged in."));
        assert!(!html.contains("<img"));
    }

    #[tokio::test]
    async fn sync_rate_limit_returns_429() {
        let (mut state, _) = state("");
        state.rate_limiter = Arc::new(GatewayRateLimiter::new(1, 1));

        let first = handle_sync(
            State(state.clone()),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);

        let second = handle_sync(
            State(state),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn register_then_login_returns_beacons() {
        let (state, _) = state("");

        let registered = handle_auth_register(
            State(state.clone()),
            ConnectInfo(peer()),
            Ok(Json(AuthRegisterBody {
                login: "alice".into(),
                email: "A@X.com".into(),
                password: "password123!".into(),
            })),
        )
        .await;
        assert_eq!(registered.status(), StatusCode::CREATED);

        let response = handle_auth_login(
            State(state.clone()),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Json(AuthLoginBody {
                login: "alice".into(),
                password: "password123!".into(),
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));

        let parsed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(parsed["status"], "authenticated");
        let beacon = parsed["beacons"][0].as_str().unwrap();
        let (host, query) = parse_url(beacon);
        assert_eq!(host, "site1.com");
        assert_eq!(
            codec::decrypt(&query["ussync-token"], SECRET, &identity()).unwrap(),
            "a@x.com"
        );
    }

    #[tokio::test]
    async fn register_rejects_bad_email_and_duplicates() {
        let (state, _) = state("");
        let body = |email: &str| {
            Ok(Json(AuthRegisterBody {
                login: "alice".into(),
                email: email.into(),
                password: "password123!".into(),
            }))
        };

        let bad = handle_auth_register(
            State(state.clone()),
            ConnectInfo(peer()),
            body("nope"),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let first = handle_auth_register(
            State(state.clone()),
            ConnectInfo(peer()),
            body("a@x.com"),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let dup = handle_auth_register(
            State(state),
            ConnectInfo(peer()),
            body("a@x.com"),
        )
        .await;
        assert_eq!(dup.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn registration_can_be_disabled() {
        let (mut state, _) = state("");
        state.allow_registration = false;
        let response = handle_auth_register(
            State(state),
            ConnectInfo(peer()),
            Ok(Json(AuthRegisterBody {
                login: "alice".into(),
                email: "a@x.com".into(),
                password: "password123!".into(),
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_unauthorized() {
        let (state, _) = state("");
        state
            .auth_store
            .register("alice", "a@x.com", "password123!")
            .unwrap();
        let response = handle_auth_login(
            State(state),
            ConnectInfo(peer()),
            browser_headers(),
            Ok(Json(AuthLoginBody {
                login: "alice".into(),
                password: "wrong-password".into(),
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_revokes_and_notifies_peers() {
        let (state, notifier) = state("");
        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();
        let token = state.auth_store.create_session(&alice.id).unwrap();

        let response =
            handle_auth_logout(State(state.clone()), ConnectInfo(peer()), with_session(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert!(state.auth_store.validate_session(&token).unwrap().is_none());

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].identity, identity());
        let (host, query) = parse_url(&sent[0].url);
        assert_eq!(host, "site1.com");
        assert_eq!(query["ussync-status"], "loggingout");
    }

    #[tokio::test]
    async fn logout_without_session_is_unauthorized() {
        let (state, notifier) = state("");
        let response =
            handle_auth_logout(State(state), ConnectInfo(peer()), browser_headers()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn beacons_endpoint_requires_session() {
        let (state, _) = state("");
        let (status, _) =
            handle_sync_beacons(State(state.clone()), ConnectInfo(peer()), browser_headers()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();
        let token = state.auth_store.create_session(&alice.id).unwrap();
        let (status, Json(body)) =
            handle_sync_beacons(State(state), ConnectInfo(peer()), with_session(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["beacons"].as_array().unwrap().len(), 1);
        assert!(body["html"].as_str().unwrap().contains("&amp;ussync-key=1"));
    }

    #[tokio::test]
    async fn health_reports_site_host() {
        let (state, _) = state("");
        let response = handle_health(State(state)).await.into_response();
        let parsed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["site"], "site2.com");
    }

    #[test]
    fn redirect_falls_back_to_site_root() {
        let (state, _) = state("");
        let response = redirect(&state, "/a\nb", None);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "https://site2.com/");
    }

    #[tokio::test]
    async fn redirect_to_with_tab_stays_on_site() {
        let (state, _) = state("");
        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();
        let token = state.auth_store.create_session(&alice.id).unwrap();

        for target in ["/\t/evil.com/", "/\n/evil.com/"] {
            let params = SyncParams {
                redirect_to: Some(target.into()),
                ..SyncParams::default()
            };
            let response = handle_sync(
                State(state.clone()),
                ConnectInfo(peer()),
                with_session(&token),
                Ok(Query(params)),
            )
            .await;
            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(response.headers()[header::LOCATION], "https://site2.com/");
        }
    }

    #[tokio::test]
    async fn session_sweep_deletes_expired_rows() {
        let store = Arc::new(AuthStore::in_memory(Some(0)).unwrap());
        let alice = store.create_user("alice", "a@x.com", true).unwrap();
        store.create_session(&alice.id).unwrap();
        store.create_session(&alice.id).unwrap();

        let sweep = spawn_session_sweep(Arc::clone(&store), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sweep.abort();

        assert_eq!(store.cleanup_expired_sessions().unwrap(), 0);
    }

    #[tokio::test]
    async fn rate_limit_ignores_client_ip_header() {
        let (mut state, _) = state("");
        state.rate_limiter = Arc::new(GatewayRateLimiter::new(1, 1));
        let spoofed = |ip: &'static str| {
            let mut headers = browser_headers();
            headers.insert("Client-IP", HeaderValue::from_static(ip));
            headers
        };

        let first = handle_sync(
            State(state.clone()),
            ConnectInfo(peer()),
            spoofed("198.51.100.1"),
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);
        let second = handle_sync(
            State(state.clone()),
            ConnectInfo(peer()),
            spoofed("198.51.100.2"),
            Ok(Query(sync_query("a@x.com", "alice", None))),
        )
        .await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let login = |ip: &'static str| {
            handle_auth_login(
                State(state.clone()),
                ConnectInfo(peer()),
                spoofed(ip),
                Ok(Json(AuthLoginBody {
                    login: "alice".into(),
                    password: "password123!".into(),
                })),
            )
        };
        assert_ne!(login("198.51.100.3").await.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(login("198.51.100.4").await.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    fn logout_params() -> SyncParams {
        SyncParams {
            action: Some("logout".into()),
            ..SyncParams::default()
        }
    }

    #[tokio::test]
    async fn cross_site_logout_action_is_ignored() {
        let (state, notifier) = state("");
        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();
        let token = state.auth_store.create_session(&alice.id).unwrap();

        let mut embedded = with_session(&token);
        embedded.insert(header::REFERER, HeaderValue::from_static("https://evil.com/page"));
        let mut fetched = with_session(&token);
        fetched.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));
        fetched.insert(header::REFERER, HeaderValue::from_static("https://site2.com/"));

        for headers in [with_session(&token), embedded, fetched] {
            let response = handle_sync(
                State(state.clone()),
                ConnectInfo(peer()),
                headers,
                Ok(Query(logout_params())),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(body_string(response).await.contains("You are logged in."));
        }
        assert!(state.auth_store.validate_session(&token).unwrap().is_some());
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn same_origin_logout_action_logs_out() {
        let (state, notifier) = state("");
        let alice = state.auth_store.create_user("alice", "a@x.com", true).unwrap();

        for (name, value) in [
            ("referer", HeaderValue::from_static("https://site2.com/account?tab=1")),
            ("origin", HeaderValue::from_static("https://site2.com")),
            ("sec-fetch-site", HeaderValue::from_static("same-origin")),
        ] {
            let token = state.auth_store.create_session(&alice.id).unwrap();
            let mut headers = with_session(&token);
            headers.insert(name, value);
            let response = handle_sync(
                State(state.clone()),
                ConnectInfo(peer()),
                headers,
                Ok(Query(logout_params())),
            )
            .await;
            assert_eq!(body_string(response).await, "Logged out.", "{name}");
            assert!(state.auth_store.validate_session(&token).unwrap().is_none());
        }
        assert_eq!(notifier.sent.lock().len(), 3);
    }
}
