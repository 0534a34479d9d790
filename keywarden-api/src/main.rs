//! Keywarden API Server
//!
//! HTTP interface to the license keystore.
//!
//! Configuration (environment variables):
//!   KEYWARDEN_PORT        - Listen port (default: 8000)
//!   KEYWARDEN_DATA_DIR    - Persistent data directory (default: ./keywarden-data)
//!   KEYWARDEN_LOG_FORMAT  - "json" for structured logging, "pretty" for dev
//!   ADMIN_PASSWORD        - Basic-auth password for the admin principal
//!   BILLING_PASSWORD      - Basic-auth password for the billing principal
//!   WEBHOOK_SECRET        - Shared secret for HMAC-signed webhook callers
//!
//! The three secrets are required; the server refuses to start without them.
//!
//! Data directory layout:
//!   keys.json                      - license key table
//!   request_logs.json              - audit log
//!   .well-known/pki-validation/    - served at /.well-known/pki-validation/
//!   downloads/                     - served at /downloads/ (as attachments)

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path as UrlPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use keywarden_keystore::{
    ActivationOutcome, AuditAction, AuditEvent, AuditSinkSync, AuthConfig, ClientInfo,
    FileAuditSink, FileBackend, KeyEdit, Keystore, Principal, StoreError, TracingAuditSink,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    keystore: Keystore,
    auth: AuthConfig,
    audit: Arc<dyn AuditSinkSync>,
    keys_path: PathBuf,
    logs_path: PathBuf,
    well_known_dir: PathBuf,
    downloads_dir: PathBuf,
}

type Shared = Arc<AppState>;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

fn default_machine_limit() -> u32 {
    1
}

#[derive(Deserialize)]
struct GenerateKeyReq {
    #[serde(default)]
    expiration_days: u32,
    #[serde(default = "default_machine_limit")]
    machine_limit: u32,
    product_id: String,
}

#[derive(Deserialize)]
struct ActivateReq {
    key: String,
    machine_id: String,
}

#[derive(Deserialize)]
struct UpdateExpirationReq {
    product_id: String,
    additional_days: u32,
}

#[derive(Deserialize)]
struct EditKeyReq {
    key: Option<String>,
    #[serde(flatten)]
    edit: KeyEdit,
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn reply(code: StatusCode, status: &str, message: &str) -> Response {
    (code, Json(json!({ "status": status, "message": message }))).into_response()
}

fn unauthorized() -> Response {
    reply(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid credentials.")
}

fn forbidden(message: &str) -> Response {
    reply(StatusCode::FORBIDDEN, "forbidden", message)
}

fn bad_request(message: &str) -> Response {
    reply(StatusCode::BAD_REQUEST, "error", message)
}

fn not_found(message: &str) -> Response {
    reply(StatusCode::NOT_FOUND, "error", message)
}

fn storage_failure(e: StoreError) -> Response {
    tracing::error!(error = %e, "store operation failed");
    reply(StatusCode::INTERNAL_SERVER_ERROR, "error", &e.to_string())
}

// ---------------------------------------------------------------------------
// Authentication helpers
// ---------------------------------------------------------------------------

fn authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Option<Principal> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok());
    state.auth.authenticate(authorization, signature, body)
}

/// Best-effort caller address: first hop of X-Forwarded-For, else the peer.
fn client_info(headers: &HeaderMap, addr: SocketAddr, principal: Option<&Principal>) -> ClientInfo {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| addr.ip().to_string());
    ClientInfo {
        ip_address: Some(ip),
        username: principal.map(|p| p.audit_name()),
    }
}

// ---------------------------------------------------------------------------
// Routes — key lifecycle
// ---------------------------------------------------------------------------

async fn generate_key(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &body) else {
        return unauthorized();
    };
    let req: GenerateKeyReq = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(&format!("Invalid request body: {}", e)),
    };

    let client = client_info(&headers, addr, Some(&principal));
    match state
        .keystore
        .generate(req.expiration_days, req.machine_limit, &req.product_id, &client)
        .await
    {
        Ok(record) => (
            StatusCode::CREATED,
            Json(json!({
                "status": "success",
                "key": record.key.as_str(),
                "expiration_date": record.expiration_date,
            })),
        )
            .into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn activate_or_validate_key(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ActivateReq = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(&format!("Invalid request body: {}", e)),
    };

    let client = client_info(&headers, addr, None);
    match state
        .keystore
        .activate_or_validate(&req.key, &req.machine_id, &client)
        .await
    {
        Ok(ActivationOutcome::Activated { product_id }) => Json(json!({
            "status": "activated",
            "message": "The key has been activated for the new machine.",
            "product_id": product_id,
        }))
        .into_response(),
        Ok(ActivationOutcome::Valid { product_id }) => Json(json!({
            "status": "valid",
            "message": "The key and machine ID are valid and activated.",
            "product_id": product_id,
        }))
        .into_response(),
        Ok(ActivationOutcome::Expired) => {
            reply(StatusCode::BAD_REQUEST, "expired", "The key has expired.")
        }
        Ok(ActivationOutcome::LimitExceeded) => reply(
            StatusCode::BAD_REQUEST,
            "limit_exceeded",
            "The key has reached its machine usage limit.",
        ),
        Ok(ActivationOutcome::Invalid) => {
            reply(StatusCode::BAD_REQUEST, "invalid", "The key is invalid.")
        }
        Err(e) => storage_failure(e),
    }
}

async fn update_expiration(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &body) else {
        return unauthorized();
    };
    if !principal.role.is_admin() {
        return forbidden("User is not authorized to update keys.");
    }
    let req: UpdateExpirationReq = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return bad_request("Product ID and additional_days are required."),
    };

    let client = client_info(&headers, addr, Some(&principal));
    match state
        .keystore
        .update_expiration(&req.product_id, req.additional_days, &client)
        .await
    {
        Ok(count) => Json(json!({
            "status": "success",
            "message": format!(
                "Updated expiration for {} keys associated with product ID {}.",
                count, req.product_id
            ),
            "count": count,
        }))
        .into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn key_info(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<KeyQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &[]) else {
        return unauthorized();
    };
    if !principal.role.is_admin() {
        return forbidden("User is not authorized to access this information.");
    }
    let Some(key) = query.key else {
        return bad_request("Key parameter is required.");
    };

    let client = client_info(&headers, addr, Some(&principal));
    match state.keystore.key_info(&key, &client).await {
        Ok(Some(record)) => Json(json!({ "status": "success", "key_info": record })).into_response(),
        Ok(None) => not_found("Key not found."),
        Err(e) => storage_failure(e),
    }
}

async fn edit_key(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &body) else {
        return unauthorized();
    };
    if !principal.role.is_admin() {
        return forbidden("User is not authorized to edit keys.");
    }
    let req: EditKeyReq = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(&format!("Invalid request body: {}", e)),
    };
    let Some(key) = req.key else {
        return bad_request("Key parameter is required.");
    };

    let client = client_info(&headers, addr, Some(&principal));
    match state.keystore.edit_key(&key, &req.edit, &client).await {
        Ok(Some(record)) => Json(json!({
            "status": "success",
            "message": "Key information updated.",
            "key_info": record,
        }))
        .into_response(),
        Ok(None) => not_found("Key not found."),
        Err(e) => storage_failure(e),
    }
}

async fn delete_key(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<KeyQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &[]) else {
        return unauthorized();
    };
    if !principal.role.is_admin() {
        return forbidden("User is not authorized to delete keys.");
    }
    let Some(key) = query.key else {
        return bad_request("Key parameter is required.");
    };

    let client = client_info(&headers, addr, Some(&principal));
    match state.keystore.delete_key(&key, &client).await {
        Ok(true) => Json(json!({ "status": "success", "message": "Key deleted." })).into_response(),
        Ok(false) => not_found("Key not found."),
        Err(e) => storage_failure(e),
    }
}

// ---------------------------------------------------------------------------
// Routes — privileged file exports
// ---------------------------------------------------------------------------

async fn request_logs(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &[]) else {
        return unauthorized();
    };
    if !principal.role.is_admin() {
        return forbidden("User is not authorized to access request logs.");
    }
    if !state.logs_path.is_file() {
        return not_found("Request log file not found.");
    }

    let client = client_info(&headers, addr, Some(&principal));
    state
        .audit
        .record(AuditEvent::new(AuditAction::RetrieveRequestLogs, client));
    export_json_file(&state.logs_path, "Request log file not found.").await
}

async fn keys_file(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(principal) = authenticate(&state, &headers, &[]) else {
        return unauthorized();
    };
    if !principal.role.is_admin() {
        return forbidden("User is not authorized to access keys.");
    }
    if !state.keys_path.is_file() {
        return not_found("Keys file not found.");
    }

    let client = client_info(&headers, addr, Some(&principal));
    state
        .audit
        .record(AuditEvent::new(AuditAction::RetrieveKeysFile, client));
    export_json_file(&state.keys_path, "Keys file not found.").await
}

async fn export_json_file(path: &Path, missing_message: &str) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CONTENT_DISPOSITION, "attachment"),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => not_found(missing_message),
    }
}

// ---------------------------------------------------------------------------
// Routes — static files
// ---------------------------------------------------------------------------

async fn serve_auth_file(
    State(state): State<Shared>,
    UrlPath(filename): UrlPath<String>,
) -> Response {
    serve_static(&state.well_known_dir, &filename, false).await
}

async fn download_file(
    State(state): State<Shared>,
    UrlPath(filename): UrlPath<String>,
) -> Response {
    serve_static(&state.downloads_dir, &filename, true).await
}

/// Serve a file from `base`, refusing any resolved path that escapes it.
async fn serve_static(base: &Path, filename: &str, as_attachment: bool) -> Response {
    let Ok(base) = base.canonicalize() else {
        return not_found("File not found.");
    };
    let Ok(resolved) = base.join(filename).canonicalize() else {
        return not_found("File not found.");
    };
    if !resolved.starts_with(&base) {
        return forbidden("Access to the requested path is not allowed.");
    }
    if !resolved.is_file() {
        return not_found("File not found.");
    }

    let bytes = match tokio::fs::read(&resolved).await {
        Ok(bytes) => bytes,
        Err(_) => return not_found("File not found."),
    };
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response();
    if as_attachment {
        let disposition = resolved
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| {
                HeaderValue::from_str(&format!("attachment; filename=\"{}\"", n)).ok()
            })
            .unwrap_or_else(|| HeaderValue::from_static("attachment"));
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, disposition);
    }
    response
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn required_env(name: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => {
            tracing::error!("{} must be set", name);
            std::process::exit(1);
        }
    }
}

fn load_auth_config() -> AuthConfig {
    let admin_password = required_env("ADMIN_PASSWORD");
    let billing_password = required_env("BILLING_PASSWORD");
    let webhook_secret = required_env("WEBHOOK_SECRET");
    AuthConfig::new(admin_password, billing_password, webhook_secret.into_bytes())
}

#[tokio::main]
async fn main() {
    let log_format = std::env::var("KEYWARDEN_LOG_FORMAT").unwrap_or_else(|_| "pretty".into());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "keywarden_api=info,keywarden_keystore=info".into());
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let port: u16 = std::env::var("KEYWARDEN_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let data_dir = PathBuf::from(
        std::env::var("KEYWARDEN_DATA_DIR").unwrap_or_else(|_| "./keywarden-data".into()),
    );

    let auth = load_auth_config();

    let keys_path = data_dir.join("keys.json");
    let logs_path = data_dir.join("request_logs.json");
    let well_known_dir = data_dir.join(".well-known").join("pki-validation");
    let downloads_dir = data_dir.join("downloads");
    for dir in [&well_known_dir, &downloads_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!(dir = %dir.display(), error = %e, "failed to create data directory");
            std::process::exit(1);
        }
    }

    let storage = match FileBackend::new(&keys_path) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize key storage");
            std::process::exit(1);
        }
    };
    let audit: Arc<dyn AuditSinkSync> = Arc::new(TracingAuditSink::new(Arc::new(
        FileAuditSink::new(&logs_path),
    )));
    let keystore = Keystore::new(storage, audit.clone());

    let state: Shared = Arc::new(AppState {
        keystore,
        auth,
        audit,
        keys_path,
        logs_path,
        well_known_dir,
        downloads_dir,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/.well-known/pki-validation/*filename", get(serve_auth_file))
        .route("/downloads/*filename", get(download_file))
        .route("/generate-key", post(generate_key))
        .route("/key", post(activate_or_validate_key))
        .route("/update-expiration", put(update_expiration))
        .route("/request-logs", get(request_logs))
        .route("/keys", get(keys_file))
        .route("/key-info", get(key_info))
        .route("/edit-key", put(edit_key))
        .route("/delete-key", delete(delete_key))
        .layer(cors)
        .with_state(state);

    tracing::info!(port, data_dir = %data_dir.display(), "starting Keywarden API server");

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
