//! Management API
//!
//! JSON over HTTP for inbound CRUD, settings and engine status. Every
//! successful mutation marks the restart coordinator dirty; the engine is
//! restarted later by the scheduler, never inside a request.

use crate::coordinator::RestartCoordinator;
use crate::db::Database;
use crate::error::{Error, ErrorResponse, Result};
use crate::inbound::{InboundUpdate, NewInbound, ProtocolSettings, User};
use crate::registry::{parse_engine_template, InboundRegistry, ENGINE_TEMPLATE_KEY};
use crate::supervisor::{EngineSupervisor, RestartReport};
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Shared handles used by request handlers
pub struct ApiState {
    pub db: Arc<Database>,
    pub registry: Arc<InboundRegistry>,
    pub coordinator: Arc<RestartCoordinator>,
    pub supervisor: Arc<EngineSupervisor>,
    /// Bearer token that acts as the seeded administrator
    pub admin_token: String,
    /// Account id the bearer token resolves to; survives renames
    pub admin_id: i64,
}

/// Success envelope: `{"success": true, "msg": ..., "obj": ...}`
#[derive(Debug, Serialize)]
struct Envelope {
    success: bool,
    msg: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    obj: Value,
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn success(action: &str, obj: Value) -> Response<Full<Bytes>> {
    let envelope = Envelope {
        success: true,
        msg: format!("{} succeeded", action),
        obj,
    };
    let body = serde_json::to_string(&envelope).unwrap_or_else(|_| {
        format!(r#"{{"success":true,"msg":"{}"}}"#, envelope.msg)
    });
    json_response(StatusCode::OK, body)
}

fn failure(action: &str, error: &Error) -> Response<Full<Bytes>> {
    json_response(
        error.code().status_code(),
        ErrorResponse::new(action, error).to_json(),
    )
}

fn to_obj<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::StorageFailure(format!("encode response: {}", e)))
}

/// Management API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<ApiState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Management API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %peer, error = %e, "Management connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept management connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, state: Arc<ApiState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Management connection error: {}", e))?;

    Ok(())
}

/// Decode `Basic` credentials into `(username, password)`
fn parse_basic(encoded: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn authenticate(headers: &HeaderMap, state: &ApiState) -> Result<User> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Unauthorized)?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        if token != state.admin_token {
            return Err(Error::Unauthorized);
        }
        return state
            .db
            .get_user(state.admin_id)?
            .ok_or(Error::Unauthorized);
    }

    if let Some(encoded) = header.strip_prefix("Basic ") {
        let (username, password) = parse_basic(encoded).ok_or(Error::Unauthorized)?;
        return state
            .db
            .verify_credentials(&username, &password)?
            .ok_or(Error::Unauthorized);
    }

    Err(Error::Unauthorized)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();

    debug!(%method, %path, "Management API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
        (&Method::GET, "/version") => {
            let version = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }
        _ => {}
    }

    let user = match authenticate(&parts.headers, &state) {
        Ok(user) => user,
        Err(e) => {
            warn!(%path, "Unauthorized management API request");
            return Ok(failure("authenticate", &e));
        }
    };

    let body = if method == Method::POST {
        body.collect().await?.to_bytes()
    } else {
        Bytes::new()
    };

    let (action, result) = match (&method, path.as_str()) {
        (&Method::POST, "/inbound/list") => ("list inbounds", list_inbounds(&state, &user)),
        (&Method::POST, "/inbound/add") => ("add inbound", add_inbound(&state, &user, &body)),
        (&Method::POST, p) if p.starts_with("/inbound/update/") => (
            "update inbound",
            path_id(p, "/inbound/update/").and_then(|id| update_inbound(&state, &user, id, &body)),
        ),
        (&Method::POST, p) if p.starts_with("/inbound/del/") => (
            "delete inbound",
            path_id(p, "/inbound/del/").and_then(|id| delete_inbound(&state, &user, id)),
        ),
        (&Method::GET, "/setting/all") => ("load settings", all_settings(&state, &user)),
        (&Method::POST, "/setting/update") => {
            ("update settings", update_settings(&state, &user, &body))
        }
        (&Method::POST, "/user/update") => ("update user", update_user(&state, &user, &body)),
        (&Method::GET, "/engine/status") => ("engine status", engine_status(&state).await),
        (&Method::POST, "/engine/restart") => ("restart engine", restart_engine(&state, &user).await),
        _ => {
            return Ok(failure(
                "route",
                &Error::NotFound(format!("{} {}", method, path)),
            ))
        }
    };

    Ok(match result {
        Ok(obj) => success(action, obj),
        Err(e) => {
            debug!(%path, error = %e, "Management API request failed");
            failure(action, &e)
        }
    })
}

fn path_id(path: &str, prefix: &str) -> Result<i64> {
    let raw = path.strip_prefix(prefix).unwrap_or_default();
    raw.parse()
        .map_err(|_| Error::BadRequest(format!("invalid id '{}'", raw)))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::BadRequest(format!("invalid JSON: {}", e)))
}

/// Form fields may carry nested JSON encoded as a string
fn embedded_json(value: Value) -> Result<Value> {
    match value {
        Value::String(text) if text.trim().is_empty() => Ok(Value::Null),
        Value::String(text) => serde_json::from_str(&text)
            .map_err(|e| Error::BadRequest(format!("invalid embedded JSON: {}", e))),
        other => Ok(other),
    }
}

fn require_admin(user: &User) -> Result<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden("administrator role required".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundForm {
    #[serde(default)]
    remark: String,
    listen: Option<String>,
    port: u16,
    protocol: String,
    #[serde(default)]
    settings: Value,
    stream_settings: Option<Value>,
    sniffing: Option<Value>,
    tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundUpdateForm {
    remark: Option<String>,
    enable: Option<bool>,
    listen: Option<String>,
    port: Option<u16>,
    protocol: Option<String>,
    settings: Option<Value>,
    stream_settings: Option<Value>,
    sniffing: Option<Value>,
    tag: Option<String>,
}

fn list_inbounds(state: &ApiState, user: &User) -> Result<Value> {
    let owner = if user.is_admin() { None } else { Some(user.id) };
    to_obj(&state.registry.list(owner)?)
}

fn add_inbound(state: &ApiState, user: &User, body: &[u8]) -> Result<Value> {
    require_admin(user)?;
    let form: InboundForm = parse_body(body)?;

    let new = NewInbound {
        remark: form.remark,
        listen: form.listen,
        port: form.port,
        protocol: ProtocolSettings::from_parts(&form.protocol, embedded_json(form.settings)?)?,
        stream_settings: form.stream_settings.map(embedded_json).transpose()?.filter(|v| !v.is_null()),
        sniffing: form.sniffing.map(embedded_json).transpose()?.filter(|v| !v.is_null()),
        tag: form.tag,
    };

    let added = state.registry.add(user, new)?;
    state.coordinator.mark_dirty();
    to_obj(&added)
}

fn update_inbound(state: &ApiState, user: &User, id: i64, body: &[u8]) -> Result<Value> {
    let current = state.registry.get(id)?;
    if !user.is_self_or_admin(current.user_id) {
        return Err(Error::Forbidden(format!("inbound {} belongs to another user", id)));
    }
    let form: InboundUpdateForm = parse_body(body)?;

    let protocol = if form.protocol.is_some() || form.settings.is_some() {
        let name = form
            .protocol
            .unwrap_or_else(|| current.protocol.protocol().to_string());
        let settings = match form.settings {
            Some(settings) => embedded_json(settings)?,
            None => current.protocol.settings_value(),
        };
        Some(ProtocolSettings::from_parts(&name, settings)?)
    } else {
        None
    };

    let update = InboundUpdate {
        remark: form.remark,
        enable: form.enable,
        listen: form.listen,
        port: form.port,
        protocol,
        stream_settings: form.stream_settings.map(embedded_json).transpose()?,
        sniffing: form.sniffing.map(embedded_json).transpose()?,
        tag: form.tag,
    };

    let updated = state.registry.update(id, update)?;
    state.coordinator.mark_dirty();
    to_obj(&updated)
}

fn delete_inbound(state: &ApiState, user: &User, id: i64) -> Result<Value> {
    let current = state.registry.get(id)?;
    if !user.is_self_or_admin(current.user_id) {
        return Err(Error::Forbidden(format!("inbound {} belongs to another user", id)));
    }
    state.registry.delete(id)?;
    state.coordinator.mark_dirty();
    Ok(Value::Null)
}

fn all_settings(state: &ApiState, user: &User) -> Result<Value> {
    require_admin(user)?;
    to_obj(&state.db.all_settings()?)
}

fn update_settings(state: &ApiState, user: &User, body: &[u8]) -> Result<Value> {
    require_admin(user)?;
    let form: BTreeMap<String, Value> = parse_body(body)?;

    // Validate everything before writing anything
    let mut values = Vec::with_capacity(form.len());
    for (key, value) in form {
        let text = match value {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if key == ENGINE_TEMPLATE_KEY && !text.trim().is_empty() {
            parse_engine_template(&text)?;
        }
        values.push((key, text));
    }

    for (key, text) in &values {
        state.db.set_setting(key, text)?;
    }
    info!(keys = values.len(), "Settings updated");
    state.coordinator.mark_dirty();
    Ok(Value::Null)
}

#[derive(Debug, Deserialize)]
struct UserForm {
    /// Defaults to the calling account
    id: Option<i64>,
    username: String,
    password: String,
}

fn update_user(state: &ApiState, user: &User, body: &[u8]) -> Result<Value> {
    let form: UserForm = parse_body(body)?;
    let target = form.id.unwrap_or(user.id);
    if !user.is_self_or_admin(target) {
        return Err(Error::Forbidden("cannot modify another account".to_string()));
    }
    if form.username.trim().is_empty() || form.password.is_empty() {
        return Err(Error::BadRequest(
            "username and password must not be empty".to_string(),
        ));
    }
    state.db.update_user(target, &form.username, &form.password)?;
    info!(user_id = target, username = %form.username, "Account updated");
    Ok(Value::Null)
}

async fn engine_status(state: &ApiState) -> Result<Value> {
    to_obj(&state.supervisor.status().await)
}

async fn restart_engine(state: &ApiState, user: &User) -> Result<Value> {
    require_admin(user)?;
    let obj = match state.supervisor.restart(true).await? {
        RestartReport::Restarted { inbounds } => {
            serde_json::json!({ "restarted": true, "inbounds": inbounds })
        }
        RestartReport::Unchanged => serde_json::json!({ "restarted": false }),
    };
    Ok(obj)
}
