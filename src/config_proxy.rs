//! Local stand-in for the client's configuration service.
//!
//! The client is started with its config URL pointing here. Every request is
//! forwarded upstream unchanged; JSON answers come back with the chat server
//! swapped for the local proxy, and the real chat server is published to
//! whoever waits for it.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const UPSTREAM_CONFIG_URL: &str = "https://clientconfig.rpg.riotgames.com";
pub const PAS_URL: &str = "https://riot-geo.pas.si.riotgames.com/pas/v1/service/chat";

const LOOPBACK: &str = "127.0.0.1";
const ENTITLEMENTS_HEADER: &str = "x-riot-entitlements-jwt";

const CHAT_HOST: &str = "chat.host";
const CHAT_PORT: &str = "chat.port";
const CHAT_AFFINITIES: &str = "chat.affinities";
const CHAT_AFFINITY_ENABLED: &str = "chat.affinity.enabled";
const CHAT_ALLOW_BAD_CERT: &str = "chat.allow_bad_cert.enabled";

/// Where the client would have connected for chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatServer {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigProxyError {
    #[error("failed to bind config proxy: {0}")]
    Bind(#[source] std::io::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("geo token is malformed")]
    MalformedToken,
}

#[derive(Clone)]
struct ConfigState {
    http: reqwest::Client,
    upstream: Arc<str>,
    pas_url: Arc<str>,
    chat_port: u16,
    chat_server: Arc<watch::Sender<Option<ChatServer>>>,
}

/// A running config proxy.
pub struct ConfigProxy {
    addr: SocketAddr,
    chat_server: watch::Receiver<Option<ChatServer>>,
    task: JoinHandle<()>,
}

impl ConfigProxy {
    /// Starts on an ephemeral loopback port, patching chat to `chat_port`.
    pub async fn start(chat_port: u16) -> Result<Self, ConfigProxyError> {
        Self::start_with(UPSTREAM_CONFIG_URL, PAS_URL, chat_port).await
    }

    async fn start_with(
        upstream: &str,
        pas_url: &str,
        chat_port: u16,
    ) -> Result<Self, ConfigProxyError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(ConfigProxyError::Bind)?;
        let addr = listener.local_addr().map_err(ConfigProxyError::Bind)?;

        let (tx, chat_server) = watch::channel(None);
        let state = ConfigState {
            http: reqwest::Client::new(),
            upstream: upstream.trim_end_matches('/').into(),
            pas_url: pas_url.into(),
            chat_port,
            chat_server: Arc::new(tx),
        };
        let app = Router::new().fallback(forward).with_state(state);

        info!(addr = %addr, chat_port, "Config proxy listening");
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Config proxy stopped");
            }
        });

        Ok(Self {
            addr,
            chat_server,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Latest chat server seen in a config answer.
    pub fn chat_server(&self) -> watch::Receiver<Option<ChatServer>> {
        self.chat_server.clone()
    }
}

impl Drop for ConfigProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward(State(state): State<ConfigState>, uri: Uri, headers: HeaderMap) -> Response {
    match relay(&state, &uri, &headers).await {
        Ok(response) => response,
        Err(e) => {
            warn!(uri = %uri, error = %e, "Config request failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn relay(
    state: &ConfigState,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response, ConfigProxyError> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = format!("{}{}", state.upstream, path);
    debug!(url = %url, "Forwarding config request");

    let mut request = state.http.get(&url);
    for name in [USER_AGENT.as_str(), AUTHORIZATION.as_str(), ENTITLEMENTS_HEADER] {
        if let Some(value) = headers.get(name) {
            request = request.header(name, value.clone());
        }
    }
    let response = request.send().await?;
    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let body = response.bytes().await?;

    if !status.is_success() {
        return Ok(passthrough(status, content_type, body));
    }
    let mut config: Value = match serde_json::from_slice(&body) {
        Ok(config @ Value::Object(_)) => config,
        _ => return Ok(passthrough(status, content_type, body)),
    };

    let affinity = match headers.get(AUTHORIZATION) {
        Some(auth) if wants_affinity(&config) => match fetch_affinity(state, auth).await {
            Ok(affinity) => affinity,
            Err(e) => {
                warn!(error = %e, "Could not determine chat affinity");
                None
            }
        },
        _ => None,
    };

    if let Some(server) = patch_client_config(&mut config, state.chat_port, affinity.as_deref()) {
        publish(state, server);
    }
    Ok((status, Json(config)).into_response())
}

fn passthrough(status: StatusCode, content_type: Option<HeaderValue>, body: Bytes) -> Response {
    let mut response = (status, body).into_response();
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn publish(state: &ConfigState, server: ChatServer) {
    state.chat_server.send_if_modified(|current| {
        if current.as_ref() == Some(&server) {
            return false;
        }
        info!(host = %server.host, port = server.port, "Learned chat server");
        *current = Some(server);
        true
    });
}

fn wants_affinity(config: &Value) -> bool {
    config.get(CHAT_AFFINITIES).is_some()
        && config.get(CHAT_AFFINITY_ENABLED).and_then(Value::as_bool) == Some(true)
}

async fn fetch_affinity(
    state: &ConfigState,
    auth: &HeaderValue,
) -> Result<Option<String>, ConfigProxyError> {
    let token = state
        .http
        .get(&*state.pas_url)
        .header(AUTHORIZATION, auth.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    token_affinity(&token)
}

/// `affinity` claim of the geo token. The signature is not checked; the
/// token only picks which regional chat host the client would use.
fn token_affinity(token: &str) -> Result<Option<String>, ConfigProxyError> {
    let payload = token
        .trim()
        .split('.')
        .nth(1)
        .ok_or(ConfigProxyError::MalformedToken)?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| ConfigProxyError::MalformedToken)?;
    let claims: Value =
        serde_json::from_slice(&raw).map_err(|_| ConfigProxyError::MalformedToken)?;
    Ok(claims
        .get("affinity")
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Points the client's chat settings at the local proxy. Returns the real
/// chat server once both its host and port are known.
pub fn patch_client_config(
    config: &mut Value,
    chat_port: u16,
    affinity: Option<&str>,
) -> Option<ChatServer> {
    let obj = config.as_object_mut()?;

    let mut host = obj
        .get(CHAT_HOST)
        .and_then(Value::as_str)
        .map(str::to_string);
    if host.is_some() {
        obj.insert(CHAT_HOST.to_string(), Value::from(LOOPBACK));
    }

    let port = obj
        .get(CHAT_PORT)
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok());
    if obj.contains_key(CHAT_PORT) {
        obj.insert(CHAT_PORT.to_string(), Value::from(chat_port));
    }

    if let Some(Value::Object(affinities)) = obj.get_mut(CHAT_AFFINITIES) {
        if let Some(real) = affinity
            .and_then(|a| affinities.get(a))
            .and_then(Value::as_str)
        {
            host = Some(real.to_string());
        }
        for value in affinities.values_mut() {
            *value = Value::from(LOOPBACK);
        }
    }

    if obj.contains_key(CHAT_ALLOW_BAD_CERT) {
        obj.insert(CHAT_ALLOW_BAD_CERT.to_string(), Value::Bool(true));
    }

    match (host, port) {
        (Some(host), Some(port)) => Some(ChatServer { host, port }),
        _ => None,
    }
}
