//! Local auth-translating proxy.
//!
//! Binds `127.0.0.1:0`, rewrites the inbound vendor key header into the
//! upstream's `Authorization` scheme and streams responses back unbuffered.
//! The agent (CLI subprocess or HTTP backend) uses the proxy's local URL as
//! its base URL.

mod headers;

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderName, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use self::headers::{filter_response_headers, translate_request_headers};

type ProxyBody = UnsyncBoxBody<Bytes, reqwest::Error>;

/// Default vendor key header the agent sends.
pub const DEFAULT_KEY_HEADER: &str = "x-api-key";
/// Default scheme used in the upstream `Authorization` header.
pub const DEFAULT_AUTH_SCHEME: &str = "Bearer";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header translation settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub key_header: String,
    pub auth_scheme: String,
    /// Key used when a request carries none.
    pub fallback_api_key: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            key_header: DEFAULT_KEY_HEADER.to_string(),
            auth_scheme: DEFAULT_AUTH_SCHEME.to_string(),
            fallback_api_key: None,
        }
    }
}

#[derive(Debug)]
pub enum ProxyError {
    /// The local listener could not be bound.
    Bind(std::io::Error),
    /// Header name in the configuration is not a valid HTTP header.
    InvalidKeyHeader(String),
    /// The upstream HTTP client could not be built.
    Client(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Bind(e) => write!(f, "Failed to bind auth proxy on 127.0.0.1: {e}"),
            ProxyError::InvalidKeyHeader(name) => {
                write!(f, "Invalid api_key_header in [proxy]: {name:?}")
            }
            ProxyError::Client(e) => write!(f, "Failed to build proxy HTTP client: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Bind(e) => Some(e),
            _ => None,
        }
    }
}

struct Running {
    local_url: Url,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Shared per-request state.
struct Forwarder {
    client: reqwest::Client,
    key_header: HeaderName,
    auth_scheme: String,
    fallback_api_key: Option<String>,
    target: watch::Receiver<Option<Url>>,
}

/// Handle to the auth proxy. One handle owns at most one listener.
pub struct AuthProxy {
    config: ProxyConfig,
    target: watch::Sender<Option<Url>>,
    running: Mutex<Option<Running>>,
}

impl AuthProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let (target, _) = watch::channel(None);
        Self {
            config,
            target,
            running: Mutex::new(None),
        }
    }

    /// Starts the listener and returns its local URL.
    ///
    /// Idempotent: if already running, returns the existing URL and leaves
    /// the target unchanged.
    ///
    /// # Errors
    /// Returns an error if the listener cannot be bound or the config is invalid.
    pub async fn start(&self, target: Url) -> Result<Url, ProxyError> {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.as_ref() {
            tracing::debug!(local = %existing.local_url, "auth proxy already running");
            return Ok(existing.local_url.clone());
        }

        let key_header = HeaderName::from_bytes(self.config.key_header.trim().as_bytes())
            .map_err(|_invalid| ProxyError::InvalidKeyHeader(self.config.key_header.clone()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .map_err(ProxyError::Bind)?;
        let addr = listener.local_addr().map_err(ProxyError::Bind)?;
        let local_url = Url::parse(&format!("http://{addr}"))
            .map_err(|e| ProxyError::Bind(std::io::Error::other(e)))?;

        self.target.send_replace(Some(target.clone()));
        let forwarder = Arc::new(Forwarder {
            client,
            key_header,
            auth_scheme: self.config.auth_scheme.clone(),
            fallback_api_key: self.config.fallback_api_key.clone(),
            target: self.target.subscribe(),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, forwarder, cancel.clone()));
        tracing::info!(local = %local_url, target = %target, "auth proxy listening");

        *running = Some(Running {
            local_url: local_url.clone(),
            cancel,
            task,
        });
        Ok(local_url)
    }

    /// Points the proxy at a new upstream. Takes effect on the next request.
    pub fn update_target(&self, target: Url) {
        tracing::info!(target = %target, "auth proxy target updated");
        self.target.send_replace(Some(target));
    }

    pub fn target(&self) -> Option<Url> {
        self.target.borrow().clone()
    }

    pub async fn local_url(&self) -> Option<Url> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.local_url.clone())
    }

    /// Stops accepting connections. In-flight connections finish on their own.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.cancel.cancel();
            let _ = running.task.await;
            tracing::info!(local = %running.local_url, "auth proxy stopped");
        }
    }
}

impl Drop for AuthProxy {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn accept_loop(listener: TcpListener, forwarder: Arc<Forwarder>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("auth proxy accept error: {e}");
                    continue;
                }
            },
        };

        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let svc = hyper::service::service_fn(move |req| forward(req, Arc::clone(&forwarder)));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(%peer, "auth proxy connection error: {e}");
            }
        });
    }
}

async fn forward(
    req: Request<Incoming>,
    forwarder: Arc<Forwarder>,
) -> Result<Response<ProxyBody>, Infallible> {
    let target = forwarder.target.borrow().clone();
    let Some(target) = target else {
        return Ok(error_response(
            StatusCode::BAD_GATEWAY,
            "auth proxy has no upstream target",
        ));
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    let url = upstream_url(&target, path_and_query);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            ));
        }
    };
    let headers = translate_request_headers(
        &parts.headers,
        &forwarder.key_header,
        &forwarder.auth_scheme,
        forwarder.fallback_api_key.as_deref(),
    );

    tracing::debug!(method = %parts.method, %url, "proxying request");
    let upstream = forwarder
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match upstream {
        Ok(resp) => {
            let status = resp.status();
            let headers = filter_response_headers(resp.headers());
            let stream = resp.bytes_stream().map_ok(Frame::data);
            let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        Err(e) => {
            tracing::warn!(%url, "auth proxy upstream error: {e}");
            Ok(error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream request failed: {e}"),
            ))
        }
    }
}

/// Joins the inbound path onto the target's base path.
fn upstream_url(target: &Url, path_and_query: &str) -> String {
    let mut base = target.clone();
    base.set_query(None);
    base.set_fragment(None);
    format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query)
}

/// Synthetic error in the Anthropic error shape.
fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = json!({
        "type": "error",
        "error": {"type": "proxy_upstream_error", "message": message},
    })
    .to_string();
    let body = Full::new(Bytes::from(body))
        .map_err(|never| -> reqwest::Error { match never {} })
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_joins_base_path() {
        let target = Url::parse("https://api.example.com/anthropic/").unwrap();
        assert_eq!(
            upstream_url(&target, "/v1/messages?beta=true"),
            "https://api.example.com/anthropic/v1/messages?beta=true"
        );

        let root = Url::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(upstream_url(&root, "/v1/messages"), "http://127.0.0.1:8080/v1/messages");
    }

    #[tokio::test]
    async fn start_binds_loopback_and_is_idempotent() {
        let proxy = AuthProxy::new(ProxyConfig::default());
        let target = Url::parse("http://127.0.0.1:9").unwrap();

        let first = proxy.start(target.clone()).await.unwrap();
        let second = proxy
            .start(Url::parse("http://127.0.0.1:10").unwrap())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.host_str(), Some("127.0.0.1"));
        assert_ne!(first.port(), Some(0));
        assert_eq!(proxy.target(), Some(target));

        proxy.shutdown().await;
        assert!(proxy.local_url().await.is_none());
    }

    #[tokio::test]
    async fn invalid_key_header_is_rejected() {
        let proxy = AuthProxy::new(ProxyConfig {
            key_header: "bad header".to_string(),
            ..ProxyConfig::default()
        });
        let err = proxy
            .start(Url::parse("http://127.0.0.1:9").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidKeyHeader(_)));
    }
}
