//! Webhook listener for Atlas alert notifications
//!
//! Atlas POSTs each alert as JSON and signs the raw body with the shared
//! secret: `X-MMS-Signature: base64(HMAC-SHA1(secret, body))`. Requests are
//! authenticated before the body is parsed, filtered by `clusterName`, and
//! acknowledged only after the sink accepted every payload, so a slow
//! downstream makes Atlas back off and retry.

use crate::api::ApiRecord;
use crate::error::{IngestError, Result};
use crate::filter::ClusterFilter;
use crate::sink::EventSink;
use crate::types::{Origin, Surface};
use crate::validate::{ListenSource, TlsFiles};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use sha1::Sha1;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "X-MMS-Signature";

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// Time allowed for a client to finish the TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a client to send complete request headers
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for in-flight requests on stop
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type HmacSha1 = Hmac<Sha1>;

/// Lifecycle of a [`WebhookListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

struct Running {
    /// Stop accepting and drain connections gracefully
    cancel: CancellationToken,
    /// Drop connections still open after the grace period
    abort: CancellationToken,
    accept: JoinHandle<()>,
    connections: TaskTracker,
    local_addr: SocketAddr,
}

/// HTTP(S) endpoint receiving Atlas alert webhooks
pub struct WebhookListener {
    source: ListenSource,
    sink: Arc<dyn EventSink>,
    state: ListenerState,
    shutdown_grace: Duration,
    running: Option<Running>,
}

impl WebhookListener {
    pub fn new(source: ListenSource, sink: Arc<dyn EventSink>) -> Self {
        Self {
            source,
            sink,
            state: ListenerState::Stopped,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            running: None,
        }
    }

    /// How long `stop` waits for in-flight requests before dropping them
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Bound address while listening (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Bind the endpoint and begin accepting connections
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state != ListenerState::Stopped {
            return Err(IngestError::Listener(format!(
                "cannot start listener in state {:?}",
                self.state
            )));
        }
        self.state = ListenerState::Starting;

        let (listener, tls) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.state = ListenerState::Stopped;
                return Err(e);
            }
        };

        let local_addr = listener.local_addr().map_err(|e| {
            self.state = ListenerState::Stopped;
            IngestError::Bind {
                addr: self.source.endpoint.bind_addr(),
                reason: e.to_string(),
            }
        })?;

        let handler = Arc::new(WebhookHandler {
            secret: self.source.secret.clone().into_bytes(),
            filter: self.source.filter.clone(),
            sink: self.sink.clone(),
        });
        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            tls,
            handler,
            Shutdown {
                cancel: cancel.clone(),
                abort: abort.clone(),
            },
            connections.clone(),
        ));

        self.running = Some(Running {
            cancel,
            abort,
            accept,
            connections,
            local_addr,
        });
        self.state = ListenerState::Listening;

        tracing::info!(
            addr = %local_addr,
            tls = self.source.tls.is_some(),
            sink = self.sink.name(),
            "Webhook listener started"
        );
        Ok(local_addr)
    }

    /// Stop accepting, then wait for in-flight requests to finish
    ///
    /// Connections still open after the shutdown grace period (stalled
    /// handshakes, half-sent headers, slow bodies) are dropped.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        self.state = ListenerState::Stopping;

        running.cancel.cancel();
        let accept_result = running.accept.await;
        running.connections.close();
        if tokio::time::timeout(self.shutdown_grace, running.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                addr = %running.local_addr,
                open = running.connections.len(),
                "Webhook connections did not drain in time, dropping them"
            );
            running.abort.cancel();
            running.connections.wait().await;
        }

        self.state = ListenerState::Stopped;
        tracing::info!(addr = %running.local_addr, "Webhook listener stopped");

        accept_result.map_err(|e| IngestError::Listener(format!("accept task failed: {}", e)))
    }

    async fn bind(&self) -> Result<(TcpListener, Option<TlsAcceptor>)> {
        let addr = self.source.endpoint.bind_addr();

        let tls = match &self.source.tls {
            Some(files) => Some(load_tls(files).map_err(|reason| IngestError::Bind {
                addr: addr.clone(),
                reason,
            })?),
            None => None,
        };

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| IngestError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        Ok((listener, tls))
    }
}

impl Drop for WebhookListener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
            running.abort.cancel();
        }
    }
}

/// Compute the signature Atlas sends for `body`
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|e| IngestError::Authentication(format!("unusable secret: {}", e)))?;
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Check `signature` against the body in constant time
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<()> {
    let expected = BASE64
        .decode(signature.trim())
        .map_err(|_| IngestError::Authentication("signature is not valid base64".into()))?;

    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|e| IngestError::Authentication(format!("unusable secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| IngestError::Authentication("signature mismatch".into()))
}

fn load_tls(files: &TlsFiles) -> std::result::Result<TlsAcceptor, String> {
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    let certs = CertificateDer::pem_file_iter(&files.cert_file)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| format!("failed to load cert file {}: {:?}", files.cert_file.display(), e))?;
    if certs.is_empty() {
        return Err(format!(
            "cert file {} contains no certificates",
            files.cert_file.display()
        ));
    }

    let key = PrivateKeyDer::from_pem_file(&files.key_file)
        .map_err(|e| format!("failed to load key file {}: {:?}", files.key_file.display(), e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("TLS setup failed: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("invalid certificate/key pair: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[derive(Clone)]
struct Shutdown {
    cancel: CancellationToken,
    abort: CancellationToken,
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<WebhookHandler>,
    shutdown: Shutdown,
    connections: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Webhook accept error");
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let Some(acceptor) = tls else {
                serve_connection(stream, handler, shutdown).await;
                return;
            };

            let handshake = tokio::select! {
                _ = shutdown.cancel.cancelled() => return,
                result = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => result,
            };
            match handshake {
                Ok(Ok(stream)) => serve_connection(stream, handler, shutdown).await,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "TLS handshake timed out");
                }
            }
        });
    }
    // Dropping the listener closes the socket: no new connections from here
}

async fn serve_connection<S>(stream: S, handler: Arc<WebhookHandler>, shutdown: Shutdown)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc = hyper::service::service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(io, svc);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Webhook connection error");
                }
                break;
            }
            _ = shutdown.cancel.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = shutdown.abort.cancelled() => break,
        }
    }
}

struct WebhookHandler {
    secret: Vec<u8>,
    filter: ClusterFilter,
    sink: Arc<dyn EventSink>,
}

impl WebhookHandler {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.method() != Method::POST {
            return respond(StatusCode::METHOD_NOT_ALLOWED, "only POST is accepted");
        }

        let signature = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(signature) = signature else {
            tracing::warn!("Rejected webhook request without signature header");
            return respond(StatusCode::UNAUTHORIZED, "missing signature");
        };

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return respond(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read webhook body");
                return respond(StatusCode::BAD_REQUEST, "unreadable body");
            }
        };

        if let Err(e) = verify_signature(&self.secret, &body, &signature) {
            tracing::warn!(error = %e, "Rejected webhook request");
            return respond(StatusCode::UNAUTHORIZED, "signature verification failed");
        }

        let payloads = match parse_alerts(&body) {
            Ok(payloads) => payloads,
            Err(reason) => {
                tracing::warn!(reason = %reason, "Malformed webhook payload");
                return respond(StatusCode::BAD_REQUEST, "malformed payload");
            }
        };

        let mut forwarded = 0usize;
        let mut dropped = 0usize;
        for payload in payloads {
            let record = ApiRecord::from_json(payload);
            if !self.filter.matches_attribution(record.cluster.as_deref()) {
                dropped += 1;
                continue;
            }

            let project = record
                .payload
                .get("groupId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let event = record
                .into_event(Surface::Alerts, Origin::Project(project))
                .with_metadata("delivery", "webhook");

            if let Err(e) = self.sink.submit(event).await {
                tracing::error!(error = %e, "Failed to forward webhook alert");
                return respond(StatusCode::INTERNAL_SERVER_ERROR, "downstream unavailable");
            }
            forwarded += 1;
        }

        tracing::debug!(forwarded, dropped, "Webhook alerts ingested");
        respond(StatusCode::OK, "")
    }
}

/// Accept a single alert object or an array of alert objects
fn parse_alerts(body: &[u8]) -> std::result::Result<Vec<serde_json::Value>, String> {
    match serde_json::from_slice::<serde_json::Value>(body).map_err(|e| e.to_string())? {
        alert @ serde_json::Value::Object(_) => Ok(vec![alert]),
        serde_json::Value::Array(alerts) => {
            if alerts.iter().all(|a| a.is_object()) {
                Ok(alerts)
            } else {
                Err("array contains non-object entries".to_string())
            }
        }
        _ => Err("expected a JSON object or array".to_string()),
    }
}

fn respond(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}
