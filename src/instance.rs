//! A single running static-file server: one listener, one root directory,
//! the compiled proxy chain applied ahead of static resolution.
//!
//! The instance communicates lifecycle through explicit signals: `bind`
//! returns once the listener is up, a shutdown watch channel asks the accept
//! loop to stop, and a closed watch channel reports that the loop has exited
//! and the port is released. Nobody polls library internals.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DirectoryConfig;
use crate::error::{json_error_response, ServeErrorCode};
use crate::rules::RuleChain;

/// Default document served for directory requests and as the fallback for
/// paths that resolve to nothing (single-page-app routing).
const INDEX_FILE: &str = "index.html";

/// Handle to a running instance. Cheap to clone; all clones address the same
/// underlying server.
#[derive(Clone)]
pub struct InstanceHandle {
    port: u16,
    token: Uuid,
    shutdown_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl InstanceHandle {
    pub(crate) fn from_parts(
        port: u16,
        shutdown_tx: watch::Sender<bool>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            port,
            token: Uuid::new_v4(),
            shutdown_tx,
            closed_rx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Unique per-instance token; distinguishes generations of the same id
    /// (a restart is stop-then-start, producing a new token).
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Ask the accept loop to stop. Returns immediately.
    pub fn begin_close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether a close has been requested on this instance
    pub fn close_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait until the accept loop has exited, bounded by `timeout`.
    /// Returns true if the instance reported closed in time.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.closed_rx.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|closed| *closed)).await {
            Ok(Ok(_)) => true,
            // Sender dropped: the accept task is gone, which is as closed
            // as it gets
            Ok(Err(_)) => true,
            Err(_) => false,
        };
        result
    }

    /// Begin shutdown and wait for completion, bounded by `timeout`
    pub async fn close(&self, timeout: Duration) -> bool {
        self.begin_close();
        self.wait_closed(timeout).await
    }

    /// Resolve once the accept loop has exited, however that happened
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Bind a new instance on `config.port` serving `config.path`.
///
/// Returns once the listener reports listening, bounded by `bind_wait`.
/// Failure leaves nothing behind: no listener, no background task.
pub async fn bind(
    config: &DirectoryConfig,
    chain: Arc<RuleChain>,
    bind_wait: Duration,
) -> anyhow::Result<InstanceHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::time::timeout(bind_wait, TcpListener::bind(addr))
        .await
        .map_err(|_| anyhow::anyhow!("timed out binding port {}", config.port))??;

    info!(id = %config.id, port = config.port, root = %config.path, "Static server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (closed_tx, closed_rx) = watch::channel(false);
    let handle = InstanceHandle::from_parts(config.port, shutdown_tx, closed_rx);

    let root = Arc::new(PathBuf::from(&config.path));
    let id = config.id.clone();
    tokio::spawn(async move {
        run_accept_loop(listener, root, chain, shutdown_rx, &id).await;
        closed_tx.send_replace(true);
    });

    Ok(handle)
}

async fn run_accept_loop(
    listener: TcpListener,
    root: Arc<PathBuf>,
    chain: Arc<RuleChain>,
    mut shutdown_rx: watch::Receiver<bool>,
    id: &str,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let root = Arc::clone(&root);
                        let chain = Arc::clone(&chain);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, root, chain).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(id, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(id, "Static server shutting down");
                    break;
                }
            }
        }
    }
    // Listener drops here; the port is released before closed is signaled
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    root: Arc<PathBuf>,
    chain: Arc<RuleChain>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let root = Arc::clone(&root);
        let chain = Arc::clone(&chain);
        async move { handle_request(req, root, chain).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    root: Arc<PathBuf>,
    chain: Arc<RuleChain>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    // Proxy chain first, static fallback after
    if let Some(rule) = chain.matching(&path) {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();

        return match rule
            .forward(parts.method, &path_and_query, &parts.headers, body)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) if e.is_timeout() => {
                warn!(prefix = rule.path_prefix(), upstream = rule.origin(), "Upstream timed out");
                Ok(json_error_response(
                    ServeErrorCode::UpstreamTimeout,
                    "Upstream did not respond in time",
                ))
            }
            Err(e) => {
                // Log detail internally, return a generic message externally
                warn!(prefix = rule.path_prefix(), upstream = rule.origin(), error = %e, "Upstream request failed");
                Ok(json_error_response(
                    ServeErrorCode::UpstreamConnectFailed,
                    "Failed to reach upstream",
                ))
            }
        };
    }

    serve_static(req.method(), &path, &root).await
}

async fn serve_static(
    method: &Method,
    path: &str,
    root: &Path,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(json_error_response(
            ServeErrorCode::MethodNotAllowed,
            "Static paths accept GET and HEAD only",
        ));
    }

    let rel = match sanitize_request_path(path) {
        Some(rel) => rel,
        None => {
            warn!(path, "Rejected request path escaping the served root");
            return Ok(json_error_response(
                ServeErrorCode::ForbiddenPath,
                "Path is outside the served directory",
            ));
        }
    };

    let mut file_path = root.join(&rel);
    match tokio::fs::metadata(&file_path).await {
        Ok(meta) if meta.is_dir() => file_path.push(INDEX_FILE),
        Ok(_) => {}
        Err(_) => {
            // Missing path: fall back to the root index document so
            // client-side routes resolve, matching dev-server conventions
            file_path = root.join(INDEX_FILE);
        }
    }

    let contents = match tokio::fs::read(&file_path).await {
        Ok(contents) => contents,
        Err(e) => {
            debug!(file = %file_path.display(), error = %e, "Static file not readable");
            return Ok(json_error_response(
                ServeErrorCode::NotFound,
                format!("No such file: {}", path),
            ));
        }
    };

    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    let length = contents.len();
    let body = if method == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(contents)
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, mime.as_ref())
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .expect("valid response with static file parts");

    if method == Method::HEAD {
        if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_LENGTH, value);
        }
    }

    Ok(response)
}

/// Reduce a request path to a safe, root-relative path. Rejects anything
/// containing parent-directory components; callers treat None as forbidden.
fn sanitize_request_path(path: &str) -> Option<PathBuf> {
    let rel = path.trim_start_matches('/');
    let mut clean = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}
