//! Loopback HTTP control API: the boundary through which callers start and
//! stop servers, inspect status, and manage directory registrations. Thin
//! glue by design — it reads configs from the store, calls the lifecycle
//! manager, and writes the resulting active flag back to the store. Callers
//! see pass/fail booleans and running status, never raw OS error text.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::manager::LifecycleManager;
use crate::reclaim::PortReclaimer;
use crate::store::{ConfigStore, DirectoryUpdate, NewDirectory};

/// Version information for the daemon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Control API server
pub struct ControlServer<R: PortReclaimer + 'static> {
    bind_addr: SocketAddr,
    manager: Arc<LifecycleManager<R>>,
    store: Arc<ConfigStore>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl<R: PortReclaimer + 'static> ControlServer<R> {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<LifecycleManager<R>>,
        store: Arc<ConfigStore>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            store,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let store = Arc::clone(&self.store);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, manager, store, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection<S, R>(
    stream: S,
    manager: Arc<LifecycleManager<R>>,
    store: Arc<ConfigStore>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: PortReclaimer + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        let store = Arc::clone(&store);
        let token = Arc::clone(&auth_token);
        async move { handle_control_request(req, manager, store, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Split a `/dirs/...` path into the directory id and an optional action
/// segment. `/dirs/abc` -> `("abc", None)`; `/dirs/abc/start` ->
/// `("abc", Some("start"))`.
fn parse_dir_route(path: &str) -> Option<(&str, Option<&str>)> {
    let rest = path.strip_prefix("/dirs/")?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        None => Some((rest, None)),
        Some((id, action)) if !id.is_empty() && !action.is_empty() && !action.contains('/') => {
            Some((id, Some(action)))
        }
        Some(_) => None,
    }
}

async fn handle_control_request<R: PortReclaimer + 'static>(
    req: Request<hyper::body::Incoming>,
    manager: Arc<LifecycleManager<R>>,
    store: Arc<ConfigStore>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control API request");

    // Endpoints that need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized control API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let result = match (&method, path.as_str()) {
        // List every registered directory with its live running state
        (&Method::GET, "/dirs") => {
            let dirs: Vec<serde_json::Value> = store
                .all()
                .into_iter()
                .map(|d| {
                    let running = manager.status(&d.id);
                    serde_json::json!({
                        "id": d.id,
                        "name": d.name,
                        "path": d.path,
                        "port": d.port,
                        "proxyRules": d.proxy_rules,
                        "isActive": d.is_active,
                        "running": running,
                    })
                })
                .collect();
            let body = serde_json::json!({ "dirs": dirs, "count": dirs.len() });
            json_response(StatusCode::OK, body.to_string())
        }

        // Register a new directory
        (&Method::POST, "/dirs") => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<NewDirectory>(&body) {
                Ok(new) => match store.add(new) {
                    Ok(config) => json_response(
                        StatusCode::CREATED,
                        serde_json::to_string(&config).unwrap_or_default(),
                    ),
                    Err(e) => {
                        error!(error = %e, "Failed to persist new directory");
                        response(StatusCode::INTERNAL_SERVER_ERROR, "store error")
                    }
                },
                Err(e) => response(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)),
            }
        }

        _ => match parse_dir_route(&path) {
            Some((id, None)) => {
                let id = id.to_string();
                handle_dir_request(&method, &id, req, manager, store).await?
            }
            Some((id, Some(action))) => {
                let id = id.to_string();
                let action = action.to_string();
                handle_dir_action(&method, &id, &action, manager, store).await
            }
            None => response(StatusCode::NOT_FOUND, "not found"),
        },
    };

    Ok(result)
}

/// `/dirs/{id}` without an action: fetch, update, or remove the config
async fn handle_dir_request<R: PortReclaimer + 'static>(
    method: &Method,
    id: &str,
    req: Request<hyper::body::Incoming>,
    manager: Arc<LifecycleManager<R>>,
    store: Arc<ConfigStore>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let result = match *method {
        Method::GET => match store.get(id) {
            Some(config) => json_response(
                StatusCode::OK,
                serde_json::to_string(&config).unwrap_or_default(),
            ),
            None => response(StatusCode::NOT_FOUND, "unknown directory"),
        },

        Method::PUT => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<DirectoryUpdate>(&body) {
                Ok(update) => match store.update(id, update) {
                    Ok(config) => json_response(
                        StatusCode::OK,
                        serde_json::to_string(&config).unwrap_or_default(),
                    ),
                    Err(e) => {
                        debug!(id, error = %e, "Directory update failed");
                        response(StatusCode::NOT_FOUND, "unknown directory")
                    }
                },
                Err(e) => response(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)),
            }
        }

        Method::DELETE => {
            if manager.status(id) {
                // Removing the config of a running server would orphan it
                response(
                    StatusCode::CONFLICT,
                    "directory is running, stop it before removing",
                )
            } else {
                match store.remove(id) {
                    Ok(()) => response(StatusCode::OK, "removed"),
                    Err(_) => response(StatusCode::NOT_FOUND, "unknown directory"),
                }
            }
        }

        _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };

    Ok(result)
}

/// `/dirs/{id}/{action}`: start, stop, or status
async fn handle_dir_action<R: PortReclaimer + 'static>(
    method: &Method,
    id: &str,
    action: &str,
    manager: Arc<LifecycleManager<R>>,
    store: Arc<ConfigStore>,
) -> Response<Full<Bytes>> {
    match (method, action) {
        (&Method::GET, "status") => {
            let running = manager.status(id);
            json_response(
                StatusCode::OK,
                serde_json::json!({ "id": id, "running": running }).to_string(),
            )
        }

        (&Method::POST, "start") => {
            let Some(config) = store.get(id) else {
                debug!(id, "Start requested for unknown directory");
                return response(StatusCode::NOT_FOUND, "unknown directory");
            };

            let started = manager.start(&config).await;
            if started {
                if let Err(e) = store.set_active_flag(id, true) {
                    warn!(id, error = %e, "Failed to record active flag");
                }
            }
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "id": id,
                    "started": started,
                    "running": manager.status(id),
                })
                .to_string(),
            )
        }

        (&Method::POST, "stop") => {
            // Not running means nothing to do; the flag still gets cleared
            // so a stale active mark cannot survive
            let stopped = if manager.status(id) {
                manager.stop(id).await
            } else {
                debug!(id, "Stop requested but server was not running");
                true
            };
            if let Err(e) = store.set_active_flag(id, false) {
                debug!(id, error = %e, "Failed to clear active flag");
            }
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "id": id,
                    "stopped": stopped,
                    "running": manager.status(id),
                })
                .to_string(),
            )
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
