//! Hyper server plumbing for the control API.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orchard_core::domain::ObjectId;
use orchard_store::StateStore;
use orchard_sync::Connectivity;

use crate::routes::{self, ResolveChoice};

/// Loopback-only control server.
pub struct ControlServer {
    store: StateStore,
    connectivity: Connectivity,
    port: u16,
}

impl ControlServer {
    #[must_use]
    pub fn new(store: StateStore, connectivity: Connectivity, port: u16) -> Self {
        Self {
            store,
            connectivity,
            port,
        }
    }

    /// Bind and serve until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = TcpListener::bind(addr).await?;
        info!(port = self.port, "Control API listening on loopback");

        let shared = Arc::new((self.store, self.connectivity));
        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);
            let shared = shared.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let shared = shared.clone();
                    async move { handle(&shared.0, &shared.1, req).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(error = %e, "Control connection error");
                }
            });
        }
    }
}

async fn handle(
    store: &StateStore,
    connectivity: &Connectivity,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => match routes::status(store, connectivity).await {
            Ok(report) => json_response(StatusCode::OK, &report),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (Method::GET, "/conflicts") => match routes::conflicts(store).await {
            Ok(list) => json_response(StatusCode::OK, &list),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (Method::POST, "/pause") => {
            connectivity.pause();
            json_response(StatusCode::OK, &serde_json::json!({"paused": true}))
        }
        (Method::POST, "/resume") => {
            connectivity.resume();
            json_response(StatusCode::OK, &serde_json::json!({"paused": false}))
        }
        (Method::POST, path) if path.starts_with("/resolve/") => {
            resolve_route(store, path, &query).await
        }
        (Method::POST, path) if path.starts_with("/pin/") => {
            match parse_id(path, "/pin/") {
                Some(id) => match routes::pin(store, &id).await {
                    Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"pinned": true})),
                    Err(orchard_store::StoreError::NotFound) => {
                        error_response(StatusCode::NOT_FOUND, "unknown object")
                    }
                    Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
                },
                None => error_response(StatusCode::BAD_REQUEST, "invalid object id"),
            }
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such route"),
    };
    Ok(response)
}

async fn resolve_route(
    store: &StateStore,
    path: &str,
    query: &str,
) -> Response<Full<Bytes>> {
    let Some(id) = parse_id(path, "/resolve/") else {
        return error_response(StatusCode::BAD_REQUEST, "invalid object id");
    };
    let choice = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("choice="))
        .and_then(|v| ResolveChoice::from_str(v).ok());
    let Some(choice) = choice else {
        return error_response(StatusCode::BAD_REQUEST, "choice must be local or remote");
    };
    match routes::resolve(store, &id, choice).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"resolved": true})),
        Err(orchard_store::StoreError::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "no such conflict")
        }
        Err(e) => {
            warn!(error = %e, "Conflict resolution failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn parse_id(path: &str, prefix: &str) -> Option<ObjectId> {
    ObjectId::from_str(path.strip_prefix(prefix)?).ok()
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .expect("static response construction")
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}
