//! JSON status API for the dashboard frontend

use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::lifecycle::ProxyController;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

#[derive(Clone)]
struct ApiState {
    monitor: Arc<HealthMonitor>,
    proxy: Arc<ProxyController>,
}

/// Status API server
pub struct AdminServer {
    listener: TcpListener,
    state: ApiState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        addr: &str,
        monitor: Arc<HealthMonitor>,
        proxy: Arc<ProxyController>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;

        Ok(Self {
            listener,
            state: ApiState { monitor, proxy },
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Status API listening");
        }
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { Ok::<_, hyper::Error>(handle_request(req, &state).await) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Status API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept status API connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Status API shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Serialize)]
struct ProxyUrl<'a> {
    slug: &'a str,
    url: String,
}

async fn handle_request(req: Request<Incoming>, state: &ApiState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Status API request");

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => response(StatusCode::OK, "ok"),

        (&Method::GET, ["version"]) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, ["api", "health"]) => {
            let all: BTreeMap<_, _> = state.monitor.get_all_health().into_iter().collect();
            json_response(StatusCode::OK, &all)
        }

        (&Method::GET, ["api", "health", slug]) => match state.monitor.get_health(slug) {
            Some(health) => json_response(StatusCode::OK, &health),
            None => response(StatusCode::NOT_FOUND, "unknown app"),
        },

        (&Method::POST, ["api", "health", slug, "check"]) => {
            match state.monitor.check_now(slug).await {
                Some(health) => json_response(StatusCode::OK, &health),
                None => response(StatusCode::NOT_FOUND, "unknown app"),
            }
        }

        (&Method::GET, ["api", "proxy"]) => json_response(StatusCode::OK, &state.proxy.status()),

        (&Method::GET, ["api", "proxy", slug]) => {
            let url = state.proxy.proxy_url(slug);
            if url.is_empty() {
                response(StatusCode::NOT_FOUND, "not proxied")
            } else {
                json_response(StatusCode::OK, &ProxyUrl { slug: *slug, url })
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
