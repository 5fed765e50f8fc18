//! Reverse proxy for dashboard applications
//!
//! Requests are matched to an app by path prefix or subdomain and forwarded
//! over plain HTTP/1.1. The route table is swapped atomically; a request in
//! flight keeps the snapshot it started with.

use crate::acme::{AcmeManager, AcmeSettings, Http01Challenges, Http01Responder};
use crate::config::{AcmeChallengeType, RoutingMode, ServerConfig, TlsKind, TlsMode};
use crate::error::{json_error_response, BoxError, Error, ProxyBody, ProxyErrorCode, Result};
use crate::gateway::GatewayWriter;
use crate::routing::{resolver_for, ExternalBase, Route, RouteTable, SharedRouteTable, SlugResolver};
use crate::tls::{self, CertStore, CertWatcher, ACME_TLS_ALPN_NAME};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest backend response head accepted for an upgrade
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Proxy listener plus the state its request path reads
pub struct ProxyRouter {
    server: ServerConfig,
    routes: Arc<SharedRouteTable>,
    resolver: Arc<dyn SlugResolver>,
    gateway: Option<GatewayWriter>,
    external: ExternalBase,
    tls_kind: TlsKind,
    client: Client<HttpConnector, Incoming>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cert_watcher: Mutex<Option<CertWatcher>>,
    /// Serializes table writers so the gateway file follows the last store
    write_lock: Mutex<()>,
}

impl ProxyRouter {
    /// Create a router; configuration is validated by [`ProxyRouter::start`]
    pub fn new(server: ServerConfig, routes: RouteTable) -> Self {
        let tls_kind = server.tls.mode().map(|m| m.kind()).unwrap_or(TlsKind::None);
        let external = ExternalBase::from_server(&server, tls_kind != TlsKind::None);
        let (shutdown_tx, _) = watch::channel(false);

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self {
            resolver: resolver_for(&server),
            gateway: GatewayWriter::from_server(&server),
            routes: Arc::new(SharedRouteTable::new(routes)),
            external,
            tls_kind,
            client,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cert_watcher: Mutex::new(None),
            write_lock: Mutex::new(()),
            server,
        }
    }

    /// Validate TLS, bind the listener and start serving.
    ///
    /// Configuration problems are returned before anything is bound.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            warn!("Proxy router already running");
            return Ok(());
        }

        let mode = self.server.validate()?;
        let tls = &self.server.tls;
        if matches!(mode, TlsMode::Acme { .. })
            && tls.challenge == AcmeChallengeType::Http01
            && tls.http_listen.is_none()
        {
            return Err(Error::Config(
                "server.tls: challenge = \"http-01\" requires 'http_listen'".to_string(),
            ));
        }

        let store = Arc::new(CertStore::new());
        let mut acme = None;
        let acceptor = match &mode {
            TlsMode::None => None,
            TlsMode::Static { cert, key } => {
                store.set_current(tls::load_certified_key(cert, key)?);
                Some(tls::acceptor(Arc::clone(&store), false)?)
            }
            TlsMode::Acme { domain, email } => {
                let settings = AcmeSettings {
                    domains: self.acme_domains(domain),
                    email: email.clone(),
                    directory_url: tls.directory_url.clone(),
                    cache_dir: tls.cache_dir.clone().into(),
                    challenge: tls.challenge,
                };
                let manager = AcmeManager::new(settings, Arc::clone(&store))
                    .map_err(|e| Error::Tls(e.to_string()))?;
                acme = Some(manager);
                Some(tls::acceptor(
                    Arc::clone(&store),
                    tls.challenge == AcmeChallengeType::TlsAlpn01,
                )?)
            }
        };

        let listener = bind(&self.server.listen).await?;
        let local_addr = listener.local_addr()?;
        let redirect_listener = match (&tls.http_listen, mode.is_tls()) {
            (Some(addr), true) => Some(bind(addr).await?),
            _ => None,
        };

        if let TlsMode::Static { cert, key } = &mode {
            let watcher = CertWatcher::spawn(cert.clone(), key.clone(), Arc::clone(&store))?;
            *self.cert_watcher.lock() = Some(watcher);
        }

        self.shutdown_tx.send_replace(false);
        *self.local_addr.lock() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        let ctx = Arc::new(RequestContext {
            routes: Arc::clone(&self.routes),
            resolver: Arc::clone(&self.resolver),
            client: self.client.clone(),
            routing: self.server.routing,
            request_timeout: self.server.request_timeout(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        });

        info!(
            addr = %local_addr,
            routing = ?self.server.routing,
            tls = ?mode.kind(),
            routes = self.routes.load().len(),
            "Proxy router listening"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(accept_loop(
            listener,
            ctx,
            acceptor,
            self.shutdown_tx.subscribe(),
            self.server.drain_timeout(),
            Arc::clone(&self.running),
        )));

        let challenges = match acme {
            Some(manager) => {
                let challenges = manager.http01_challenges();
                let shutdown_rx = self.shutdown_tx.subscribe();
                tasks.push(tokio::spawn(async move { manager.run(shutdown_rx).await }));
                challenges
            }
            None => Http01Challenges::new(),
        };

        if let Some(listener) = redirect_listener {
            if let Ok(addr) = listener.local_addr() {
                info!(addr = %addr, "HTTP challenge and redirect listener started");
            }
            let responder = Http01Responder::new(listener, challenges, local_addr.port());
            tasks.push(tokio::spawn(responder.run(self.shutdown_tx.subscribe())));
        }
        drop(tasks);

        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.write(&self.routes.load()) {
                error!(error = %e, "Failed to write gateway config");
            }
        }

        Ok(())
    }

    /// Whether the accept loop is live
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound listener address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn tls_kind(&self) -> TlsKind {
        self.tls_kind
    }

    /// External URL for an enabled app, or an empty string
    pub fn get_proxy_url(&self, slug: &str) -> String {
        match self.routes.load().enabled(slug) {
            Some(_) => self.external.url_for(slug),
            None => String::new(),
        }
    }

    /// Current route table snapshot
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load()
    }

    /// Swap in a new route table and re-render the gateway file.
    ///
    /// A gateway write failure is returned after the swap took effect.
    pub fn replace_route_table(&self, table: RouteTable) -> Result<()> {
        let _guard = self.write_lock.lock();
        let count = table.len();
        self.routes.store(table);
        info!(routes = count, "Route table replaced");

        match &self.gateway {
            Some(gateway) => gateway.write(&self.routes.load()).inspect_err(|e| {
                error!(error = %e, "Failed to write gateway config");
            }),
            None => Ok(()),
        }
    }

    /// Stop accepting, drain open connections, then abort what remains
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<AbortHandle> = tasks.iter().map(|t| t.abort_handle()).collect();

        // The accept loop enforces the drain timeout itself
        let grace = self.server.drain_timeout() + Duration::from_secs(1);
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Proxy tasks still running after drain, cancelling");
            for abort in aborts {
                abort.abort();
            }
        }

        self.cert_watcher.lock().take();
        self.running.store(false, Ordering::SeqCst);
        info!("Proxy router stopped");
    }

    /// Certificate names: the domain, plus one per app in subdomain mode
    fn acme_domains(&self, domain: &str) -> Vec<String> {
        let mut domains = vec![domain.to_string()];
        if self.server.routing == RoutingMode::Subdomain {
            domains.extend(
                self.routes
                    .load()
                    .sorted()
                    .into_iter()
                    .filter(|r| r.enabled)
                    .map(|r| format!("{}.{}", r.slug, domain)),
            );
        }
        domains
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| Error::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<RequestContext>,
    acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        let acceptor = acceptor.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(serve_stream(stream, addr, ctx, acceptor, shutdown_rx));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy router shutting down");
                    break;
                }
            }
        }
    }

    drop(listener);

    if !connections.is_empty() {
        debug!(open = connections.len(), "Draining connections");
        let drained = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                open = connections.len(),
                drain_secs = drain_timeout.as_secs(),
                "Connections still open after drain timeout, closing"
            );
            connections.abort_all();
        }
    }

    running.store(false, Ordering::SeqCst);
}

async fn serve_stream(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<RequestContext>,
    acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let Some(acceptor) = acceptor else {
        serve_connection(stream, addr, ctx, false, shutdown_rx).await;
        return;
    };

    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
                debug!(addr = %addr, "ACME TLS-ALPN-01 validation handshake");
                return;
            }
            serve_connection(tls_stream, addr, ctx, true, shutdown_rx).await;
        }
        Err(e) => {
            debug!(addr = %addr, error = %e, "TLS handshake failed");
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<RequestContext>,
    is_tls: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, hyper::Error>(ctx.handle(req, addr, is_tls).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(addr = %addr, error = %e, "Connection error");
            }
            return;
        }
        _ = shutdown_signal(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
        }
    }

    if let Err(e) = conn.await {
        debug!(addr = %addr, error = %e, "Connection error during shutdown");
    }
}

/// Resolves once shutdown is signalled or the sender is gone
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Everything the request path needs, shared by all connections
struct RequestContext {
    routes: Arc<SharedRouteTable>,
    resolver: Arc<dyn SlugResolver>,
    client: Client<HttpConnector, Incoming>,
    routing: RoutingMode,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl RequestContext {
    async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ProxyBody> {
        let host = request_host(&req);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let resolved = match self.resolver.resolve(host.as_deref(), &path_and_query) {
            Some(resolved) => resolved,
            None if host.is_none() && self.routing == RoutingMode::Subdomain => {
                return json_error_response(
                    ProxyErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                );
            }
            None => {
                return json_error_response(ProxyErrorCode::UnknownApp, "No application matches this request");
            }
        };

        let table = self.routes.load();
        let route = match table.get(&resolved.slug) {
            Some(route) if route.enabled => route,
            Some(_) => {
                return json_error_response(
                    ProxyErrorCode::AppDisabled,
                    "Proxying is disabled for this application",
                );
            }
            None => {
                return json_error_response(ProxyErrorCode::UnknownApp, "No application matches this request");
            }
        };

        let upstream = match route.upstream_uri(&resolved.forward_path) {
            Ok(uri) => uri,
            Err(e) => {
                error!(slug = %route.slug, error = %e, "Failed to build upstream URI");
                return json_error_response(ProxyErrorCode::InternalError, "Invalid upstream address");
            }
        };

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let upgrade = is_upgrade_request(&req);
        let headers = req.headers_mut();
        strip_hop_by_hop(headers, upgrade);
        if upgrade {
            headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("upgrade"));
        }

        // X-Forwarded-* are overwritten, this proxy is the first trusted hop
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(value) = host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        match HeaderValue::from_str(route.authority()) {
            Ok(value) => {
                headers.insert(hyper::header::HOST, value);
            }
            Err(e) => {
                error!(slug = %route.slug, error = %e, "Invalid backend authority");
                return json_error_response(ProxyErrorCode::InternalError, "Invalid upstream address");
            }
        }

        debug!(
            slug = %route.slug,
            method = %req.method(),
            uri = %upstream,
            request_id,
            "Forwarding request"
        );

        *req.uri_mut() = upstream;
        *req.version_mut() = Version::HTTP_11;

        if upgrade {
            return self.tunnel(req, route.clone(), request_id).await;
        }

        let deadline = tokio::time::Instant::now() + self.request_timeout;
        match tokio::time::timeout_at(deadline, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers, false);
                let body = DeadlineBody::new(body.boxed(), deadline, self.request_timeout);
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                warn!(slug = %route.slug, target = %route.target, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    slug = %route.slug,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }

    /// Replay an upgrade request on a raw backend connection and splice
    /// the two connections once both sides switch protocols
    async fn tunnel(
        &self,
        req: Request<Incoming>,
        route: Route,
        request_id: String,
    ) -> Response<ProxyBody> {
        let raw_request = build_upgrade_request(&req);

        let handshake = async {
            let mut backend = TcpStream::connect(route.authority()).await?;
            backend.write_all(&raw_request).await?;
            let (head, rest) = read_response_head(&mut backend).await?;
            Ok::<_, std::io::Error>((backend, head, rest))
        };

        let (backend, head, rest) = match tokio::time::timeout(self.request_timeout, handshake).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                warn!(slug = %route.slug, error = %e, "Upgrade handshake with backend failed");
                return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
            }
            Err(_) => {
                warn!(slug = %route.slug, "Upgrade handshake timed out");
                return json_error_response(ProxyErrorCode::RequestTimeout, "Upgrade timed out");
            }
        };

        let Some((status, response_headers)) = parse_response_head(&head) else {
            warn!(slug = %route.slug, "Invalid upgrade response from backend");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from backend",
            );
        };

        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response = response.header(name, value);
            }
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(slug = %route.slug, status = %status, "Backend declined upgrade");
            return response;
        }

        info!(slug = %route.slug, request_id, "Upgrade accepted, tunnelling");

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    tokio::select! {
                        _ = splice(upgraded, backend, rest, &route.slug) => {}
                        _ = shutdown_signal(&mut shutdown_rx) => {
                            debug!(slug = %route.slug, "Closing tunnel on shutdown");
                        }
                    }
                }
                Err(e) => {
                    warn!(slug = %route.slug, error = %e, "Client upgrade failed");
                }
            }
        });

        response
    }
}

/// Host from the Host header, or the URI authority for HTTP/2
fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

#[derive(Debug, thiserror::Error)]
#[error("backend response not complete within {} seconds", .0.as_secs())]
struct BodyTimeout(Duration);

/// Response body that fails once the request deadline passes, so a backend
/// that stalls mid-body cannot hold the connection open
struct DeadlineBody {
    inner: BoxBody<Bytes, hyper::Error>,
    sleep: Pin<Box<tokio::time::Sleep>>,
    timeout: Duration,
}

impl DeadlineBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, deadline: tokio::time::Instant, timeout: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            timeout,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|r| r.map_err(BoxError::from)));
        }
        match this.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Some(Err(BodyTimeout(this.timeout).into()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
/// `Upgrade` survives when `keep_upgrade` is set.
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        if keep_upgrade && name == hyper::header::UPGRADE {
            continue;
        }
        headers.remove(&name);
    }

    for name in HOP_BY_HOP {
        if keep_upgrade && *name == "upgrade" {
            continue;
        }
        headers.remove(*name);
    }
}

fn build_upgrade_request(req: &Request<Incoming>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read up to the end of the response head; returns the head and any
/// bytes the backend sent after it
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Parse `HTTP/1.1 101 Switching Protocols` plus headers
fn parse_response_head(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

async fn splice(client: Upgraded, mut backend: TcpStream, early: Vec<u8>, slug: &str) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(slug, error = %e, "Failed to relay early backend bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(slug, to_backend, to_client, "Tunnel closed");
        }
        Err(e) => {
            debug!(slug, error = %e, "Tunnel closed with error");
        }
    }
}
