// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! HTTPS front door: picks a certificate by SNI, then forwards each request
//! to the local backend its `Host` header routes to.
//!
//! Certificate selection is a plain table lookup. There is no default
//! certificate and no wildcard matching, so a handshake for an unknown name
//! fails outright. Upgrade requests (WebSocket) are spliced through once the
//! backend answers `101 Switching Protocols`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use crate::error::privilege_hint;
use crate::routes::{host_key, Backend, RouteTable};
use crate::{Error, Result};

/// Response body handed back to hyper: streamed from the backend or built locally.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type HttpClient = Client<HttpConnector, Incoming>;

/// Default cap on concurrently served client connections.
pub const MAX_CONNECTIONS: usize = 1024;

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let body = Full::new(body.into())
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn error_response(status: StatusCode, err: &Error) -> Response<ProxyBody> {
    text_response(status, format!("{}\n", err))
}

/// Certificate selection hook: SNI name -> the route's credential, or nothing.
#[derive(Debug)]
pub struct RouteResolver {
    routes: Arc<RouteTable>,
}

impl RouteResolver {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes }
    }
}

impl ResolvesServerCert for RouteResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            debug!("refusing handshake without SNI");
            return None;
        };

        match self.routes.lookup(name) {
            Some(route) => {
                trace!(domain = name, "selected certificate");
                Some(route.credential().certified_key())
            }
            None => {
                debug!(domain = name, "refusing handshake for unrouted name");
                None
            }
        }
    }
}

/// rustls server config backed by the route table, ALPN pinned to HTTP/1.1.
pub fn tls_config(routes: Arc<RouteTable>) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS setup failed: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(RouteResolver::new(routes)));

    // Only HTTP/1.1 is forwarded; never let clients negotiate h2.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Maps a request's `Host` to the backend that should serve it.
pub trait ResolveBackend: Send + Sync + 'static {
    fn resolve_backend(&self, host: &str) -> Option<Backend>;
}

impl ResolveBackend for RouteTable {
    fn resolve_backend(&self, host: &str) -> Option<Backend> {
        self.lookup(&host_key(host)).map(|route| route.backend())
    }
}

/// Reusable forwarding unit shared by every connection.
pub struct Forwarder<R> {
    resolver: Arc<R>,
    client: HttpClient,
}

impl<R> Clone for Forwarder<R> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            client: self.client.clone(),
        }
    }
}

impl<R: ResolveBackend> Forwarder<R> {
    pub fn new(resolver: Arc<R>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { resolver, client }
    }

    /// Forward one request. Routing and backend failures become error responses.
    pub async fn forward(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let Some(host) = request_host(&req) else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header\n");
        };
        let Some(backend) = self.resolver.resolve_backend(&host) else {
            debug!(%host, "no route for request");
            return error_response(StatusCode::NOT_FOUND, &Error::NoRoute { domain: host });
        };

        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut req));

        let backend_req = match backend_request(req, backend, &host, peer, upgrade) {
            Ok(backend_req) => backend_req,
            Err(e) => {
                warn!(%host, error = %e, "could not build backend request");
                return text_response(StatusCode::BAD_REQUEST, format!("Bad request: {}\n", e));
            }
        };

        trace!(%host, %backend, uri = %backend_req.uri(), "forwarding");

        match self.client.request(backend_req).await {
            Ok(mut resp) => {
                if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                    if let Some(client_upgrade) = client_upgrade {
                        let backend_upgrade = hyper::upgrade::on(&mut resp);
                        tokio::spawn(splice_upgrade(client_upgrade, backend_upgrade, host));
                        return resp.map(|body| body.boxed());
                    }
                }
                strip_hop_by_hop(resp.headers_mut());
                resp.map(|body| body.boxed())
            }
            Err(e) => {
                warn!(%host, %backend, error = %e, "backend request failed");
                let err = Error::Backend {
                    backend: backend.to_string(),
                    reason: e.to_string(),
                };
                error_response(StatusCode::BAD_GATEWAY, &err)
            }
        }
    }
}

async fn splice_upgrade(
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
    host: String,
) {
    match tokio::try_join!(client, backend) {
        Ok((client, backend)) => {
            let mut client = TokioIo::new(client);
            let mut backend = TokioIo::new(backend);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((up, down)) => trace!(%host, up, down, "upgraded connection closed"),
                Err(e) => debug!(%host, error = %e, "upgraded connection ended"),
            }
        }
        Err(e) => debug!(%host, error = %e, "upgrade failed"),
    }
}

/// `Host` header, falling back to an absolute-form request target.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

/// The protocol requested by `Connection: upgrade` + `Upgrade: <proto>`.
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Rewrite a client request for `backend`, keeping the original `Host`.
fn backend_request<B>(
    req: Request<B>,
    backend: Backend,
    host: &str,
    peer: SocketAddr,
    upgrade: Option<HeaderValue>,
) -> std::result::Result<Request<B>, http::Error> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = format!("http://{}{}", backend.authority(), path).parse()?;

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);
    if let Some(protocol) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol);
    }

    let host_value = HeaderValue::from_str(host)?;
    headers.insert(HOST, host_value.clone());
    headers.insert(X_FORWARDED_HOST, host_value);
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, peer.ip()),
        None => peer.ip().to_string(),
    };
    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);

    Ok(Request::from_parts(parts, body))
}

fn bind_error(addr: SocketAddr, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::Privilege {
            operation: format!("Listening on {}", addr),
            hint: format!("Ports below 1024 need elevated privileges. {}", privilege_hint()),
        }
    } else {
        Error::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
    }
}

/// TLS listener routing by SNI and `Host` through one [`RouteTable`].
///
/// At most `max_connections` client connections are served at once. A
/// connection accepted beyond that is closed before the TLS handshake.
pub struct ProxyServer {
    routes: Arc<RouteTable>,
    addr: SocketAddr,
    max_connections: usize,
}

impl ProxyServer {
    pub fn new(routes: Arc<RouteTable>, addr: SocketAddr) -> Self {
        Self {
            routes,
            addr,
            max_connections: MAX_CONNECTIONS,
        }
    }

    /// Override the connection cap. Zero is treated as one.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Bind the listener and start accepting in the background.
    pub async fn start(self) -> Result<ProxyHandle> {
        let acceptor = TlsAcceptor::from(Arc::new(tls_config(Arc::clone(&self.routes))?));
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| bind_error(self.addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| bind_error(self.addr, e))?;

        let forwarder = Forwarder::new(self.routes);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        info!(
            addr = %local_addr,
            max_connections = self.max_connections,
            "HTTPS proxy listening"
        );
        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            forwarder,
            self.max_connections,
            shutdown_rx,
        ));

        Ok(ProxyHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Control handle for a running [`ProxyServer`]. Dropping it also stops accepting.
#[derive(Debug)]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener. Connections already accepted run to completion.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
    }
}

async fn accept_loop<R: ResolveBackend>(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    forwarder: Forwarder<R>,
    max_connections: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let connection_semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("HTTPS proxy stopped accepting");
                return;
            }

            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let permit = match Arc::clone(&connection_semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(%peer, max_connections, "connection limit reached, dropping connection");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let forwarder = forwarder.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    serve_connection(stream, peer, acceptor, forwarder).await;
                });
            }
        }
    }
}

async fn serve_connection<R: ResolveBackend>(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    forwarder: Forwarder<R>,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let svc = service_fn(move |req| {
        let forwarder = forwarder.clone();
        async move { Ok::<_, Infallible>(forwarder.forward(req, peer).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), svc)
        .with_upgrades()
        .await
    {
        debug!(%peer, error = %e, "connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.7:51000".parse().expect("valid address")
    }

    #[test]
    fn test_backend_request_rewrites_target() {
        let req = Request::builder()
            .uri("/v1/items?page=2")
            .header(HOST, "api.blast")
            .body(())
            .expect("request should build");
        let backend = Backend::parse("3000").expect("valid port");

        let out = backend_request(req, backend, "api.blast", peer(), None)
            .expect("rewrite should succeed");

        assert_eq!(out.uri().to_string(), "http://localhost:3000/v1/items?page=2");
        assert_eq!(out.headers()[HOST], "api.blast");
        assert_eq!(out.headers()["x-forwarded-host"], "api.blast");
        assert_eq!(out.headers()["x-forwarded-proto"], "https");
        assert_eq!(out.headers()["x-forwarded-for"], "192.0.2.7");
    }

    #[test]
    fn test_backend_request_overrides_spoofed_forwarding_headers() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "api.blast:443")
            .header("x-forwarded-proto", "http")
            .header("x-forwarded-host", "evil.example")
            .header("x-forwarded-for", "10.0.0.1")
            .body(())
            .expect("request should build");
        let backend = Backend::parse("8080").expect("valid port");

        let out = backend_request(req, backend, "api.blast:443", peer(), None)
            .expect("rewrite should succeed");

        assert_eq!(out.headers()["x-forwarded-host"], "api.blast:443");
        assert_eq!(out.headers()["x-forwarded-proto"], "https");
        assert_eq!(out.headers()["x-forwarded-for"], "10.0.0.1, 192.0.2.7");
    }

    #[test]
    fn test_backend_request_strips_hop_by_hop() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "api.blast")
            .header(CONNECTION, "keep-alive, x-session-hop")
            .header("keep-alive", "timeout=5")
            .header("x-session-hop", "1")
            .header("te", "trailers")
            .header("x-app", "kept")
            .body(())
            .expect("request should build");
        let backend = Backend::parse("3000").expect("valid port");

        let out = backend_request(req, backend, "api.blast", peer(), None)
            .expect("rewrite should succeed");

        assert!(out.headers().get(CONNECTION).is_none());
        assert!(out.headers().get("keep-alive").is_none());
        assert!(out.headers().get("x-session-hop").is_none());
        assert!(out.headers().get("te").is_none());
        assert_eq!(out.headers()["x-app"], "kept");
    }

    #[test]
    fn test_backend_request_keeps_upgrade() {
        let req = Request::builder()
            .uri("/ws")
            .header(HOST, "api.blast")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .expect("request should build");
        let upgrade = upgrade_protocol(req.headers());
        assert_eq!(upgrade.as_ref().map(|v| v.as_bytes()), Some(&b"websocket"[..]));

        let backend = Backend::parse("3000").expect("valid port");
        let out = backend_request(req, backend, "api.blast", peer(), upgrade)
            .expect("rewrite should succeed");

        assert_eq!(out.headers()[CONNECTION], "upgrade");
        assert_eq!(out.headers()[UPGRADE], "websocket");
        assert!(out.headers().get("sec-websocket-key").is_some());
    }

    #[test]
    fn test_upgrade_protocol_requires_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(upgrade_protocol(&headers).is_some());

        headers.remove(UPGRADE);
        assert!(upgrade_protocol(&headers).is_none());
    }

    #[test]
    fn test_request_host_falls_back_to_authority() {
        let req = Request::builder()
            .uri("https://web.blast/path")
            .body(())
            .expect("request should build");
        assert_eq!(request_host(&req).as_deref(), Some("web.blast"));

        let req = Request::builder()
            .uri("/path")
            .body(())
            .expect("request should build");
        assert!(request_host(&req).is_none());
    }

    #[test]
    fn test_bind_error_classification() {
        let addr: SocketAddr = "0.0.0.0:443".parse().expect("valid address");
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(bind_error(addr, denied), Error::Privilege { .. }));

        let in_use = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        assert!(matches!(bind_error(addr, in_use), Error::BindFailed { .. }));
    }

    #[test]
    fn test_error_response() {
        let err = Error::NoRoute {
            domain: "x.blast".into(),
        };
        let resp = error_response(StatusCode::NOT_FOUND, &err);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[hyper::header::CONTENT_TYPE], "text/plain; charset=utf-8");
    }
}
