//! End-to-end routing: TLS client -> ProxyServer -> plain HTTP backend.
//!
//! Everything binds to 127.0.0.1:0, so these run without privileges and
//! without touching the hosts file or the system trust store.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blast::{full_domain, parse_cert_der, Paths, ProxyHandle, ProxyServer, RootAuthority, RouteTable};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

struct Fixture {
    _dir: TempDir,
    routes: Arc<RouteTable>,
    root_der: CertificateDer<'static>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("store"));
        let root = Arc::new(RootAuthority::ensure(&paths).unwrap());
        let root_der = CertificateDer::from(root.cert_der().to_vec());
        Fixture {
            _dir: dir,
            routes: Arc::new(RouteTable::new(root)),
            root_der,
        }
    }

    async fn start_proxy(&self) -> ProxyHandle {
        ProxyServer::new(Arc::clone(&self.routes), "127.0.0.1:0".parse().unwrap())
            .start()
            .await
            .unwrap()
    }

    async fn start_proxy_with_cap(&self, max_connections: usize) -> ProxyHandle {
        ProxyServer::new(Arc::clone(&self.routes), "127.0.0.1:0".parse().unwrap())
            .with_max_connections(max_connections)
            .start()
            .await
            .unwrap()
    }

    async fn connect(&self, proxy: SocketAddr, sni: &str) -> std::io::Result<TlsStream<TcpStream>> {
        let mut roots = RootCertStore::empty();
        roots.add(self.root_der.clone()).unwrap();

        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots)
                .with_no_client_auth();

        let tcp = TcpStream::connect(proxy).await?;
        let name = ServerName::try_from(sni.to_string()).unwrap();
        TlsConnector::from(Arc::new(config)).connect(name, tcp).await
    }
}

/// Plain HTTP backend that echoes what the proxy sent it, prefixed by `tag`.
async fn spawn_echo_backend(tag: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = hyper::service::service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string()
                    };
                    let body = format!(
                        "backend={} host={} xfh={} xfp={} path={}",
                        tag,
                        header("host"),
                        header("x-forwarded-host"),
                        header("x-forwarded-proto"),
                        req.uri().path()
                    );
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn open(stream: TlsStream<TcpStream>) -> SendRequest<Empty<Bytes>> {
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender
}

async fn get(stream: TlsStream<TcpStream>, host: &str, path: &str) -> (u16, String) {
    let mut sender = open(stream).await;
    send(&mut sender, host, path).await
}

async fn send(sender: &mut SendRequest<Empty<Bytes>>, host: &str, path: &str) -> (u16, String) {
    sender.ready().await.unwrap();
    let request = Request::builder()
        .uri(path)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_request_reaches_backend_with_forwarded_headers() {
    let fixture = Fixture::new();
    let backend = spawn_echo_backend("main").await;
    let domain = full_domain("api");
    fixture.routes.add_route(&domain, &backend.to_string()).unwrap();

    let proxy = fixture.start_proxy().await;
    let stream = fixture.connect(proxy.local_addr(), "api.blast").await.unwrap();

    let (status, body) = get(stream, "api.blast", "/hello").await;
    assert_eq!(status, 200);
    assert!(body.contains("host=api.blast"), "body: {}", body);
    assert!(body.contains("xfh=api.blast"), "body: {}", body);
    assert!(body.contains("xfp=https"), "body: {}", body);
    assert!(body.contains("path=/hello"), "body: {}", body);

    proxy.stop().await;
}

#[tokio::test]
async fn test_served_certificate_matches_sni() {
    let fixture = Fixture::new();
    let backend = spawn_echo_backend("main").await;
    fixture
        .routes
        .add_route("web.blast", &backend.to_string())
        .unwrap();

    let proxy = fixture.start_proxy().await;
    let stream = fixture.connect(proxy.local_addr(), "web.blast").await.unwrap();

    let (_, session) = stream.get_ref();
    let chain = session.peer_certificates().unwrap();
    let leaf = parse_cert_der(chain[0].as_ref()).unwrap();
    assert_eq!(leaf.subject_alt_names, vec!["web.blast".to_string()]);
    assert!(!leaf.is_ca);

    proxy.stop().await;
}

#[tokio::test]
async fn test_host_header_routes_independently_of_sni() {
    let fixture = Fixture::new();
    let backend_a = spawn_echo_backend("A").await;
    let backend_b = spawn_echo_backend("B").await;
    fixture.routes.add_route("a.blast", &backend_a.to_string()).unwrap();
    fixture.routes.add_route("b.blast", &backend_b.to_string()).unwrap();

    let proxy = fixture.start_proxy().await;
    // One connection, certificate chosen for a.blast
    let stream = fixture.connect(proxy.local_addr(), "a.blast").await.unwrap();
    let mut sender = open(stream).await;

    let (status, body) = send(&mut sender, "b.blast", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("backend=B "), "body: {}", body);
    assert!(body.contains("xfh=b.blast"), "body: {}", body);

    // Port and case are not part of the routing key
    let (status, body) = send(&mut sender, "B.BLAST:443", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("backend=B "), "body: {}", body);
    assert!(body.contains("xfh=B.BLAST:443"), "body: {}", body);

    let (status, body) = send(&mut sender, "a.blast", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("backend=A "), "body: {}", body);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unknown_host_header_gets_404() {
    let fixture = Fixture::new();
    let backend = spawn_echo_backend("main").await;
    fixture
        .routes
        .add_route("api.blast", &backend.to_string())
        .unwrap();

    let proxy = fixture.start_proxy().await;
    let stream = fixture.connect(proxy.local_addr(), "api.blast").await.unwrap();

    let (status, body) = get(stream, "unknown.blast", "/").await;
    assert_eq!(status, 404);
    assert!(body.contains("unknown.blast"), "body: {}", body);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unknown_sni_fails_handshake() {
    let fixture = Fixture::new();
    let backend = spawn_echo_backend("main").await;
    fixture
        .routes
        .add_route("api.blast", &backend.to_string())
        .unwrap();

    let proxy = fixture.start_proxy().await;
    assert!(fixture
        .connect(proxy.local_addr(), "other.blast")
        .await
        .is_err());

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_backend_gets_502() {
    let fixture = Fixture::new();
    let port = closed_port().await;
    fixture.routes.add_route("down.blast", &port.to_string()).unwrap();

    let proxy = fixture.start_proxy().await;
    let stream = fixture.connect(proxy.local_addr(), "down.blast").await.unwrap();

    let (status, body) = get(stream, "down.blast", "/").await;
    assert_eq!(status, 502);
    assert!(body.contains(&format!("localhost:{}", port)), "body: {}", body);

    proxy.stop().await;
}

#[tokio::test]
async fn test_routes_change_while_running() {
    let fixture = Fixture::new();
    let backend = spawn_echo_backend("main").await;
    let proxy = fixture.start_proxy().await;

    // Nothing routed yet
    assert!(fixture
        .connect(proxy.local_addr(), "late.blast")
        .await
        .is_err());

    fixture
        .routes
        .add_route("late.blast", &backend.to_string())
        .unwrap();
    let stream = fixture.connect(proxy.local_addr(), "late.blast").await.unwrap();
    let (status, _) = get(stream, "late.blast", "/").await;
    assert_eq!(status, 200);

    fixture.routes.remove_route("late.blast");
    assert!(fixture
        .connect(proxy.local_addr(), "late.blast")
        .await
        .is_err());

    proxy.stop().await;
}

#[tokio::test]
async fn test_connections_beyond_cap_are_closed() {
    let fixture = Fixture::new();
    let backend = spawn_echo_backend("main").await;
    fixture
        .routes
        .add_route("api.blast", &backend.to_string())
        .unwrap();

    let proxy = fixture.start_proxy_with_cap(1).await;
    let held = fixture.connect(proxy.local_addr(), "api.blast").await.unwrap();

    // The only slot is taken, so the next handshake sees the socket closed
    assert!(fixture
        .connect(proxy.local_addr(), "api.blast")
        .await
        .is_err());

    // Freeing the slot lets new connections in again
    drop(held);
    let mut admitted = None;
    for _ in 0..100 {
        if let Ok(stream) = fixture.connect(proxy.local_addr(), "api.blast").await {
            admitted = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stream = admitted.expect("a connection should be admitted once the slot is free");
    let (status, _) = get(stream, "api.blast", "/").await;
    assert_eq!(status, 200);

    proxy.stop().await;
}

#[tokio::test]
async fn test_stop_closes_listener() {
    let fixture = Fixture::new();
    let proxy = fixture.start_proxy().await;
    let addr = proxy.local_addr();

    proxy.stop().await;

    assert!(TcpStream::connect(addr).await.is_err());
}
