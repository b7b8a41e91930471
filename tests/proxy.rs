use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{
    rustls::{self, crypto::ring, pki_types::ServerName, RootCertStore},
    TlsConnector,
};
use vmitm::{
    ca::{Authority, RootCa},
    http::{Body, Handler, Intercept, Outcome, ProxyOptions, Server, ServerHandle, Session},
    rewrite::{RewriteHandler, Rewrites},
};

fn authority() -> Arc<Authority> {
    let root = RootCa::create("vmitm Test CA", "vmitm", Duration::from_secs(3600)).unwrap();
    Arc::new(Authority::new(root, None).unwrap())
}

fn options() -> ProxyOptions {
    ProxyOptions::new("127.0.0.1:0".parse().unwrap())
}

fn start(options: ProxyOptions) -> ServerHandle {
    Server::bind(options).unwrap().start().unwrap()
}

/// Origin answering every request with `hello world`.
async fn origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    let mut response = Response::new(Full::new(Bytes::from_static(b"hello world")));
                    response
                        .headers_mut()
                        .insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
                    Ok::<_, Infallible>(response)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Origin switching every request to a ping/pong protocol. It keeps the
/// request headers it saw.
async fn upgrading_origin(seen: Arc<Mutex<Option<HeaderMap>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let seen = seen.clone();
            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    *seen.lock() = Some(req.headers().clone());
                    let upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        let mut io = TokioIo::new(upgrade.await.unwrap());
                        let mut buf = [0u8; 4];
                        io.read_exact(&mut buf).await.unwrap();
                        if &buf == b"ping" {
                            io.write_all(b"pong").await.unwrap();
                        }
                    });
                    async {
                        let response = Response::builder()
                            .status(StatusCode::SWITCHING_PROTOCOLS)
                            .header(header::CONNECTION, "upgrade")
                            .header(header::UPGRADE, "websocket")
                            .body(Full::new(Bytes::new()))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// Raw TCP server writing back whatever it reads.
async fn echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

struct Reply {
    head: String,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, request: &str) -> Reply {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Reply {
        head: read_head(stream).await,
        body: Vec::new(),
    };
    let length = reply
        .header("content-length")
        .map(|value| value.parse::<usize>().unwrap())
        .unwrap_or(0);
    reply.body = vec![0u8; length];
    stream.read_exact(&mut reply.body).await.unwrap();
    reply
}

/// Answers every request itself and remembers the URLs it saw.
#[derive(Clone, Default)]
struct Recording {
    urls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Handler for Recording {
    async fn handle_request(&self, session: &mut Session) -> Outcome<Intercept> {
        self.urls.lock().push(session.url());
        let response = session.new_response(StatusCode::OK, full("intercepted"));
        Outcome::Replaced(Intercept::Response(response))
    }
}

fn full(text: &'static str) -> Body {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

#[tokio::test]
async fn forwards_and_rewrites_plain_http() {
    let origin = origin().await;
    let rules = r"^http://127\.0\.0\.1:\d+/greet url response-body world there";
    let rewrites = Arc::new(Rewrites::load(rules).unwrap());
    let proxy = start(options().with_handler(RewriteHandler::new(rewrites)));

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let reply = exchange(
        &mut stream,
        &format!("GET http://{origin}/greet HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 200"), "{}", reply.head);
    assert_eq!(reply.body, b"hello there");
    assert_eq!(reply.header("connection"), Some("keep-alive"));
    assert_eq!(reply.header("keep-alive"), Some("timeout=60"));

    // Same connection, unmatched path.
    let reply = exchange(
        &mut stream,
        &format!("GET /other HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
    )
    .await;
    assert_eq!(reply.body, b"hello world");

    proxy.close().await;
}

#[tokio::test]
async fn serves_root_certificate() {
    let authority = authority();
    let proxy = start(options().with_authority(authority.clone()));

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let reply = exchange(
        &mut stream,
        "GET http://mitm.proxy/Cert.CRT HTTP/1.1\r\nHost: mitm.proxy\r\n\r\n",
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 200"), "{}", reply.head);
    assert_eq!(reply.header("content-type"), Some("application/x-x509-ca-cert"));
    assert_eq!(reply.header("connection"), Some("close"));
    assert_eq!(reply.body, authority.root_pem().as_bytes());

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let reply = exchange(
        &mut stream,
        "GET http://mitm.proxy/missing HTTP/1.1\r\nHost: mitm.proxy\r\n\r\n",
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 404"), "{}", reply.head);
    assert!(String::from_utf8_lossy(&reply.body).contains("/missing"));

    proxy.close().await;
}

#[tokio::test]
async fn intercepts_connect_tunnels() {
    let recording = Recording::default();
    let proxy = start(
        options()
            .with_authority(authority())
            .with_handler(recording.clone()),
    );

    // Trust only what the proxy serves for download.
    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let download = exchange(
        &mut stream,
        "GET http://mitm.proxy/cert.crt HTTP/1.1\r\nHost: mitm.proxy\r\n\r\n",
    )
    .await;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut download.body.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    assert_eq!(roots.len(), 1);

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection established"),
        "{head}"
    );

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from("example.com").unwrap();
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .unwrap();

    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
    let (_, cert) = x509_parser::parse_x509_certificate(&leaf).unwrap();
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok());
    assert_eq!(common_name, Some("example.com"));

    let reply = exchange(&mut tls, "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    assert!(reply.head.starts_with("HTTP/1.1 200"), "{}", reply.head);
    assert_eq!(reply.body, b"intercepted");
    assert_eq!(*recording.urls.lock(), vec!["https://example.com/".to_owned()]);

    proxy.close().await;
}

#[tokio::test]
async fn connect_requires_an_authority() {
    let proxy = start(options());
    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let reply = exchange(&mut stream, "CONNECT / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(reply.head.starts_with("HTTP/1.1 400"), "{}", reply.head);
    proxy.close().await;
}

#[tokio::test]
async fn relays_plaintext_inside_connect() {
    let origin = origin().await;
    let proxy = start(options());

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    stream
        .write_all(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    read_head(&mut stream).await;

    let reply = exchange(&mut stream, "GET /inner HTTP/1.1\r\n\r\n").await;
    assert!(reply.head.starts_with("HTTP/1.1 200"), "{}", reply.head);
    assert_eq!(reply.body, b"hello world");
    proxy.close().await;
}

#[tokio::test]
async fn relays_opaque_tunnels() {
    let echo = echo().await;
    // Neither a TLS record nor a request line, with interception configured.
    let intercepting = start(options().with_authority(authority()));
    // A TLS record with no authority to terminate it.
    let passthrough = start(options());

    let cases: [(&ServerHandle, &[u8]); 2] = [
        (&intercepting, b"SSH-2.0-vmitm\r\n"),
        (&passthrough, b"\x16\x03\x01 opaque record"),
    ];
    for (proxy, payload) in cases {
        let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
        stream
            .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");

        stream.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }

    intercepting.close().await;
    passthrough.close().await;
}

#[tokio::test]
async fn upgrades_relay_without_proxy_headers() {
    let seen = Arc::new(Mutex::new(None));
    let origin = upgrading_origin(seen.clone()).await;
    let proxy = start(options());

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let request = format!(
        "GET http://{origin}/ws HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Proxy-Connection: keep-alive\r\n\
         Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    let headers = seen.lock().clone().unwrap();
    assert!(!headers.contains_key(header::PROXY_AUTHORIZATION));
    assert!(!headers.contains_key("proxy-connection"));
    assert_eq!(headers[header::UPGRADE], "websocket");

    proxy.close().await;
}

#[tokio::test]
async fn redirects_by_rule() {
    let rules = r"^https?://example\.com/(resource2)/ url 307 https://example.com/new-$1";
    let rewrites = Arc::new(Rewrites::load(rules).unwrap());
    let proxy = start(options().with_handler(RewriteHandler::new(rewrites)));

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let reply = exchange(
        &mut stream,
        "GET http://example.com/resource2/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 307"), "{}", reply.head);
    assert_eq!(
        reply.header("location"),
        Some("https://example.com/new-resource2")
    );
    assert_eq!(reply.header("connection"), Some("close"));
    proxy.close().await;
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy = start(options());
    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let reply = exchange(
        &mut stream,
        &format!("GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\n\r\n"),
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 502"), "{}", reply.head);
    assert!(reply.header("warning").unwrap().starts_with("199 \"vmitm\""));
    assert_eq!(reply.header("connection"), Some("close"));
    proxy.close().await;
}

#[tokio::test]
async fn close_stops_accepting_but_keeps_connections() {
    let rules = r"^http://blocked\.example/ url reject";
    let rewrites = Arc::new(Rewrites::load(rules).unwrap());
    let proxy = start(options().with_handler(RewriteHandler::new(rewrites)));
    let addr = proxy.local_addr();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let reply = exchange(
        &mut stream,
        "GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n",
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 404"), "{}", reply.head);

    let mut idle = TcpStream::connect(addr).await.unwrap();
    // Give the accept loop a moment to take the second connection.
    tokio::time::sleep(Duration::from_millis(50)).await;
    proxy.close().await;

    assert!(TcpStream::connect(addr).await.is_err());

    let reply = exchange(
        &mut idle,
        "GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n",
    )
    .await;
    assert!(reply.head.starts_with("HTTP/1.1 404"), "{}", reply.head);
}
