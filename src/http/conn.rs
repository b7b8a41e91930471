//! Per-connection protocol handling.
//!
//! A physical connection is served as a sequence of layers. Each layer runs
//! hyper's HTTP/1 server over the current stream. A successful CONNECT ends the
//! layer, and the upgraded stream is sniffed to pick the next one: decrypted
//! TLS, plaintext HTTP, or an opaque tunnel handed to the dispatcher.

use super::{
    auth::AuthCache,
    client::ClientPool,
    empty,
    error::Error,
    full,
    handler::{Intercept, Outcome},
    rewind::Rewind,
    session::{ConnInfo, Session},
    tunnel::{Io, Tunnel},
    util, Body, ProxyOptions,
};
use bytes::Bytes;
use http::{header, uri::Authority, HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::{
    body::Incoming,
    ext::ReasonPhrase,
    server::conn::http1,
    service::service_fn,
    upgrade::{OnUpgrade, Upgraded},
};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{timeout, timeout_at, Instant},
};
use tokio_rustls::{rustls, TlsAcceptor};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// Longest prefix inspected to recognise a request line.
const SNIFF_LEN: usize = 7;

/// How long to wait for the rest of the prefix after the first byte.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared by every connection of a listener.
pub(crate) struct Proxy {
    options: ProxyOptions,
    auth: Option<AuthCache>,
    clients: ClientPool,
    http: http1::Builder,
}

/// State of one physical connection.
struct Conn {
    peer: SocketAddr,
    source: OnceLock<SocketAddr>,
    trusted: AtomicBool,
}

impl Conn {
    /// Fix the source address on the first request and strip the override header.
    fn source(&self, headers: &mut HeaderMap) -> SocketAddr {
        let reported = util::take_source_address(headers);
        *self.source.get_or_init(|| reported.unwrap_or(self.peer))
    }

    fn current_source(&self) -> SocketAddr {
        self.source.get().copied().unwrap_or(self.peer)
    }
}

/// A stream about to be served, with what is known about it.
struct Stream {
    io: Box<dyn Io>,
    tls: bool,
    /// CONNECT target of the enclosing tunnel.
    authority: Option<Authority>,
}

/// One HTTP layer over a [`Stream`].
struct Layer {
    conn: Arc<Conn>,
    tls: bool,
    authority: Option<Authority>,
    pending: Mutex<Option<Pending>>,
}

/// Work left once hyper hands the stream back.
enum Pending {
    Connect {
        target: Authority,
        upgrade: OnUpgrade,
    },
    Upgrade {
        client: OnUpgrade,
        upstream: OnUpgrade,
    },
}

impl Proxy {
    pub(crate) fn new(options: ProxyOptions) -> Result<Self, rustls::Error> {
        let mut http = http1::Builder::new();
        http.timer(TokioTimer::new())
            .header_read_timeout(options.idle_timeout)
            .keep_alive(true)
            .title_case_headers(true)
            .preserve_header_case(true);

        Ok(Self {
            auth: options.authenticator.clone().map(AuthCache::new),
            clients: ClientPool::new(options.upstream_tls, options.connect_timeout)?,
            http,
            options,
        })
    }

    /// Serve a physical connection until it closes.
    pub(crate) async fn serve(self: Arc<Self>, tcp_stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = tcp_stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", err);
        }

        let ip = peer.ip().to_canonical();
        let trusted = self.auth.is_none() || ip.is_loopback() || ip.is_unspecified();
        let conn = Arc::new(Conn {
            peer,
            source: OnceLock::new(),
            trusted: AtomicBool::new(trusted),
        });

        let mut current = Some(Stream {
            io: Box::new(tcp_stream),
            tls: false,
            authority: None,
        });

        while let Some(stream) = current.take() {
            current = match self.serve_stream(&conn, stream).await {
                Ok(next) => next,
                Err(err) => {
                    tracing::debug!("connection from {} failed: {}", peer, err);
                    self.options.handler.handle_error(None, &err).await;
                    None
                }
            };
        }

        tracing::trace!("connection from {} closed", peer);
    }

    /// Run one layer. Returns the next stream to serve, if any.
    async fn serve_stream(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        stream: Stream,
    ) -> Result<Option<Stream>, Error> {
        let layer = Arc::new(Layer {
            conn: conn.clone(),
            tls: stream.tls,
            authority: stream.authority,
            pending: Mutex::new(None),
        });

        let service = {
            let proxy = self.clone();
            let layer = layer.clone();
            service_fn(move |req| {
                let proxy = proxy.clone();
                let layer = layer.clone();
                async move { proxy.handle(&layer, req).await }
            })
        };

        if let Err(err) = self
            .http
            .serve_connection(TokioIo::new(stream.io), service)
            .with_upgrades()
            .await
        {
            // Idle deadlines and clients hanging up mid-request end quietly.
            if err.is_timeout() || err.is_incomplete_message() || err.is_closed() {
                tracing::debug!("connection from {} ended: {}", conn.peer, err);
                return Ok(None);
            }
            return Err(err.into());
        }

        let pending = layer.pending.lock().take();
        match pending {
            None => Ok(None),
            Some(Pending::Connect { target, upgrade }) => {
                let upgraded = upgrade.await?;
                self.sniff(conn, target, upgraded).await
            }
            Some(Pending::Upgrade { client, upstream }) => {
                join_upgrade(client, upstream).await?;
                Ok(None)
            }
        }
    }

    async fn handle(&self, layer: &Layer, req: Request<Incoming>) -> Result<Response<Body>, Error> {
        let mut req = req.map(BodyExt::boxed);
        let source = layer.conn.source(req.headers_mut());
        tracing::debug!("{} {} {}", source, req.method(), req.uri());

        if !layer.conn.trusted.load(Ordering::Acquire) {
            if let Some(auth) = &self.auth {
                if let Err(err) = auth.authenticate(req.headers()) {
                    tracing::debug!("{} rejected: {}", source, err);
                    return Ok(err.try_into()?);
                }
            }
            layer.conn.trusted.store(true, Ordering::Release);
        }

        if Method::CONNECT == req.method() {
            return Ok(self.connect(layer, req));
        }

        self.plain(layer, req, source).await
    }

    /// Acknowledge a CONNECT and park the upgrade for [`Self::sniff`].
    fn connect(&self, layer: &Layer, mut req: Request<Body>) -> Response<Body> {
        // The response must go out before the connection can be upgraded, so
        // the tunnel is handled after hyper returns the stream.
        let Some(target) = req.uri().authority().cloned() else {
            tracing::warn!("CONNECT host is not socket addr: {:?}", req.uri());
            let mut resp = Response::new(full("CONNECT must be to a socket address"));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            return resp;
        };

        let upgrade = hyper::upgrade::on(&mut req);
        *layer.pending.lock() = Some(Pending::Connect { target, upgrade });

        let mut resp = Response::new(empty());
        *resp.version_mut() = req.version();
        resp.extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection established"));
        resp
    }

    /// Decide what the bytes after a CONNECT are.
    async fn sniff(
        &self,
        conn: &Conn,
        target: Authority,
        upgraded: Upgraded,
    ) -> Result<Option<Stream>, Error> {
        let mut io = TokioIo::new(upgraded);
        let mut buf = [0u8; SNIFF_LEN];

        let n = timeout(self.options.idle_timeout, io.read(&mut buf[..1])).await??;
        if n == 0 {
            return Ok(None);
        }

        if buf[0] == TLS_HANDSHAKE {
            if let Some(authority) = &self.options.authority {
                let config = authority.server_config_for_host(target.host())?;
                let stream = Rewind::new(io, Bytes::copy_from_slice(&buf[..1]));
                let tls = timeout(
                    self.options.handshake_timeout,
                    TlsAcceptor::from(config).accept(stream),
                )
                .await?
                .map_err(Error::Handshake)?;

                tracing::debug!("intercepting TLS for {}", target);
                return Ok(Some(Stream {
                    io: Box::new(tls),
                    tls: true,
                    authority: Some(target),
                }));
            }
        }

        let mut filled = 1;
        let deadline = Instant::now() + SNIFF_TIMEOUT;
        while filled < SNIFF_LEN && !buf[..filled].contains(&b' ') {
            match timeout_at(deadline, io.read(&mut buf[filled..])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) => return Err(err.into()),
            }
        }

        let stream = Rewind::new(io, Bytes::copy_from_slice(&buf[..filled]));
        if util::is_http_method(&buf[..filled]) {
            return Ok(Some(Stream {
                io: Box::new(stream),
                tls: false,
                authority: Some(target),
            }));
        }

        tracing::debug!("relaying opaque tunnel to {}", target);
        let tunnel = Tunnel {
            target,
            peer: conn.peer,
            source: conn.current_source(),
            stream: Box::new(stream),
        };
        self.options.dispatcher.dispatch(tunnel).await?;
        Ok(None)
    }

    async fn plain(
        &self,
        layer: &Layer,
        mut req: Request<Body>,
        source: SocketAddr,
    ) -> Result<Response<Body>, Error> {
        util::prepare_request(&mut req, layer.tls, layer.authority.as_ref());
        let info = ConnInfo {
            peer: layer.conn.peer,
            source,
            tls: layer.tls,
        };

        let api = req
            .uri()
            .host()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.options.api_host));
        if api {
            return self.api(Session::new(info, req)).await;
        }

        let client_upgrade =
            util::is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));
        if client_upgrade.is_some() {
            util::remove_upgrade_hop_by_hop_headers(req.headers_mut());
        } else {
            util::remove_hop_by_hop_headers(req.headers_mut());
        }
        util::remove_default_port(&mut req);

        let handler = &self.options.handler;
        let mut session = Session::new(info, req);
        match handler.handle_request(&mut session).await {
            Outcome::Unchanged => {}
            Outcome::Replaced(Intercept::Request(request)) => session.set_request(request),
            Outcome::Replaced(Intercept::Response(response)) => session.set_response(response),
        }

        if session.response().is_none() {
            let response = match self.forward(&mut session).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::debug!("forwarding {} failed: {}", session.url(), err);
                    handler.handle_error(Some(&session), &err).await;
                    session.set_close(true);
                    session.new_error_response(&err)
                }
            };
            session.set_response(response);
        }

        if let Some(client) = client_upgrade {
            if let Some(response) = session
                .response_mut()
                .filter(|response| response.status() == StatusCode::SWITCHING_PROTOCOLS)
            {
                let upstream = hyper::upgrade::on(response);
                *layer.pending.lock() = Some(Pending::Upgrade { client, upstream });
                return session.take_response().ok_or(Error::InvalidResponse);
            }
        }

        match handler.handle_response(&mut session).await {
            Outcome::Unchanged => {}
            Outcome::Replaced(response) => session.set_response(response),
        }

        let mut response = match session.take_response() {
            Some(response) => response,
            None => session.new_error_response(&Error::InvalidResponse),
        };
        util::finish_response(&mut response, session.close());
        Ok(response)
    }

    /// Send the session's request upstream. The session keeps its head.
    async fn forward(&self, session: &mut Session) -> Result<Response<Body>, Error> {
        let source = session.conn().source.ip();
        let request = session.request_mut();
        if request.uri().host().is_none() {
            return Err(Error::InvalidUrl);
        }

        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let mut outgoing = Request::new(std::mem::replace(request.body_mut(), empty()));
        *outgoing.method_mut() = request.method().clone();
        *outgoing.uri_mut() = request.uri().clone();
        *outgoing.version_mut() = request.version();
        *outgoing.headers_mut() = request.headers().clone();

        let client = self.clients.get(source, &user_agent);
        let response = timeout(self.options.upstream_timeout, client.request(outgoing)).await??;
        Ok(response.map(BodyExt::boxed))
    }

    /// Requests to the API host are answered here and close the connection.
    async fn api(&self, mut session: Session) -> Result<Response<Body>, Error> {
        session.set_close(true);
        let path = session.request().uri().path().to_owned();

        if let Some(authority) = &self.options.authority {
            if path.eq_ignore_ascii_case("/cert.crt") {
                return Ok(util::certificate_response(authority.root_pem())?);
            }
        }

        if let Some(mut response) = self.options.handler.handle_api_request(&mut session).await {
            util::finish_response(&mut response, true);
            return Ok(response);
        }

        Ok(util::not_found_response(&path)?)
    }
}

/// Relay between the two halves of a protocol upgrade.
async fn join_upgrade(client: OnUpgrade, upstream: OnUpgrade) -> Result<(), Error> {
    let (client, upstream) = tokio::try_join!(client, upstream)?;
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, from_server)) => {
            tracing::debug!(
                "client wrote {} bytes and received {} bytes",
                from_client,
                from_server
            );
        }
        Err(err) => {
            tracing::debug!("upgrade relay error: {}", err);
        }
    }

    Ok(())
}
