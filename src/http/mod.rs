mod auth;
mod client;
mod conn;
pub mod error;
mod handler;
mod rewind;
mod server;
mod session;
mod tunnel;
mod util;

pub use auth::{Authenticator, Credentials};
pub use client::UpstreamTls;
pub use error::Error;
pub use handler::{Handler, Intercept, NoopHandler, Outcome};
pub use server::{Server, ServerHandle};
pub use session::{ConnInfo, Session};
pub use tunnel::{DirectDispatcher, Dispatcher, Io, Tunnel};

use crate::ca::Authority;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use std::{net::SocketAddr, sync::Arc, time::Duration};

/// Body type of every request and response passing through the proxy.
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Reserved host served by the proxy itself.
pub const DEFAULT_API_HOST: &str = "mitm.proxy";

/// Proxy configuration.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Bind address
    pub bind: SocketAddr,

    /// Listen backlog
    pub concurrent: usize,

    /// Timeout for upstream TCP connects
    pub connect_timeout: Duration,

    /// Read deadline while waiting for the next request
    pub idle_timeout: Duration,

    /// Client-side TLS handshake timeout
    pub handshake_timeout: Duration,

    /// Upstream round trip timeout
    pub upstream_timeout: Duration,

    /// Host answered locally instead of forwarded
    pub api_host: String,

    /// Trust policy for upstream TLS
    pub upstream_tls: UpstreamTls,

    /// Signs leaves for intercepted hosts. Without it TLS tunnels are relayed opaquely.
    pub authority: Option<Arc<Authority>>,

    pub handler: Arc<dyn Handler>,

    pub authenticator: Option<Arc<dyn Authenticator>>,

    pub dispatcher: Arc<dyn Dispatcher>,
}

impl ProxyOptions {
    pub fn new(bind: SocketAddr) -> Self {
        let connect_timeout = Duration::from_secs(10);
        Self {
            bind,
            concurrent: 1024,
            connect_timeout,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(60),
            api_host: DEFAULT_API_HOST.to_owned(),
            upstream_tls: UpstreamTls::default(),
            authority: None,
            handler: Arc::new(NoopHandler),
            authenticator: None,
            dispatcher: Arc::new(DirectDispatcher::new(connect_timeout)),
        }
    }

    pub fn with_authority(mut self, authority: Arc<Authority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn with_handler(mut self, handler: impl Handler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = host.into();
        self
    }

    pub fn with_upstream_tls(mut self, upstream_tls: UpstreamTls) -> Self {
        self.upstream_tls = upstream_tls;
        self
    }

    /// Set the upstream connect timeout, also used by the default dispatcher.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.dispatcher = Arc::new(DirectDispatcher::new(timeout));
        self
    }
}

pub(crate) fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> Body {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
