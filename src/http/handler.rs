use super::{error::Error, session::Session, Body};
use async_trait::async_trait;
use http::{Request, Response};

/// Result of a handler phase.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Carry on with what the session already holds.
    Unchanged,
    /// Use this value instead.
    Replaced(T),
}

impl<T> Outcome<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Outcome::Unchanged)
    }
}

/// Replacement produced by the request phase.
#[derive(Debug)]
pub enum Intercept {
    /// Forward this request instead of the original.
    Request(Request<Body>),
    /// Answer with this response without forwarding.
    Response(Response<Body>),
}

/// Hooks invoked for every intercepted exchange.
///
/// Every method has a pass-through default.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called before forwarding, after hop-by-hop headers are stripped.
    async fn handle_request(&self, session: &mut Session) -> Outcome<Intercept> {
        let _ = session;
        Outcome::Unchanged
    }

    /// Called with the upstream (or short-circuit) response in the session.
    async fn handle_response(&self, session: &mut Session) -> Outcome<Response<Body>> {
        let _ = session;
        Outcome::Unchanged
    }

    /// Claim a request to the API host. `None` answers 404.
    async fn handle_api_request(&self, session: &mut Session) -> Option<Response<Body>> {
        let _ = session;
        None
    }

    /// Observe an error that ends an exchange or a connection.
    ///
    /// `session` is `None` when the error happened outside any exchange, such
    /// as a failed handshake.
    async fn handle_error(&self, session: Option<&Session>, error: &Error) {
        let _ = session;
        tracing::debug!("proxy error: {}", error);
    }
}

/// Forwards everything untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandler;

impl Handler for NoopHandler {}
