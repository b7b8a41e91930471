use super::{empty, error::Error, Body};
use http::{header, HeaderValue, Request, Response, StatusCode};
use std::{any::Any, collections::HashMap, fmt, net::SocketAddr};

/// Where an exchange came from.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    /// Socket peer of the physical connection.
    pub peer: SocketAddr,
    /// Client address as reported by an upstream hop, else the peer.
    pub source: SocketAddr,
    /// Whether the exchange arrived over an intercepted TLS layer.
    pub tls: bool,
}

/// One request/response exchange handed to a [`Handler`](super::Handler).
pub struct Session {
    conn: ConnInfo,
    request: Request<Body>,
    response: Option<Response<Body>>,
    props: HashMap<String, Box<dyn Any + Send + Sync>>,
    close: bool,
}

impl Session {
    pub fn new(conn: ConnInfo, request: Request<Body>) -> Self {
        Self {
            conn,
            request,
            response: None,
            props: HashMap::new(),
            close: false,
        }
    }

    pub fn conn(&self) -> &ConnInfo {
        &self.conn
    }

    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    pub fn set_request(&mut self, request: Request<Body>) {
        self.request = request;
    }

    /// Absolute URL of the request.
    pub fn url(&self) -> String {
        self.request.uri().to_string()
    }

    pub fn response(&self) -> Option<&Response<Body>> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response<Body>> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: Response<Body>) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<Body>> {
        self.response.take()
    }

    pub fn set_prop<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.props.insert(key.into(), Box::new(value));
    }

    pub fn prop<T: Any>(&self, key: &str) -> Option<&T> {
        self.props.get(key).and_then(|value| value.downcast_ref())
    }

    pub fn remove_prop(&mut self, key: &str) -> bool {
        self.props.remove(key).is_some()
    }

    /// Whether the connection closes after this exchange.
    pub fn close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// An empty-bodied response matching the request's HTTP version.
    pub fn new_response(&self, status: StatusCode, body: Body) -> Response<Body> {
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.version_mut() = self.request.version();
        response
    }

    /// A `502 Bad Gateway` carrying `error` in a `Warning` header.
    pub fn new_error_response(&self, error: &Error) -> Response<Body> {
        let mut response = self.new_response(StatusCode::BAD_GATEWAY, empty());
        let date = http_date();
        let warning = format!("199 \"vmitm\" {:?} {:?}", error.to_string(), date);
        if let Ok(value) = HeaderValue::from_str(&warning) {
            response.headers_mut().insert(header::WARNING, value);
        }
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }
}

/// Current time in IMF-fixdate form.
fn http_date() -> String {
    let format = time::macros::format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conn", &self.conn)
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("status", &self.response.as_ref().map(|r| r.status()))
            .field("close", &self.close)
            .finish()
    }
}
