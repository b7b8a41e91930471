use super::{full, Body};
use http::{
    header::{self, HeaderName},
    uri::{Authority, PathAndQuery, Scheme},
    HeaderMap, HeaderValue, Request, Response, StatusCode, Uri,
};
use std::net::SocketAddr;

/// Overrides the client address for the rest of the connection.
pub(crate) const SOURCE_ADDRESS_HEADER: &str = "origin-request-source-address";

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    HeaderName::from_static("trailers"),
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE HTML PUBLIC "-//IETF//DTD HTML 2.0//EN">
<html><head>
<title>vmitm Proxy Services - 404 Not Found</title>
</head><body>
<h1>Not Found</h1>
<p>The requested URL {path} was not found on this server.</p>
</body></html>
"#;

const METHODS: [&[u8]; 9] = [
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE", b"PATCH",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub(crate) fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
}

/// Remove hop-by-hop headers from an upgrade request except the
/// `Connection: upgrade` / `Upgrade` pair the origin needs to switch protocols.
pub(crate) fn remove_upgrade_hop_by_hop_headers(headers: &mut HeaderMap) {
    let upgrade: Vec<HeaderValue> = headers.get_all(header::UPGRADE).iter().cloned().collect();
    remove_hop_by_hop_headers(headers);

    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    for value in upgrade {
        headers.append(header::UPGRADE, value);
    }
}

/// `Connection: upgrade` together with an `Upgrade` header.
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Whether `buf` starts with a request method, up to the first space.
pub(crate) fn is_http_method(buf: &[u8]) -> bool {
    let method = buf.split(|b| *b == b' ').next().unwrap_or_default();
    METHODS.contains(&method)
}

/// Take the source address override, if the request carries one.
pub(crate) fn take_source_address(headers: &mut HeaderMap) -> Option<SocketAddr> {
    headers
        .remove(SOURCE_ADDRESS_HEADER)
        .and_then(|value| value.to_str().ok()?.trim().parse().ok())
}

/// Turn an origin-form request into an absolute one.
///
/// The authority comes from `Host`, then from the CONNECT target of the
/// enclosing tunnel. A non-empty `Accept-Encoding` is narrowed to gzip.
pub(crate) fn prepare_request<B>(
    request: &mut Request<B>,
    tls: bool,
    default_authority: Option<&Authority>,
) {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Authority>().ok());

    let mut parts = request.uri().clone().into_parts();
    if let Some(host) = host {
        if tls || parts.authority.is_none() {
            parts.authority = Some(host);
        }
    }
    if parts.authority.is_none() {
        parts.authority = default_authority.cloned();
    }
    if tls {
        parts.scheme = Some(Scheme::HTTPS);
    } else if parts.scheme.is_none() {
        parts.scheme = Some(Scheme::HTTP);
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }

    if parts.authority.is_some() {
        match Uri::from_parts(parts) {
            Ok(uri) => *request.uri_mut() = uri,
            Err(err) => tracing::debug!("cannot make request absolute: {}", err),
        }
    }

    let narrow = request
        .headers()
        .get(header::ACCEPT_ENCODING)
        .is_some_and(|value| !value.is_empty());
    if narrow {
        request
            .headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
}

/// Drop an explicit `:80` from an http URI and its `Host` header.
pub(crate) fn remove_default_port<B>(request: &mut Request<B>) {
    let uri = request.uri();
    if uri.scheme() != Some(&Scheme::HTTP) || uri.port_u16() != Some(80) {
        return;
    }
    let Some(host) = uri.host().map(str::to_owned) else {
        return;
    };

    let mut parts = uri.clone().into_parts();
    parts.authority = host.parse::<Authority>().ok();
    if let Ok(uri) = Uri::from_parts(parts) {
        *request.uri_mut() = uri;
    }

    let host_header = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_suffix(":80"))
        .and_then(|value| HeaderValue::from_str(value).ok());
    if let Some(value) = host_header {
        request.headers_mut().insert(header::HOST, value);
    }
}

/// Strip hop-by-hop headers and set the connection disposition.
pub(crate) fn finish_response(response: &mut Response<Body>, close: bool) {
    let headers = response.headers_mut();
    remove_hop_by_hop_headers(headers);
    if close {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    } else {
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=60"));
    }
}

/// The root certificate as a download.
pub(crate) fn certificate_response(pem: &str) -> Result<Response<Body>, http::Error> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-x509-ca-cert")
        .header(header::CONTENT_LENGTH, pem.len())
        .header(header::CONNECTION, "close")
        .body(full(pem.to_owned()))
}

/// 404 page for unclaimed API paths.
pub(crate) fn not_found_response(path: &str) -> Result<Response<Body>, http::Error> {
    let page = NOT_FOUND_PAGE.replace("{path}", path);
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/html;charset=utf-8")
        .header(header::CONTENT_LENGTH, page.len())
        .header(header::CONNECTION, "close")
        .body(full(page))
}
