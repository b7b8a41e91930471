//! Header-block and payload transforms used by the rewrite actions.

use flate2::read::MultiGzDecoder;
use http::{
    header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE},
    HeaderMap, HeaderName, HeaderValue,
};
use std::io::Read;

/// A transparent 1x1 PNG.
pub(crate) const ONE_PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

pub(crate) const EMPTY_DICT: &[u8] = b"{}";
pub(crate) const EMPTY_ARRAY: &[u8] = b"[]";

/// Media type prefixes whose bodies may be rewritten.
const TEXT_TYPES: [&str; 6] = [
    "text/",
    "application/xhtml",
    "application/xml",
    "application/atom+xml",
    "application/json",
    "application/x-www-form-urlencoded",
];

/// Body rewriting needs a positive `Content-Length` and a text-like type.
pub(crate) fn can_rewrite_body(headers: &HeaderMap) -> bool {
    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    if length == 0 {
        return false;
    }

    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .is_some_and(|v| TEXT_TYPES.iter().any(|prefix| v.starts_with(prefix)))
}

/// Serialize `headers` as `Name: value\r\n` lines, sorted by name.
pub(crate) fn serialize_headers(headers: &HeaderMap) -> String {
    let mut names: Vec<&HeaderName> = headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let mut out = String::new();
    for name in names {
        let canonical = canonical_name(name.as_str());
        for value in headers.get_all(name) {
            out.push_str(&canonical);
            out.push_str(": ");
            out.push_str(&String::from_utf8_lossy(value.as_bytes()));
            out.push_str("\r\n");
        }
    }
    out
}

/// Parse a header block back. Any malformed line fails the whole block.
pub(crate) fn parse_headers(block: &str) -> Option<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in block.split("\r\n") {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
        let value = HeaderValue::from_str(value.trim()).ok()?;
        headers.append(name, value);
    }
    Some(headers)
}

/// Decode a payload to text, inflating gzip first.
///
/// `None` for any other content coding, or a corrupt gzip stream.
pub(crate) fn decode_body(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Some(latin1(body)),
        Some("gzip") | Some("x-gzip") => {
            let mut inflated = Vec::with_capacity(body.len() * 2);
            MultiGzDecoder::new(body).read_to_end(&mut inflated).ok()?;
            Some(latin1(&inflated))
        }
        Some(other) => {
            tracing::debug!("skip body rewrite for content-encoding {}", other);
            None
        }
    }
}

/// Encode rewritten text back to Latin-1 bytes.
///
/// `None` when the text contains characters outside Latin-1.
pub(crate) fn encode_body(text: &str) -> Option<Vec<u8>> {
    encoding_rs::mem::is_str_latin1(text)
        .then(|| encoding_rs::mem::encode_latin1_lossy(text).into_owned())
}

/// Replace the entity headers after a body rewrite.
pub(crate) fn set_rewritten_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(CONTENT_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

fn latin1(bytes: &[u8]) -> String {
    encoding_rs::mem::decode_latin1(bytes).into_owned()
}

fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn body_gate() {
        assert!(can_rewrite_body(&headers(&[
            ("content-length", "12"),
            ("content-type", "text/html; charset=utf-8"),
        ])));
        assert!(can_rewrite_body(&headers(&[
            ("content-length", "2"),
            ("content-type", "Application/JSON"),
        ])));
        assert!(!can_rewrite_body(&headers(&[
            ("content-length", "0"),
            ("content-type", "text/plain"),
        ])));
        assert!(!can_rewrite_body(&headers(&[("content-type", "text/plain")])));
        assert!(!can_rewrite_body(&headers(&[
            ("content-length", "12"),
            ("content-type", "image/png"),
        ])));
        assert!(!can_rewrite_body(&headers(&[("content-length", "12")])));
    }

    #[test]
    fn header_block_is_canonical_and_sorted() {
        let map = headers(&[
            ("x-forwarded-for", "1.2.3.4"),
            ("accept", "*/*"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);
        assert_eq!(
            serialize_headers(&map),
            "Accept: */*\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nX-Forwarded-For: 1.2.3.4\r\n"
        );
    }

    #[test]
    fn header_block_parses_back() {
        let map = parse_headers("Accept: */*\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get_all("set-cookie").iter().count(), 2);
        assert!(parse_headers("Accept */*\r\n").is_none());
        assert!(parse_headers("Bad Name: x\r\n").is_none());
        assert_eq!(parse_headers("").map(|m| m.len()), Some(0));
    }

    #[test]
    fn decodes_plain_and_gzip_bodies() {
        let plain = headers(&[]);
        assert_eq!(decode_body(&plain, b"caf\xe9").as_deref(), Some("café"));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let gz = encoder.finish().unwrap();
        let gzip = headers(&[("content-encoding", "gzip")]);
        assert_eq!(decode_body(&gzip, &gz).as_deref(), Some("hello gzip"));
        assert!(decode_body(&gzip, b"not gzip").is_none());

        let br = headers(&[("content-encoding", "br")]);
        assert!(decode_body(&br, b"whatever").is_none());
    }

    #[test]
    fn encodes_latin1_only() {
        assert_eq!(encode_body("café").unwrap(), b"caf\xe9");
        assert!(encode_body("snowman \u{2603}").is_none());
    }

    #[test]
    fn rewritten_length_drops_encoding() {
        let mut map = headers(&[("content-encoding", "gzip"), ("content-length", "99")]);
        set_rewritten_length(&mut map, 5);
        assert!(map.get(CONTENT_ENCODING).is_none());
        assert_eq!(map.get(CONTENT_LENGTH).unwrap(), "5");
    }
}
