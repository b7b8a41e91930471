//! URL-matched rewrite rules and the handler that applies them.
//!
//! Rules are written one per line as `<url-regex> url <action> [<extra>]`.

mod body;
mod rule;

pub use rule::{Action, Rule, RuleError};

use crate::http::{empty, full, Body, Error, Handler, Intercept, Outcome, Session};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use http_body_util::BodyExt;
use parking_lot::RwLock;
use regex::Captures;
use std::{borrow::Cow, collections::HashSet, sync::Arc};

/// Session property holding the id of the request-phase match.
pub const RULE_PROP: &str = "rewrite.rule";

const HTML_UTF8: &str = "text/html; charset=utf-8";
const JSON_UTF8: &str = "application/json; charset=utf-8";
const EMPTY: &[u8] = b"";

/// Parsed rules, split by the phase they run in.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    request: Vec<Rule>,
    response: Vec<Rule>,
}

impl RuleSet {
    /// Parse a rule list. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rule = Rule::parse(line).map_err(|source| RuleError::Line {
                line: index + 1,
                source: Box::new(source),
            })?;
            rules.push(rule);
        }
        Ok(Self::from_rules(rules))
    }

    /// Partition rules by phase, keeping order and dropping duplicates.
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut seen = HashSet::new();
        let mut set = Self::default();
        for rule in rules {
            if !seen.insert(rule.id()) {
                tracing::debug!("duplicate rewrite rule dropped: {}", rule);
                continue;
            }
            if rule.action().is_request_phase() {
                set.request.push(rule);
            } else {
                set.response.push(rule);
            }
        }
        set
    }

    /// First request-phase rule matching `url`, with the URL captures.
    pub fn match_request<'u>(&self, url: &'u str) -> Option<(&Rule, Captures<'u>)> {
        self.request
            .iter()
            .find_map(|rule| rule.url_regex().captures(url).map(|caps| (rule, caps)))
    }

    /// First response-phase rule matching `url` that has a substitution pattern.
    pub fn match_response(&self, url: &str) -> Option<&Rule> {
        self.response
            .iter()
            .find(|rule| rule.sub_regex().is_some() && rule.url_regex().is_match(url))
    }

    pub fn len(&self) -> usize {
        self.request.len() + self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The active rule set, replaceable while the proxy runs.
#[derive(Debug, Default)]
pub struct Rewrites {
    current: RwLock<Arc<RuleSet>>,
}

impl Rewrites {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn load(text: &str) -> Result<Self, RuleError> {
        RuleSet::parse(text).map(Self::new)
    }

    /// Snapshot of the active rules.
    pub fn current(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Swap in a new rule set. Exchanges in flight keep their snapshot.
    pub fn reload(&self, rules: RuleSet) {
        *self.current.write() = Arc::new(rules);
    }
}

/// Applies [`Rewrites`] to every exchange.
#[derive(Clone, Debug)]
pub struct RewriteHandler {
    rewrites: Arc<Rewrites>,
}

impl RewriteHandler {
    pub fn new(rewrites: Arc<Rewrites>) -> Self {
        Self { rewrites }
    }

    /// A canned reply that also closes the connection.
    fn reject(
        session: &mut Session,
        status: StatusCode,
        content_type: &'static str,
        payload: &'static [u8],
    ) -> Outcome<Intercept> {
        let mut response = session.new_response(status, full(Bytes::from_static(payload)));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(payload.len()));
        session.set_close(true);
        Outcome::Replaced(Intercept::Response(response))
    }

    async fn rewrite_request_body(rule: &Rule, session: &mut Session) -> Outcome<Intercept> {
        if !body::can_rewrite_body(session.request().headers()) {
            return Outcome::Unchanged;
        }

        let request = session.request_mut();
        let bytes = match collect(request.body_mut()).await {
            Ok(bytes) => bytes,
            Err(err) => {
                session.set_close(true);
                return Outcome::Replaced(Intercept::Response(session.new_error_response(&err)));
            }
        };

        match rewrite_payload(rule, request.headers(), &bytes) {
            Some(payload) => {
                body::set_rewritten_length(request.headers_mut(), payload.len());
                *request.body_mut() = full(payload);
            }
            None => *request.body_mut() = full(bytes),
        }
        Outcome::Unchanged
    }

    async fn rewrite_response_body(
        rule: &Rule,
        session: &mut Session,
    ) -> Outcome<Response<Body>> {
        let Some(response) = session.response_mut() else {
            return Outcome::Unchanged;
        };
        if !body::can_rewrite_body(response.headers()) {
            return Outcome::Unchanged;
        }

        let bytes = match collect(response.body_mut()).await {
            Ok(bytes) => bytes,
            Err(err) => {
                session.set_close(true);
                return Outcome::Replaced(session.new_error_response(&err));
            }
        };

        match rewrite_payload(rule, response.headers(), &bytes) {
            Some(payload) => {
                body::set_rewritten_length(response.headers_mut(), payload.len());
                *response.body_mut() = full(payload);
            }
            None => *response.body_mut() = full(bytes),
        }
        Outcome::Unchanged
    }
}

#[async_trait]
impl Handler for RewriteHandler {
    async fn handle_request(&self, session: &mut Session) -> Outcome<Intercept> {
        let rules = self.rewrites.current();
        let url = session.url();
        let Some((rule, captures)) = rules.match_request(&url) else {
            return Outcome::Unchanged;
        };

        tracing::debug!("rewrite {} matched {}", url, rule);
        session.set_prop(RULE_PROP, rule.id());

        match rule.action() {
            Action::Reject => Self::reject(session, StatusCode::NOT_FOUND, HTML_UTF8, EMPTY),
            Action::Reject200 => Self::reject(session, StatusCode::OK, HTML_UTF8, EMPTY),
            Action::RejectImg => {
                Self::reject(session, StatusCode::OK, "image/png", body::ONE_PIXEL_PNG)
            }
            Action::RejectDict => Self::reject(session, StatusCode::OK, JSON_UTF8, body::EMPTY_DICT),
            Action::RejectArray => {
                Self::reject(session, StatusCode::OK, JSON_UTF8, body::EMPTY_ARRAY)
            }
            Action::Redirect302 | Action::Redirect307 => {
                let status = if rule.action() == Action::Redirect302 {
                    StatusCode::FOUND
                } else {
                    StatusCode::TEMPORARY_REDIRECT
                };
                let location = rule.redirect_location(&captures);
                let Ok(location) = HeaderValue::from_str(&location) else {
                    tracing::warn!("invalid redirect location: {:?}", location);
                    return Outcome::Unchanged;
                };
                let mut response = session.new_response(status, empty());
                response.headers_mut().insert(header::LOCATION, location);
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                session.set_close(true);
                Outcome::Replaced(Intercept::Response(response))
            }
            Action::RequestHeader => {
                let headers = session.request().headers();
                if let Some(rewritten) = rewrite_headers(rule, headers) {
                    *session.request_mut().headers_mut() = rewritten;
                }
                Outcome::Unchanged
            }
            Action::RequestBody => Self::rewrite_request_body(rule, session).await,
            Action::ResponseHeader | Action::ResponseBody => Outcome::Unchanged,
        }
    }

    async fn handle_response(&self, session: &mut Session) -> Outcome<Response<Body>> {
        let rules = self.rewrites.current();
        let url = session.url();
        let Some(rule) = rules.match_response(&url) else {
            return Outcome::Unchanged;
        };

        tracing::debug!("rewrite {} matched {}", url, rule);
        match rule.action() {
            Action::ResponseHeader => {
                let Some(response) = session.response_mut() else {
                    return Outcome::Unchanged;
                };
                let length = response.headers().get(header::CONTENT_LENGTH).cloned();
                if let Some(mut rewritten) = rewrite_headers(rule, response.headers()) {
                    if let Some(length) = length {
                        rewritten.insert(header::CONTENT_LENGTH, length);
                    }
                    *response.headers_mut() = rewritten;
                }
                Outcome::Unchanged
            }
            Action::ResponseBody => Self::rewrite_response_body(rule, session).await,
            _ => Outcome::Unchanged,
        }
    }

    async fn handle_error(&self, session: Option<&Session>, error: &Error) {
        match session {
            Some(session) => tracing::debug!(
                "{} failed: {} (rule {:?})",
                session.url(),
                error,
                session.prop::<u64>(RULE_PROP)
            ),
            None => tracing::debug!("proxy error: {}", error),
        }
    }
}

fn rewrite_headers(rule: &Rule, headers: &HeaderMap) -> Option<HeaderMap> {
    let block = body::serialize_headers(headers);
    match rule.replace_payload(&block) {
        Cow::Borrowed(_) => None,
        Cow::Owned(rewritten) => body::parse_headers(&rewritten),
    }
}

fn rewrite_payload(rule: &Rule, headers: &HeaderMap, bytes: &[u8]) -> Option<Vec<u8>> {
    let text = body::decode_body(headers, bytes)?;
    body::encode_body(&rule.replace_payload(&text))
}

async fn collect(body: &mut Body) -> Result<Bytes, Error> {
    let body = std::mem::replace(body, empty());
    Ok(body.collect().await?.to_bytes())
}
