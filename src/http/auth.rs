use super::{empty, Body};
use base64::Engine;
use http::{header, HeaderMap, Response, StatusCode};
use moka::sync::Cache;
use std::{sync::Arc, time::Duration};

/// How long a checked credential is remembered.
const CREDENTIAL_TTL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    ProxyAuthenticationRequired,
    #[error("Forbidden")]
    Forbidden,
}

impl TryInto<Response<Body>> for AuthError {
    type Error = http::Error;
    fn try_into(self) -> Result<Response<Body>, Self::Error> {
        match self {
            AuthError::ProxyAuthenticationRequired => Response::builder()
                .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
                .header(header::PROXY_AUTHENTICATE, "Basic realm=\"Proxy\"")
                .body(empty()),
            AuthError::Forbidden => Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(empty()),
        }
    }
}

/// Checks proxy credentials.
pub trait Authenticator: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// A single username and password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for Credentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Memoizes verdicts per raw `Proxy-Authorization` credential.
pub(crate) struct AuthCache {
    authenticator: Arc<dyn Authenticator>,
    verdicts: Cache<String, bool>,
}

impl AuthCache {
    pub(crate) fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            verdicts: Cache::builder()
                .max_capacity(1024)
                .time_to_live(CREDENTIAL_TTL)
                .build(),
        }
    }

    pub(crate) fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let credential = headers
            .get(header::PROXY_AUTHORIZATION)
            .and_then(|hv| hv.to_str().ok())
            .and_then(|s| s.strip_prefix("Basic "))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::ProxyAuthenticationRequired)?;

        let allowed = self
            .verdicts
            .get_with_by_ref(credential, || self.check(credential));

        if allowed {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    fn check(&self, credential: &str) -> bool {
        let Some(decoded) = base64::engine::general_purpose::STANDARD
            .decode(credential.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        else {
            return false;
        };

        match decoded.split_once(':') {
            Some((username, password)) => self.authenticator.verify(username, password),
            None => false,
        }
    }
}
