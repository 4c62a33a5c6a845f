//! Request context and counting-key derivation.

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, ThrottleError};

/// What the limiter sees of an inbound operation.
///
/// Built by the hosting boundary (HTTP server, CLI) for every request. The
/// limiter never parses requests itself.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Network address of the caller, if known
    pub remote_addr: Option<SocketAddr>,
    /// Request method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Authenticated account identifier, if the boundary resolved one
    pub account: Option<String>,
}

impl RequestContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the parts of an HTTP request the limiter can key on.
    pub fn from_request<B>(request: &http::Request<B>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
            account: None,
        }
    }

    /// Set the caller's network address.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the authenticated account.
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
        self
    }
}

/// Function mapping a request to the string its requests are counted under.
///
/// An `Err` is a misconfigured integration and propagates to the caller.
pub type KeyFn = Arc<dyn Fn(&RequestContext) -> Result<String> + Send + Sync>;

/// Built-in key derivation strategies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyBy {
    /// The caller's IP address
    #[default]
    RemoteAddr,
    /// The value of a request header, e.g. an API key
    Header(String),
    /// The authenticated account identifier
    Account,
}

impl KeyBy {
    /// Derive the key for `ctx` with this strategy.
    pub fn derive(&self, ctx: &RequestContext) -> Result<String> {
        match self {
            KeyBy::RemoteAddr => ctx
                .remote_addr
                .map(|addr| addr.ip().to_string())
                .ok_or_else(|| ThrottleError::KeyDerivation("request has no remote address".into())),
            KeyBy::Header(name) => {
                let value = ctx.headers.get(name.as_str()).ok_or_else(|| {
                    ThrottleError::KeyDerivation(format!("missing header {}", name))
                })?;
                value.to_str().map(str::to_string).map_err(|_| {
                    ThrottleError::KeyDerivation(format!("header {} is not valid text", name))
                })
            }
            KeyBy::Account => ctx
                .account
                .clone()
                .ok_or_else(|| ThrottleError::KeyDerivation("request has no account".into())),
        }
    }

    /// Wrap this strategy as a [`KeyFn`].
    pub fn key_fn(&self) -> KeyFn {
        let strategy = self.clone();
        Arc::new(move |ctx| strategy.derive(ctx))
    }
}

impl fmt::Display for KeyBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBy::RemoteAddr => write!(f, "remote_addr"),
            KeyBy::Header(name) => write!(f, "header:{}", name),
            KeyBy::Account => write!(f, "account"),
        }
    }
}

impl FromStr for KeyBy {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "remote_addr" => Ok(KeyBy::RemoteAddr),
            "account" => Ok(KeyBy::Account),
            other => match other.strip_prefix("header:") {
                Some(name) if HeaderName::from_str(name).is_ok() => {
                    Ok(KeyBy::Header(name.to_ascii_lowercase()))
                }
                _ => Err(ThrottleError::Config(format!("invalid key_by: {}", other))),
            },
        }
    }
}

impl TryFrom<String> for KeyBy {
    type Error = ThrottleError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<KeyBy> for String {
    fn from(key_by: KeyBy) -> Self {
        key_by.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_remote_addr_key_ignores_port() {
        let ctx = RequestContext::new().with_remote_addr(addr("192.168.1.7:51234"));
        assert_eq!(KeyBy::RemoteAddr.derive(&ctx).unwrap(), "192.168.1.7");
    }

    #[test]
    fn test_missing_remote_addr_is_an_error() {
        let err = KeyBy::RemoteAddr.derive(&RequestContext::new()).unwrap_err();
        assert!(matches!(err, ThrottleError::KeyDerivation(_)));
    }

    #[test]
    fn test_header_key() {
        let ctx = RequestContext::new().with_header("X-Api-Key", "k-123");
        let key_by: KeyBy = "header:x-api-key".parse().unwrap();

        assert_eq!(key_by.derive(&ctx).unwrap(), "k-123");
        assert!(key_by.derive(&RequestContext::new()).is_err());
    }

    #[test]
    fn test_account_key() {
        let ctx = RequestContext::new().with_account("acct-9");
        assert_eq!(KeyBy::Account.derive(&ctx).unwrap(), "acct-9");
    }

    #[test]
    fn test_from_request() {
        let request = http::Request::builder()
            .method(Method::POST)
            .uri("https://forge.example/api/v1/generate?dry=1")
            .header("authorization", "Bearer t0k")
            .body(())
            .unwrap();

        let ctx = RequestContext::from_request(&request, Some(addr("10.0.0.1:443")));
        assert_eq!(ctx.method, Method::POST);
        assert_eq!(ctx.path, "/api/v1/generate");
        assert_eq!(
            KeyBy::Header("authorization".into()).derive(&ctx).unwrap(),
            "Bearer t0k"
        );
    }

    #[test]
    fn test_key_by_parse_and_display() {
        for s in ["remote_addr", "account", "header:x-api-key"] {
            let key_by: KeyBy = s.parse().unwrap();
            assert_eq!(key_by.to_string(), s);
        }
        assert!("header:".parse::<KeyBy>().is_err());
        assert!("cookie".parse::<KeyBy>().is_err());
    }

    #[test]
    fn test_key_by_deserializes_from_yaml() {
        let key_by: KeyBy = serde_yaml::from_str("header:X-Api-Key").unwrap();
        assert_eq!(key_by, KeyBy::Header("x-api-key".into()));
    }
}
