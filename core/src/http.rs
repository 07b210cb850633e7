//! Request descriptors and normalized responses.
//!
//! # Design
//! Both types are plain owned data. A `Request` is handed to the submission
//! path by shared reference and never mutated by it; a `Response` is built
//! once the body has been fully read and is returned by value.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Describes a single outgoing call.
///
/// `base_url`, when set and non-empty, takes precedence over the base URL of
/// the connection the request is submitted on. `path` may carry its own query
/// string; entries in `query_params` replace same-named keys found there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub method: String,
    pub path: String,
    /// Sent verbatim. Empty means no body.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new("POST", path).with_body(body)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A cookie returned by the server in a `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub max_age: Option<Duration>,
    pub expires: Option<SystemTime>,
    pub secure: bool,
    pub http_only: bool,
}

impl From<reqwest::cookie::Cookie<'_>> for Cookie {
    fn from(cookie: reqwest::cookie::Cookie<'_>) -> Self {
        Self {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            domain: cookie.domain().map(str::to_string),
            path: cookie.path().map(str::to_string),
            max_age: cookie.max_age(),
            expires: cookie.expires(),
            secure: cookie.secure(),
            http_only: cookie.http_only(),
        }
    }
}

/// The normalized result of a completed exchange.
///
/// Any status code the server sends is a successful exchange; callers decide
/// what a 4xx or 5xx means to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status_code: u16,
    /// Status line text, e.g. `"200 OK"`.
    pub status: String,
    pub body: Vec<u8>,
    /// Cookies set by this response, in header order.
    pub cookies: Vec<Cookie>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|cookie| cookie.name == name)
    }
}

/// Renders a status the way it appears on the status line.
pub(crate) fn status_text(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_str()),
        None => status.as_str().to_string(),
    }
}
