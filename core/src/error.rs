//! Error types for the submission path.
//!
//! # Design
//! Every failure carries the base URL the request was aimed at and renders a
//! stage marker (`url`, `build`, `dispatch`, `body`) so log lines show where a
//! call died. Transport failures additionally carry a `FailureKind` produced
//! by [`crate::classify`]; cancellation and deadline expiry surface through
//! the same variants with kinds `Canceled` and `Timeout`.
//!
//! The base URL is the effective one: a non-empty `Request::base_url`
//! override wins over the connection's base URL, so the error names the
//! server that was actually contacted.

use std::fmt;

use crate::context::Done;

/// The step of the submission path that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Building the transport for a new connection.
    Init,
    Url,
    Build,
    Dispatch,
    Body,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Init => "init",
            Stage::Url => "url",
            Stage::Build => "build",
            Stage::Dispatch => "dispatch",
            Stage::Body => "body",
        })
    }
}

/// Coarse cause of a network-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Dns,
    Refused,
    /// The peer closed or reset the connection mid-exchange.
    Reset,
    Timeout,
    Canceled,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Dns => "dns lookup failed",
            FailureKind::Refused => "connection refused",
            FailureKind::Reset => "connection reset",
            FailureKind::Timeout => "timed out",
            FailureKind::Canceled => "canceled",
            FailureKind::Other => "transport error",
        })
    }
}

/// What interrupted a dispatch or body read.
#[derive(Debug, thiserror::Error)]
pub enum Cause {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<Done> for Cause {
    fn from(done: Done) -> Self {
        match done {
            Done::Canceled => Cause::Canceled,
            Done::DeadlineExceeded => Cause::DeadlineExceeded,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{base_url} (init): {source}")]
    Init {
        base_url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{base_url} (url): cannot parse {url:?}: {source}")]
    Url {
        base_url: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{base_url} (build): {reason}")]
    Build { base_url: String, reason: String },

    #[error("{base_url} (dispatch): {kind}: {source}")]
    Dispatch {
        base_url: String,
        kind: FailureKind,
        #[source]
        source: Cause,
    },

    #[error("{base_url} (body): {kind}: {source}")]
    Body {
        base_url: String,
        kind: FailureKind,
        #[source]
        source: Cause,
    },
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::Init { .. } => Stage::Init,
            Error::Url { .. } => Stage::Url,
            Error::Build { .. } => Stage::Build,
            Error::Dispatch { .. } => Stage::Dispatch,
            Error::Body { .. } => Stage::Body,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Error::Init { base_url, .. }
            | Error::Url { base_url, .. }
            | Error::Build { base_url, .. }
            | Error::Dispatch { base_url, .. }
            | Error::Body { base_url, .. } => base_url,
        }
    }

    /// The classified cause, for failures that reached the network.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Dispatch { kind, .. } | Error::Body { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == Some(FailureKind::Canceled)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == Some(FailureKind::Timeout)
    }

    /// True when no connection to the server could be established.
    pub fn is_connect(&self) -> bool {
        matches!(
            self.kind(),
            Some(FailureKind::Dns) | Some(FailureKind::Refused)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
