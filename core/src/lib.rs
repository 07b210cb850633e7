//! A small HTTP request executor with a shared pool and cookie jar.
//!
//! # Overview
//! Callers describe a call with a [`Request`], pick a [`Connection`] (an
//! explicit one or the process-wide default) and submit it, optionally bound
//! to a [`Context`] for cancellation. The result is a [`Response`] holding the
//! status, the fully buffered body and the cookies the server set, or an
//! [`Error`] naming the stage that failed.
//!
//! # Design
//! - A `Connection` owns a pooled `reqwest::Client` and a cookie jar. Cookies
//!   returned on one call are attached to later calls on the same connection
//!   when their domain and path match, including cookies set on redirect
//!   hops the transport follows.
//! - The submission path is single-shot: no retries, no queuing. Concurrency
//!   limits are the caller's business.
//! - Transport failures are classified into a few [`FailureKind`]s; the
//!   OS-level cause is logged through `tracing` when one is available.

pub mod classify;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod http;
pub mod pretty;
mod trace;

pub use client::{execute, submit};
pub use config::{ConnectionConfig, PoolConfig};
pub use connection::{
    close_idle_connections, default_connection, install_default, set_default, try_default,
    Connection,
};
pub use context::{Context, Done};
pub use error::{Cause, Error, FailureKind, Result, Stage};
pub use http::{Cookie, Request, Response};
pub use pretty::{jsonify, try_jsonify};
