//! Transport configuration for new connections.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};

use crate::trace::TracedResolver;

pub const MAX_IDLE_CONNS: usize = 4000;
pub const MAX_IDLE_CONNS_PER_HOST: usize = 4000;
pub const MAX_CONNS_PER_HOST: usize = 4000;
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection pool ceilings. Fixed once the connection is created.
///
/// The transport enforces only a per-host idle ceiling. `max_idle` and
/// `max_per_host` are carried for configuration parity and cap that idle
/// ceiling; neither limits how many connections are open at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub max_idle_per_host: usize,
    pub max_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: MAX_IDLE_CONNS,
            max_idle_per_host: MAX_IDLE_CONNS_PER_HOST,
            max_per_host: MAX_CONNS_PER_HOST,
            idle_timeout: IDLE_CONN_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Idle connections kept per host: the smallest of the three ceilings.
    pub fn effective_idle_per_host(&self) -> usize {
        self.max_idle_per_host
            .min(self.max_idle)
            .min(self.max_per_host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub pool: PoolConfig,
    /// Honor `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`.
    pub use_env_proxy: bool,
    pub connect_timeout: Option<Duration>,
    /// Log DNS lookups, the peer of each exchange, pool release and raw
    /// connection I/O at trace level.
    pub trace_connections: bool,
    pub user_agent: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            use_env_proxy: true,
            connect_timeout: None,
            trace_connections: false,
            user_agent: None,
        }
    }
}

impl ConnectionConfig {
    /// Builds a transport that stores and replays cookies through `jar` on
    /// every hop, redirects included.
    pub(crate) fn build_client(&self, jar: Arc<Jar>) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar)
            .pool_max_idle_per_host(self.pool.effective_idle_per_host())
            .pool_idle_timeout(self.pool.idle_timeout)
            .connection_verbose(self.trace_connections);
        if self.trace_connections {
            builder = builder.dns_resolver(Arc::new(TracedResolver));
        }
        if !self.use_env_proxy {
            builder = builder.no_proxy();
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        builder.build()
    }
}
