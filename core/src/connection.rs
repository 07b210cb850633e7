//! Connections and the process-wide default connection.
//!
//! # Design
//! A `Connection` bundles a base URL, a pooled `reqwest::Client` and a cookie
//! jar. The client is held behind a lock only so that
//! [`Connection::close_idle_connections`] can swap in a fresh pool; every
//! submission clones the handle it needs and releases the lock immediately.
//! The jar is shared and internally synchronized. Clients the connection
//! builds itself carry the jar, so the transport records cookies on every
//! redirect hop; a caller-supplied client does not, and only the final
//! response of each exchange feeds the jar.
//!
//! New code should construct a `Connection` at the composition root and pass
//! it (usually in an `Arc`) to whoever needs it. The default connection exists
//! for call sites that cannot be handed one.

use std::sync::{Arc, PoisonError, RwLock};

use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Connection {
    base_url: String,
    client: RwLock<reqwest::Client>,
    /// `None` when the client was supplied by the caller.
    config: Option<ConnectionConfig>,
    jar: Arc<Jar>,
}

impl Connection {
    /// Creates a connection with the default pool ceilings and proxy settings
    /// taken from the environment.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_config(base_url, ConnectionConfig::default())
    }

    pub fn with_config(base_url: impl Into<String>, config: ConnectionConfig) -> Result<Self> {
        let base_url = base_url.into();
        let jar = Arc::new(Jar::default());
        let client = config
            .build_client(jar.clone())
            .map_err(|source| Error::Init {
                base_url: base_url.clone(),
                source,
            })?;
        debug!(%base_url, ?config, "created connection");
        Ok(Self {
            base_url,
            client: RwLock::new(client),
            config: Some(config),
            jar,
        })
    }

    /// Wraps a client built elsewhere, typically one pointed at an in-process
    /// test server. The connection still gets its own empty cookie jar, and
    /// the client's pool stays under the caller's control.
    ///
    /// The jar cannot be installed into a client that is already built.
    /// Redirects the client follows on its own therefore neither receive
    /// stored cookies nor have their `Set-Cookie` headers recorded; cookies
    /// on the final response are stored against the final URL.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into();
        debug!(%base_url, "created connection with caller-supplied client");
        Self {
            base_url,
            client: RwLock::new(client),
            config: None,
            jar: Arc::new(Jar::default()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }

    /// The `Cookie` header this connection would attach to a request for `url`.
    pub fn cookies(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    pub(crate) fn client(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn jar(&self) -> &Jar {
        &self.jar
    }

    /// True when the transport itself reads and writes the jar.
    pub(crate) fn owns_jar(&self) -> bool {
        self.config.is_some()
    }

    pub(crate) fn traces(&self) -> bool {
        self.config
            .as_ref()
            .is_some_and(|config| config.trace_connections)
    }

    /// Releases idle pooled connections.
    ///
    /// The current pool is replaced with an empty one. Requests already in
    /// flight keep the old pool alive until they finish; their connections
    /// are closed instead of being returned for reuse.
    pub fn close_idle_connections(&self) {
        let Some(config) = &self.config else {
            debug!(base_url = %self.base_url, "pool belongs to caller-supplied client; leaving it");
            return;
        };
        match config.build_client(self.jar.clone()) {
            Ok(fresh) => {
                let previous = std::mem::replace(
                    &mut *self.client.write().unwrap_or_else(PoisonError::into_inner),
                    fresh,
                );
                drop(previous);
                if config.trace_connections {
                    trace!(base_url = %self.base_url, "released idle connections");
                }
            }
            Err(err) => {
                warn!(base_url = %self.base_url, error = %err, "could not rebuild transport; idle connections kept");
            }
        }
    }
}

static DEFAULT: RwLock<Option<Arc<Connection>>> = RwLock::new(None);

/// Creates a connection for `base_url` and installs it as the process-wide
/// default, replacing any earlier one.
pub fn install_default(base_url: impl Into<String>) -> Result<Arc<Connection>> {
    let connection = Arc::new(Connection::new(base_url)?);
    set_default(connection.clone());
    Ok(connection)
}

/// Installs an already constructed connection as the process-wide default.
pub fn set_default(connection: Arc<Connection>) {
    debug!(base_url = %connection.base_url, "installed default connection");
    *DEFAULT.write().unwrap_or_else(PoisonError::into_inner) = Some(connection);
}

pub fn try_default() -> Option<Arc<Connection>> {
    DEFAULT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Resolves the process-wide default connection.
///
/// # Panics
///
/// Panics if neither [`install_default`] nor [`set_default`] has been called.
/// Reaching this without a default is a wiring bug, not a runtime condition.
pub fn default_connection() -> Arc<Connection> {
    match try_default() {
        Some(connection) => connection,
        None => panic!("default connection has not been installed; call install_default or set_default first"),
    }
}

/// Releases idle connections held by the default connection, if any.
pub fn close_idle_connections() {
    if let Some(connection) = try_default() {
        connection.close_idle_connections();
    }
}
