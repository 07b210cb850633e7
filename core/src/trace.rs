//! Connection-level tracing hooks.
//!
//! Installed only when [`ConnectionConfig::trace_connections`] is set. The
//! resolver reports every lookup; the submission path reports the peer each
//! exchange landed on and each pooled client handed back by idle release.
//!
//! [`ConnectionConfig::trace_connections`]: crate::ConnectionConfig::trace_connections

use std::error::Error as StdError;
use std::net::SocketAddr;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::time::Instant;
use tracing::trace;

/// System resolver that logs each lookup and its outcome.
#[derive(Debug, Clone, Default)]
pub(crate) struct TracedResolver;

impl Resolve for TracedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            trace!(%host, "dns start");
            let started = Instant::now();

            let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => addrs.collect(),
                Err(err) => {
                    trace!(%host, elapsed = ?started.elapsed(), error = %err, "dns done");
                    return Err(Box::new(err) as Box<dyn StdError + Send + Sync>);
                }
            };
            trace!(%host, ?addrs, elapsed = ?started.elapsed(), "dns done");

            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}
