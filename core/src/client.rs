//! The submission path: descriptor in, normalized response out.
//!
//! # Design
//! `execute` resolves the URL, builds the transport request (headers, body,
//! stored cookies), dispatches it through the connection's pool, captures
//! returned cookies into the jar and buffers the body. Redirects are followed
//! by the transport. Dispatch and body read
//! are both raced against the caller's [`Context`]. Nothing is retried.

use std::collections::{BTreeMap, HashMap};

use reqwest::cookie::CookieStore;
use reqwest::header::{HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::{Method, Url};
use tracing::{debug, instrument, trace, warn};

use crate::classify;
use crate::connection::{default_connection, Connection};
use crate::context::{Context, Done};
use crate::error::{Cause, Error, FailureKind, Result, Stage};
use crate::http::{status_text, Cookie, Request, Response};

impl Connection {
    /// Submits `request` with a context that never cancels.
    pub async fn submit(&self, request: &Request) -> Result<Response> {
        self.execute(&Context::background(), request).await
    }

    /// Submits `request`, giving up as soon as `ctx` is canceled or its
    /// deadline passes.
    #[instrument(level = "debug", skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, ctx: &Context, request: &Request) -> Result<Response> {
        let base_url = effective_base(self.base_url(), request);
        let url = resolve_url(base_url, request)?;
        debug!(%url, "resolved");

        let outgoing = self.build(base_url, url, request)?;
        let client = self.client();
        let traces = self.traces();
        if traces {
            trace!(url = %outgoing.url(), "dispatch start");
        }

        let response = match ctx.run(client.execute(outgoing)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(transport_failure(base_url, Stage::Dispatch, err)),
            Err(done) => return Err(interrupted(base_url, Stage::Dispatch, done)),
        };
        let status = response.status();
        if traces {
            trace!(
                %status,
                final_url = %response.url(),
                remote_addr = ?response.remote_addr(),
                "got connection"
            );
        }

        // a transport built by the connection has already recorded every hop
        if !self.owns_jar() {
            let mut set_cookies = response.headers().get_all(SET_COOKIE).iter().peekable();
            if set_cookies.peek().is_some() {
                self.jar().set_cookies(&mut set_cookies, response.url());
            }
        }
        let cookies: Vec<Cookie> = response.cookies().map(Cookie::from).collect();

        // the response owns the connection; dropping it on any branch below
        // either returns it to the pool or closes it
        let body = match ctx.run(response.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return Err(transport_failure(base_url, Stage::Body, err)),
            Err(done) => return Err(interrupted(base_url, Stage::Body, done)),
        };

        Ok(Response {
            status_code: status.as_u16(),
            status: status_text(status),
            body: body.to_vec(),
            cookies,
        })
    }

    fn build(&self, base_url: &str, url: Url, request: &Request) -> Result<reqwest::Request> {
        let build_error = |reason: String| Error::Build {
            base_url: base_url.to_string(),
            reason,
        };

        let method = if request.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(request.method.as_bytes())
                .map_err(|_| build_error(format!("invalid method {:?}", request.method)))?
        };

        let cookie = self.jar().cookies(&url);
        let mut outgoing = reqwest::Request::new(method, url);
        if !request.body.is_empty() {
            *outgoing.body_mut() = Some(request.body.clone().into());
        }

        let headers = outgoing.headers_mut();
        for (name, value) in &request.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| build_error(format!("invalid header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| build_error(format!("invalid value for header {name:?}")))?;
            headers.insert(header, value);
        }

        if let Some(stored) = cookie {
            let merged = match headers.get(COOKIE) {
                Some(existing) => {
                    let mut joined = existing.as_bytes().to_vec();
                    joined.extend_from_slice(b"; ");
                    joined.extend_from_slice(stored.as_bytes());
                    HeaderValue::from_bytes(&joined)
                        .map_err(|_| build_error("invalid cookie header".to_string()))?
                }
                None => stored,
            };
            headers.insert(COOKIE, merged);
            if self.traces() {
                trace!("attached stored cookies");
            }
        }

        Ok(outgoing)
    }
}

/// Submits `request` on the default connection with a context that never
/// cancels.
///
/// # Panics
///
/// Panics if no default connection has been installed.
pub async fn submit(request: &Request) -> Result<Response> {
    default_connection().submit(request).await
}

/// Submits `request` on the default connection, bound to `ctx`.
///
/// # Panics
///
/// Panics if no default connection has been installed.
pub async fn execute(ctx: &Context, request: &Request) -> Result<Response> {
    default_connection().execute(ctx, request).await
}

fn effective_base<'a>(connection_base: &'a str, request: &'a Request) -> &'a str {
    match request.base_url.as_deref() {
        Some(base) if !base.is_empty() => base,
        _ => connection_base,
    }
}

pub(crate) fn resolve_url(base_url: &str, request: &Request) -> Result<Url> {
    let raw = format!("{base_url}{}", request.path);
    let mut url = Url::parse(&raw).map_err(|source| Error::Url {
        base_url: base_url.to_string(),
        url: raw.clone(),
        source,
    })?;
    if !request.query_params.is_empty() {
        merge_query(&mut url, &request.query_params);
    }
    Ok(url)
}

/// Replaces every same-named key in the URL's query with the given value and
/// re-encodes the whole query, sorted by key.
fn merge_query(url: &mut Url, params: &HashMap<String, String>) {
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        query
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    for (name, value) in params {
        query.insert(name.clone(), vec![value.clone()]);
    }
    url.query_pairs_mut().clear().extend_pairs(
        query
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |value| (name, value))),
    );
}

fn transport_failure(base_url: &str, stage: Stage, err: reqwest::Error) -> Error {
    let kind = classify::classify(&err);
    match classify::os_cause(&err) {
        Some(io) => warn!(
            base_url,
            %stage,
            %kind,
            io_kind = ?io.kind(),
            os_error = ?io.raw_os_error(),
            "{io}"
        ),
        None => warn!(base_url, %stage, %kind, "{err}"),
    }
    wrap(base_url, stage, kind, Cause::Transport(err))
}

fn interrupted(base_url: &str, stage: Stage, done: Done) -> Error {
    let kind = match done {
        Done::Canceled => FailureKind::Canceled,
        Done::DeadlineExceeded => FailureKind::Timeout,
    };
    debug!(base_url, %stage, ?done, "context finished before the exchange did");
    wrap(base_url, stage, kind, done.into())
}

fn wrap(base_url: &str, stage: Stage, kind: FailureKind, source: Cause) -> Error {
    let base_url = base_url.to_string();
    match stage {
        Stage::Body => Error::Body {
            base_url,
            kind,
            source,
        },
        _ => Error::Dispatch {
            base_url,
            kind,
            source,
        },
    }
}
