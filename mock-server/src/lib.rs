use std::{
    collections::{BTreeMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{AppendHeaders, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock, task::JoinHandle};
use uuid::Uuid;

/// Everything the backend observed about a request, returned as JSON by the
/// catch-all route.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Echo {
    pub method: String,
    pub path: String,
    pub raw_query: Option<String>,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: String,
    pub peer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session: Uuid,
}

#[derive(Deserialize)]
pub struct SlowParams {
    #[serde(default)]
    pub ms: u64,
}

/// `to` becomes the `Location` of a 302; `cookie`, when present, is sent
/// verbatim as a `Set-Cookie` header on the redirect itself.
#[derive(Deserialize)]
pub struct RedirectParams {
    pub to: String,
    #[serde(default)]
    pub cookie: Option<String>,
}

pub type Sessions = Arc<RwLock<HashSet<Uuid>>>;

pub fn app() -> Router {
    let sessions: Sessions = Arc::new(RwLock::new(HashSet::new()));
    Router::new()
        .route("/cookies/set", get(set_cookies))
        .route("/session/login", get(login))
        .route("/session/whoami", get(whoami))
        .route("/redirect", get(redirect))
        .route("/slow", get(slow))
        .route("/status/{code}", get(status))
        .fallback(echo)
        .with_state(sessions)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(
        listener,
        app().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// A backend bound to an ephemeral localhost port and served from a task on
/// the current runtime.
#[derive(Debug)]
pub struct TestServer {
    addr: SocketAddr,
    handle: JoinHandle<Result<(), std::io::Error>>,
}

impl TestServer {
    pub async fn spawn() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(run(listener));
        tracing::debug!(%addr, "mock server listening");
        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stops accepting connections and waits until the listener is closed.
    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
        tracing::debug!(addr = %self.addr, "mock server stopped");
    }
}

async fn echo(request: Request) -> Result<Json<Echo>, StatusCode> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let method = request.method().to_string();
    let uri = request.uri().clone();
    let headers = header_map(request.headers());
    let cookies = request_cookies(request.headers());
    let body = to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    Ok(Json(Echo {
        method,
        path: uri.path().to_string(),
        raw_query: uri.query().map(str::to_string),
        query: query_pairs(&uri),
        headers,
        cookies,
        body: String::from_utf8_lossy(&body).into_owned(),
        peer,
    }))
}

async fn set_cookies(uri: Uri) -> impl IntoResponse {
    let pairs = query_pairs(&uri);
    let cookies: Vec<_> = pairs
        .iter()
        .map(|(name, value)| (header::SET_COOKIE, format!("{name}={value}; Path=/")))
        .collect();
    (AppendHeaders(cookies), Json(pairs))
}

async fn login(State(sessions): State<Sessions>) -> impl IntoResponse {
    let session = Uuid::new_v4();
    sessions.write().await.insert(session);
    (
        AppendHeaders([(
            header::SET_COOKIE,
            format!("session={session}; Path=/session; HttpOnly"),
        )]),
        Json(Session { session }),
    )
}

async fn whoami(
    State(sessions): State<Sessions>,
    headers: HeaderMap,
) -> Result<Json<Session>, StatusCode> {
    let session = request_cookies(&headers)
        .get("session")
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if sessions.read().await.contains(&session) {
        Ok(Json(Session { session }))
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn redirect(Query(params): Query<RedirectParams>) -> impl IntoResponse {
    let mut headers = vec![(header::LOCATION, params.to)];
    headers.extend(params.cookie.map(|cookie| (header::SET_COOKIE, cookie)));
    (StatusCode::FOUND, AppendHeaders(headers))
}

async fn slow(Query(params): Query<SlowParams>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    "done"
}

async fn status(Path(code): Path<u16>) -> Result<StatusCode, StatusCode> {
    StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)
}

fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default()
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn request_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
