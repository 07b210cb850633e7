//! End-to-end submission tests against a live mock server.
//!
//! # Design
//! Each test starts its own mock server on a random localhost port and talks
//! to it through a real `Connection`. Connections are built with the
//! environment proxy disabled so the suite behaves the same on machines with
//! `HTTP_PROXY` set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::{
    Connection, ConnectionConfig, Context, Error, FailureKind, Request, Stage,
};
use mock_server::{Echo, Session, TestServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connect(base_url: &str) -> Connection {
    let config = ConnectionConfig {
        use_env_proxy: false,
        ..ConnectionConfig::default()
    };
    Connection::with_config(base_url, config).unwrap()
}

async fn start() -> (TestServer, Connection) {
    init_tracing();
    let server = TestServer::spawn().await.unwrap();
    let cnx = connect(&server.url());
    (server, cnx)
}

/// Accepts one connection, reads the request head, writes `reply` and hangs up.
async fn one_shot_server(reply: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        socket.write_all(reply).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}")
}

// --- basic exchange ---

#[tokio::test]
async fn get_reaches_requested_path() {
    let (_server, cnx) = start().await;

    let resp = cnx.submit(&Request::get("/xyzzy")).await.unwrap();

    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.status, "200 OK");
    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.method, "GET");
    assert_eq!(echo.path, "/xyzzy");
    assert!(resp.cookies.is_empty());
}

#[tokio::test]
async fn caller_supplied_client_works() {
    let (server, _) = start().await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let cnx = Connection::with_client(server.url(), client);

    let resp = cnx
        .execute(&Context::background(), &Request::get("/xyzzy"))
        .await
        .unwrap();

    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.path, "/xyzzy");
}

#[tokio::test]
async fn request_base_url_overrides_connection() {
    let (server, _) = start().await;
    // nothing listens on port 9 (discard) on a test machine
    let cnx = connect("http://127.0.0.1:9");

    let resp = cnx
        .submit(&Request::get("/override").with_base_url(server.url()))
        .await
        .unwrap();

    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.path, "/override");
}

#[tokio::test]
async fn failure_names_the_override_base() {
    let (server, cnx) = start().await;

    let err = cnx
        .submit(&Request::get("/x").with_base_url("http://127.0.0.1:9"))
        .await
        .unwrap_err();

    assert_eq!(err.base_url(), "http://127.0.0.1:9");
    assert_ne!(err.base_url(), server.url());
    assert_eq!(err.stage(), Stage::Dispatch);
}

#[tokio::test]
async fn empty_bases_use_path_as_url() {
    let (server, _) = start().await;
    let cnx = connect("");

    let resp = cnx
        .submit(&Request::get(format!("{}/full/url", server.url())))
        .await
        .unwrap();

    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.path, "/full/url");
}

#[tokio::test]
async fn non_success_status_is_not_an_error() {
    let (_server, cnx) = start().await;

    let resp = cnx.submit(&Request::get("/status/404")).await.unwrap();

    assert_eq!(resp.status_code, 404);
    assert_eq!(resp.status, "404 Not Found");
    assert!(!resp.is_success());
    assert!(resp.body.is_empty());
}

// --- query, headers, body ---

#[tokio::test]
async fn query_params_override_path_query() {
    let (_server, cnx) = start().await;

    let req = Request::get("/q?a=old&keep=1")
        .with_query("a", "new")
        .with_query("b", "two words&more");
    let resp = cnx.submit(&req).await.unwrap();

    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.path, "/q");
    assert_eq!(echo.raw_query.as_deref(), Some("a=new&b=two+words%26more&keep=1"));
    assert!(echo.query.contains(&("a".to_string(), "new".to_string())));
    assert!(!echo.query.contains(&("a".to_string(), "old".to_string())));
    assert!(echo.query.contains(&("b".to_string(), "two words&more".to_string())));
    assert!(echo.query.contains(&("keep".to_string(), "1".to_string())));
}

#[tokio::test]
async fn post_sends_body_verbatim_with_headers() {
    let (_server, cnx) = start().await;

    let req = Request::post("/things", r#"{"not":"inspected"}"#)
        .with_header("content-type", "text/plain")
        .with_header("x-request-id", "42");
    let resp = cnx.submit(&req).await.unwrap();

    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.method, "POST");
    assert_eq!(echo.body, r#"{"not":"inspected"}"#);
    assert_eq!(echo.headers["content-type"], "text/plain");
    assert_eq!(echo.headers["x-request-id"], "42");
}

#[tokio::test]
async fn empty_body_sends_nothing() {
    let (_server, cnx) = start().await;

    let resp = cnx.submit(&Request::new("DELETE", "/things/1")).await.unwrap();

    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.method, "DELETE");
    assert!(echo.body.is_empty());
    assert!(!echo.headers.contains_key("content-type"));
}

// --- construction failures ---

#[tokio::test]
async fn malformed_url_fails_before_dispatch() {
    init_tracing();
    let cnx = connect("not a url");

    let err = cnx.submit(&Request::get("/x")).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Url);
    assert_eq!(err.base_url(), "not a url");
    assert!(err.kind().is_none());
}

#[tokio::test]
async fn invalid_method_fails_to_build() {
    let (_server, cnx) = start().await;

    let err = cnx.submit(&Request::new("NOT VALID", "/")).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Build);
}

// --- cookies ---

#[tokio::test]
async fn returned_cookies_are_sent_on_next_call() {
    let (server, cnx) = start().await;

    let resp = cnx
        .submit(&Request::get("/cookies/set?token=abc&theme=dark"))
        .await
        .unwrap();
    assert_eq!(resp.cookies.len(), 2);
    assert_eq!(resp.cookies[0].name, "token");
    assert_eq!(resp.cookies[0].value, "abc");
    assert_eq!(resp.cookies[0].path.as_deref(), Some("/"));
    assert_eq!(resp.cookies[1].name, "theme");

    let echo: Echo = cnx
        .submit(&Request::get("/anything"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(echo.cookies["token"], "abc");
    assert_eq!(echo.cookies["theme"], "dark");

    let fresh = connect(&server.url());
    let echo: Echo = fresh
        .submit(&Request::get("/anything"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert!(echo.cookies.is_empty());
}

#[tokio::test]
async fn session_cookie_respects_path_scope() {
    let (server, cnx) = start().await;

    let login: Session = cnx
        .submit(&Request::get("/session/login"))
        .await
        .unwrap()
        .json()
        .unwrap();

    let resp = cnx.submit(&Request::get("/session/whoami")).await.unwrap();
    assert_eq!(resp.status_code, 200);
    let me: Session = resp.json().unwrap();
    assert_eq!(me.session, login.session);

    // cookie is scoped to /session
    let echo: Echo = cnx
        .submit(&Request::get("/elsewhere"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert!(!echo.cookies.contains_key("session"));

    let fresh = connect(&server.url());
    let resp = fresh.submit(&Request::get("/session/whoami")).await.unwrap();
    assert_eq!(resp.status_code, 401);
    assert_eq!(resp.status, "401 Unauthorized");
}

#[tokio::test]
async fn cookie_set_on_redirect_is_replayed() {
    let (_server, cnx) = start().await;

    let req = Request::get("/redirect")
        .with_query("to", "/landing")
        .with_query("cookie", "hop=1; Path=/");
    let resp = cnx.submit(&req).await.unwrap();

    assert_eq!(resp.status_code, 200);
    // the redirected request already carries the cookie
    let echo: Echo = resp.json().unwrap();
    assert_eq!(echo.path, "/landing");
    assert_eq!(echo.cookies["hop"], "1");
    assert!(resp.cookies.is_empty());

    let echo: Echo = cnx
        .submit(&Request::get("/later"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(echo.cookies["hop"], "1");
}

#[tokio::test]
async fn redirect_cookie_keeps_its_path_scope() {
    let (_server, cnx) = start().await;

    let req = Request::get("/redirect")
        .with_query("to", "/area/home")
        .with_query("cookie", "area=1; Path=/area");
    let echo: Echo = cnx.submit(&req).await.unwrap().json().unwrap();
    assert_eq!(echo.path, "/area/home");
    assert_eq!(echo.cookies["area"], "1");

    let echo: Echo = cnx
        .submit(&Request::get("/elsewhere"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert!(!echo.cookies.contains_key("area"));

    let echo: Echo = cnx
        .submit(&Request::get("/area/profile"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(echo.cookies["area"], "1");
}

#[tokio::test]
async fn caller_client_stores_cookies_from_final_response() {
    let (server, _) = start().await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let cnx = Connection::with_client(server.url(), client);

    let req = Request::get("/redirect")
        .with_query("to", "/cookies/set?token=abc")
        .with_query("cookie", "hop=1; Path=/");
    let resp = cnx.submit(&req).await.unwrap();
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.cookie("token").map(|c| c.value.as_str()), Some("abc"));

    let echo: Echo = cnx
        .submit(&Request::get("/anything"))
        .await
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(echo.cookies["token"], "abc");
    // hops the caller's client followed on its own are not recorded
    assert!(!echo.cookies.contains_key("hop"));
}

#[tokio::test]
async fn caller_cookie_header_is_merged_with_stored_cookies() {
    let (_server, cnx) = start().await;
    cnx.submit(&Request::get("/cookies/set?stored=1")).await.unwrap();

    let echo: Echo = cnx
        .submit(&Request::get("/echo").with_header("cookie", "manual=2"))
        .await
        .unwrap()
        .json()
        .unwrap();

    assert_eq!(echo.cookies["stored"], "1");
    assert_eq!(echo.cookies["manual"], "2");
}

// --- cancellation ---

#[tokio::test]
async fn cancel_returns_promptly() {
    let (_server, cnx) = start().await;
    let (ctx, token) = Context::with_cancel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = cnx
        .execute(&ctx, &Request::get("/slow?ms=10000"))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert_eq!(err.stage(), Stage::Dispatch);
    assert!(err.is_canceled(), "{err}");
}

#[tokio::test]
async fn deadline_returns_timeout() {
    let (_server, cnx) = start().await;
    let ctx = Context::with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let err = cnx
        .execute(&ctx, &Request::get("/slow?ms=10000"))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert!(err.is_timeout(), "{err}");
    assert!(matches!(err, Error::Dispatch { .. }));
}

#[tokio::test]
async fn already_canceled_context_never_dispatches() {
    let (_server, cnx) = start().await;
    let ctx = Context::background();
    ctx.cancel();

    let err = cnx.execute(&ctx, &Request::get("/xyzzy")).await.unwrap_err();

    assert!(err.is_canceled());
}

#[tokio::test]
async fn connection_stays_usable_after_cancel() {
    let (_server, cnx) = start().await;
    let ctx = Context::with_timeout(Duration::from_millis(50));
    let _ = cnx.execute(&ctx, &Request::get("/slow?ms=10000")).await;

    let resp = cnx.submit(&Request::get("/after")).await.unwrap();

    assert_eq!(resp.status_code, 200);
}

// --- transport failures ---

#[tokio::test]
async fn stopped_backend_is_connection_refused() {
    let (server, _) = start().await;
    let cnx = connect(&server.url());
    server.shutdown().await;

    let err = cnx.submit(&Request::get("/xyzzy")).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Dispatch);
    assert_eq!(err.kind(), Some(FailureKind::Refused), "{err}");
    assert!(err.is_connect());
}

#[tokio::test]
async fn close_before_response_is_reset() {
    init_tracing();
    let url = one_shot_server(b"").await;
    let cnx = connect(&url);

    let err = cnx.submit(&Request::get("/xyzzy")).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Dispatch);
    assert_eq!(err.kind(), Some(FailureKind::Reset), "{err}");
}

#[tokio::test]
async fn truncated_body_is_a_body_error() {
    init_tracing();
    let url =
        one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort")
            .await;
    let cnx = connect(&url);

    let err = cnx.submit(&Request::get("/xyzzy")).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Body, "{err}");
    assert_eq!(err.kind(), Some(FailureKind::Reset), "{err}");
}

#[tokio::test]
async fn unknown_host_is_dns_failure() {
    init_tracing();
    let cnx = connect("http://courier-test.invalid");

    let err = cnx.submit(&Request::get("/")).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Dispatch);
    assert_eq!(err.kind(), Some(FailureKind::Dns), "{err}");
    assert_eq!(err.base_url(), "http://courier-test.invalid");
}

// --- pool ---

#[tokio::test]
async fn close_idle_connections_forces_a_new_connection() {
    let (_server, cnx) = start().await;

    let before: Echo = cnx.submit(&Request::get("/peer")).await.unwrap().json().unwrap();
    cnx.close_idle_connections();
    let after: Echo = cnx.submit(&Request::get("/peer")).await.unwrap().json().unwrap();

    assert!(before.peer.is_some());
    assert_ne!(before.peer, after.peer);
}

#[tokio::test]
async fn concurrent_calls_share_a_connection() {
    let (_server, cnx) = start().await;
    let cnx = Arc::new(cnx);

    let calls = (0..32).map(|i| {
        let cnx = cnx.clone();
        tokio::spawn(async move {
            let req = Request::get(format!("/fan/{i}"));
            cnx.execute(&Context::with_timeout(Duration::from_secs(10)), &req)
                .await
        })
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        let echo: Echo = result.unwrap().json().unwrap();
        assert_eq!(echo.path, format!("/fan/{i}"));
    }
}

async fn join_all<T>(
    handles: impl Iterator<Item = tokio::task::JoinHandle<courier_core::Result<T>>>,
) -> Vec<courier_core::Result<T>> {
    let mut out = Vec::new();
    for handle in handles.collect::<Vec<_>>() {
        out.push(handle.await.unwrap());
    }
    out
}
