//! End-to-end: a fake agent registers over the control channel, the
//! public HTTP listener forwards a request to it, and the agent answers
//! directly with a `response` message (no local service involved).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use relay_protocol::{Message, MessageStream, RequestData, ResponseData};
use relay_server::control::{self, ControlPlane};
use relay_server::correlator::Correlator;
use relay_server::http::{self, HttpState};
use relay_server::liveness::LivenessTracker;
use relay_server::routing::RoutingTable;
use relay_server::stats::NullObserver;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

struct Harness {
    control_addr: std::net::SocketAddr,
    router: axum::Router,
}

async fn build_harness() -> Harness {
    let routing = Arc::new(RoutingTable::new());
    let observer = Arc::new(NullObserver);
    let correlator = Arc::new(Correlator::new(routing.clone(), observer.clone()));
    let liveness = Arc::new(LivenessTracker::new());
    let plane = Arc::new(ControlPlane::new(routing.clone(), correlator.clone(), liveness, observer, 10));

    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    tokio::spawn(control::run_plain_accept_loop(control_listener, plane));

    let router = http::build_router(HttpState { routing, correlator });

    Harness { control_addr, router }
}

/// Registers a fake agent and spawns a task that answers the next
/// forwarded request with a fixed `ResponseData`.
async fn register_fake_agent(control_addr: std::net::SocketAddr, tunnel_id: &str, response: ResponseData) {
    let stream = TcpStream::connect(control_addr).await.unwrap();
    let MessageStream { mut reader, mut writer } = MessageStream::new(stream);
    writer
        .write_message(&Message::Register { tunnel_id: tunnel_id.to_string(), subdomain: None })
        .await
        .unwrap();
    reader.read_message().await.unwrap().unwrap();

    tokio::spawn(async move {
        loop {
            match reader.read_message().await {
                Ok(Some(Message::Request { request_id, .. })) => {
                    let data = response.encode().unwrap();
                    let _ = writer.write_message(&Message::Response { request_id, data }).await;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn a_path_prefixed_request_reaches_the_registered_agent() {
    let harness = build_harness().await;
    register_fake_agent(
        harness.control_addr,
        "abcd1234",
        ResponseData {
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: "hello from the tunnel".into(),
            is_binary: false,
        },
    )
    .await;

    let request = Request::builder()
        .method("GET")
        .uri("/abcd1234/status")
        .header("host", "edge.example.org")
        .body(Body::empty())
        .unwrap();

    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    assert_eq!(&body[..], b"hello from the tunnel");
}

#[tokio::test]
async fn an_explicit_tunnel_header_wins_over_a_nonmatching_subdomain() {
    let harness = build_harness().await;
    register_fake_agent(
        harness.control_addr,
        "wxyz9999",
        ResponseData {
            status: 201,
            headers: vec![],
            body: "created".into(),
            is_binary: false,
        },
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/anything")
        .header("host", "unrelated.tunnel.local")
        .header("x-tunnel-id", "wxyz9999")
        .body(Body::empty())
        .unwrap();

    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
}

#[tokio::test]
async fn an_unregistered_host_with_no_prefix_match_returns_not_found() {
    let harness = build_harness().await;
    let request = Request::builder()
        .method("GET")
        .uri("/whatever")
        .header("host", "ghost.tunnel.local")
        .body(Body::empty())
        .unwrap();

    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn the_root_path_reports_a_diagnostic_instead_of_404_with_no_sessions() {
    let harness = build_harness().await;
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "edge.example.org")
        .body(Body::empty())
        .unwrap();

    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
}

#[tokio::test]
async fn a_subdomain_match_keeps_the_full_path_unlike_the_prefix_fallback() {
    let harness = build_harness().await;
    let routing_check_tunnel = "sub1";
    let stream = TcpStream::connect(harness.control_addr).await.unwrap();
    let MessageStream { mut reader, mut writer } = MessageStream::new(stream);
    writer
        .write_message(&Message::Register {
            tunnel_id: routing_check_tunnel.to_string(),
            subdomain: Some("alpha".into()),
        })
        .await
        .unwrap();
    reader.read_message().await.unwrap().unwrap();

    let seen_path = Arc::new(tokio::sync::Mutex::new(String::new()));
    let seen_path_clone = seen_path.clone();
    tokio::spawn(async move {
        if let Ok(Some(Message::Request { request_id, data })) = reader.read_message().await {
            let req = RequestData::decode(&data).unwrap();
            *seen_path_clone.lock().await = req.path;
            let resp = ResponseData { status: 200, headers: vec![], body: String::new(), is_binary: false };
            let _ = writer.write_message(&Message::Response { request_id, data: resp.encode().unwrap() }).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = Request::builder()
        .method("GET")
        .uri("/abcd1234/status?x=1")
        .header("host", "alpha.tunnel.local")
        .body(Body::empty())
        .unwrap();
    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(&*seen_path.lock().await, "/abcd1234/status?x=1");
}
