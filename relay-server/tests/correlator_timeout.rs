//! Exercises the correlator's timeout and session-closed paths without
//! waiting out the real 30-second default deadline.

use std::sync::Arc;
use std::time::Duration;

use relay_server::correlator::{Correlator, CorrelatorError, PublicRequest};
use relay_server::routing::{RoutingTable, Session};
use relay_server::stats::NullObserver;

fn request(tunnel_id: &str) -> PublicRequest {
    PublicRequest {
        tunnel_id: tunnel_id.to_string(),
        method: "GET".into(),
        path: "/".into(),
        headers: vec![],
        body: vec![],
    }
}

#[tokio::test]
async fn a_request_that_never_gets_a_response_times_out() {
    let routing = Arc::new(RoutingTable::new());
    let (session, mut outbound_rx) = Session::new("agent".into(), None);
    routing.register(session).await;

    // Drain the outbound channel so the session's mpsc never backs up,
    // but never answer the request.
    tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });

    let correlator = Correlator::with_deadline(routing, Arc::new(NullObserver), Duration::from_millis(50));
    let err = correlator.dispatch(request("agent")).await.unwrap_err();
    assert!(matches!(err, CorrelatorError::Timeout));
}

#[tokio::test]
async fn a_response_delivered_before_the_deadline_resolves_the_request() {
    let routing = Arc::new(RoutingTable::new());
    let (session, mut outbound_rx) = Session::new("agent".into(), None);
    routing.register(session).await;

    let correlator = Arc::new(Correlator::with_deadline(
        routing,
        Arc::new(NullObserver),
        Duration::from_secs(5),
    ));

    let responder = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            let relay_protocol::Message::Request { request_id, .. } = outbound_rx.recv().await.unwrap() else {
                panic!("expected a request message");
            };
            correlator.resolve_response(
                &request_id,
                relay_protocol::ResponseData {
                    status: 200,
                    headers: vec![],
                    body: "ok".into(),
                    is_binary: false,
                },
            );
        })
    };

    let response = correlator.dispatch(request("agent")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
    responder.await.unwrap();
}

#[tokio::test]
async fn fail_all_for_session_unblocks_every_pending_request_for_that_tunnel() {
    let routing = Arc::new(RoutingTable::new());
    let (session, mut outbound_rx) = Session::new("agent".into(), None);
    routing.register(session).await;
    tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });

    let correlator = Arc::new(Correlator::with_deadline(
        routing,
        Arc::new(NullObserver),
        Duration::from_secs(30),
    ));

    let dispatcher = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.dispatch(request("agent")).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    correlator.fail_all_for_session("agent");

    let err = tokio::time::timeout(Duration::from_secs(2), dispatcher)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::AgentError(_)));
}
