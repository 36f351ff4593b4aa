/// HTTP backend tests
/// HttpBackend against a stub REST server on a local port

extern crate swapchat_core;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use swapchat_core::negotiation_types::{
    CompletionOutcome, ItemId, ItemRef, RequestDraft, RequestId, RequestStatus, SessionId,
    SessionPhase, UserId,
};
use swapchat_core::{partition, Backend, Config, HttpBackend, NegotiationSession, SwapError};
use tokio::net::TcpListener;

const TOKEN: &str = "t0k3n";

const ANA: &str = r#"{"id": 1, "username": "ana", "first_name": "Ana", "last_name": "Lima"}"#;
const BIA: &str = r#"{"id": 2, "username": "bia", "first_name": "Bia"}"#;

fn request_json(id: u32, requester: &str, recipient: &str, status: &str, chat: &str) -> String {
    format!(
        r#"{{"id": {id}, "requester": {requester}, "recipient": {recipient},
            "item": {{"id": 42, "title": "Dom Casmurro", "author": "Machado de Assis"}},
            "message": "trade?", "status": "{status}",
            "created_at": "2026-10-01T09:30:00Z", "session_id": {chat}}}"#
    )
}

fn reply(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn route(req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(&format!("Bearer {}", TOKEN)[..]);
    if !authorized {
        return Ok(reply(StatusCode::UNAUTHORIZED, r#"{"detail": "no"}"#.to_string()));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();

    let response = match (method, path.as_str()) {
        (Method::GET, "/current-user/") => reply(StatusCode::OK, ANA.to_string()),
        (Method::GET, "/negotiation-requests/") => reply(
            StatusCode::OK,
            format!(
                "[{}, {}]",
                request_json(7, BIA, ANA, "pending", "null"),
                request_json(8, ANA, BIA, "accepted", "3")
            ),
        ),
        (Method::POST, "/negotiation-requests/") => {
            let draft: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            if draft["requester_id"] == "1" && draft["recipient_id"] == "2" && draft["item_id"] == "42" {
                reply(StatusCode::CREATED, request_json(9, ANA, BIA, "pending", "null"))
            } else {
                reply(StatusCode::BAD_REQUEST, String::new())
            }
        }
        (Method::PATCH, "/negotiation-requests/7/") => {
            let decision: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            if decision["accepted"] == true {
                reply(StatusCode::OK, request_json(7, BIA, ANA, "accepted", "3"))
            } else {
                reply(StatusCode::OK, request_json(7, BIA, ANA, "rejected", "null"))
            }
        }
        (Method::PATCH, "/negotiation-requests/8/") => {
            reply(StatusCode::CONFLICT, "accepted".to_string())
        }
        (Method::GET, "/sessions/3/") => reply(
            StatusCode::OK,
            format!(
                r#"{{"id": 3, "title": "Dom Casmurro", "participants": [{ANA}, {BIA}],
                    "receiver": "ana", "state": "open",
                    "messages": [
                        {{"message": "hi", "sender_username": "bia", "time": "2026-10-02T10:00:00Z"}},
                        {{"message": "", "sender": "bia", "time": "2026-10-02T10:00:01Z"}},
                        {{"message": "hello", "sender": "ana", "time": "2026-10-02T10:00:02.500Z"}}
                    ]}}"#
            ),
        ),
        (Method::GET, "/sessions/4/") => reply(
            StatusCode::OK,
            format!(r#"{{"id": 99, "participants": [{ANA}, {BIA}], "receiver": "ana"}}"#),
        ),
        (Method::POST, "/sessions/3/complete/") => {
            reply(StatusCode::OK, r#"{"status": "awaiting-counterpart"}"#.to_string())
        }
        (Method::GET, "/profiles/1/exchange-history/") => reply(
            StatusCode::OK,
            r#"[{"id": 8, "requester": "ana", "recipient": "bia", "item": "Dom Casmurro",
                 "date": "2026-09-15T00:00:00Z", "status": "completed", "rating": 5, "score": 10}]"#
                .to_string(),
        ),
        (Method::GET, "/profiles/500/exchange-history/") => {
            reply(StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
        _ => reply(StatusCode::NOT_FOUND, String::new()),
    };
    Ok(response)
}

async fn spawn_stub() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(route))
                    .await;
            });
        }
    });
    addr
}

fn backend_for(addr: SocketAddr, token: Option<&str>) -> HttpBackend {
    let config = Config {
        api_base_url: format!("http://{}", addr),
        token: token.map(str::to_string),
        ..Config::default()
    };
    HttpBackend::new(config).unwrap()
}

#[tokio::test]
async fn test_auth_mapping() {
    let addr = spawn_stub().await;

    let ana = backend_for(addr, Some(TOKEN)).current_user().await.unwrap();
    assert_eq!(ana.id, UserId::new("1"));
    assert_eq!(ana.display_name(), "Ana Lima (ana)");

    let err = backend_for(addr, Some("stale")).current_user().await.unwrap_err();
    assert!(matches!(err, SwapError::NotAuthenticated));

    let err = backend_for(addr, None).list_requests().await.unwrap_err();
    assert!(matches!(err, SwapError::NotAuthenticated));
}

#[tokio::test]
async fn test_requests_listed_and_partitioned() {
    let addr = spawn_stub().await;
    let backend = backend_for(addr, Some(TOKEN));

    let all = backend.list_requests().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].session_id, Some(SessionId::new("3")));

    let parts = partition(all, &UserId::new("1"));
    assert_eq!(parts.received.len(), 1);
    assert_eq!(parts.received[0].id, RequestId::new("7"));
    assert_eq!(parts.sent.len(), 1);
    assert!(parts.sent[0].is_chat_ready());
}

#[tokio::test]
async fn test_create_and_respond() {
    let addr = spawn_stub().await;
    let backend = backend_for(addr, Some(TOKEN));

    let item = ItemRef {
        id: ItemId::new("42"),
        title: "Dom Casmurro".to_string(),
        author: String::new(),
    };
    let draft = RequestDraft::new(&UserId::new("1"), &UserId::new("2"), &item, "trade?").unwrap();
    let created = backend.create_request(&draft).await.unwrap();
    assert_eq!(created.status, RequestStatus::Pending);

    let accepted = backend
        .respond_request(&RequestId::new("7"), true)
        .await
        .unwrap();
    assert!(accepted.is_chat_ready());

    let err = backend
        .respond_request(&RequestId::new("8"), false)
        .await
        .unwrap_err();
    assert!(err.is_state_violation());
}

#[tokio::test]
async fn test_bootstrap_joins_session_and_identity() {
    let addr = spawn_stub().await;
    let backend = backend_for(addr, Some(TOKEN));

    let bootstrap = backend.bootstrap_session(&SessionId::new("3")).await.unwrap();
    assert_eq!(bootstrap.identity.username, "ana");
    assert_eq!(bootstrap.completion_authority, "ana");
    assert_eq!(bootstrap.phase, SessionPhase::Open);
    // The empty line is dropped, the rest keep server order
    let contents: Vec<_> = bootstrap.history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hi", "hello"]);

    let session = NegotiationSession::from_bootstrap(bootstrap).unwrap();
    assert_eq!(session.counterpart().username, "bia");
    assert!(session.can_complete());
    assert_eq!(session.timeline().len(), 2);
}

#[tokio::test]
async fn test_bootstrap_rejects_mismatch_and_missing() {
    let addr = spawn_stub().await;
    let backend = backend_for(addr, Some(TOKEN));

    let err = backend.bootstrap_session(&SessionId::new("4")).await.unwrap_err();
    assert!(matches!(err, SwapError::Protocol(_)));

    let err = backend.bootstrap_session(&SessionId::new("404")).await.unwrap_err();
    assert!(matches!(err, SwapError::NotFound(_)));
}

#[tokio::test]
async fn test_complete_and_history() {
    let addr = spawn_stub().await;
    let backend = backend_for(addr, Some(TOKEN));

    let outcome = backend.complete_session(&SessionId::new("3")).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::AwaitingCounterpart);

    let history = backend.exchange_history(&UserId::new("1")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rating, Some(5));

    let err = backend
        .exchange_history(&UserId::new("500"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}
