use std::net::SocketAddr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use donation_ledger::ledger::balance_of;
use donation_ledger::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn connect(server: &MockServer) -> DonationApp {
    let backend =
        BackendConfig::new(&server.uri(), "anon", "ai-key").with_completion_url(&server.uri());
    DonationApp::connect(&backend, AppConfig::default())
        .await
        .unwrap()
}

fn account_row(points: u64, version: u64) -> serde_json::Value {
    json!([{
        "id": "u1",
        "email": "ana@example.org",
        "displayName": "Ana",
        "points": points,
        "_version": version
    }])
}

#[tokio::test]
async fn test_connect_forwards_session_token_to_store() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "user-token",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh",
            "user": { "id": "u1", "email": "ana@example.org" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .and(header("authorization", "Bearer user-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account_row(15, 2)))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account_row(15, 2)))
        .mount(&server)
        .await;

    let app = connect(&server).await;
    let session = app
        .accounts()
        .sign_in("ana@example.org", "secret1")
        .await
        .unwrap();
    assert_eq!(session.role(), Role::Member);

    // let the forwarding task pick up the new session
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.ledger().balance("u1").await.unwrap(), 15);
}

#[tokio::test]
async fn test_post_offer_is_one_commit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .and(query_param("id", "eq.u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account_row(10, 4)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/commit_documents"))
        .and(body_partial_json(json!({
            "preconditions": [{ "collection": "users", "id": "u1", "version": 4 }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commit_time": "2024-05-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = connect(&server).await;
    let offer = app
        .offers()
        .post("u1", OfferDraft::new("Rice", "Food", 5, "Ana"))
        .await
        .unwrap();

    assert_eq!(
        offer.created_at,
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_stale_account_version_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account_row(25, 9)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/commit_documents"))
        .respond_with(ResponseTemplate::new(409).set_body_string("version mismatch"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/commit_documents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let app = connect(&server).await;
    let record = app
        .redemptions()
        .redeem_by_id("u1", "canteen-voucher", "Ana Cruz", "10-B")
        .await
        .unwrap();
    assert_eq!(record.item_points, 20);
}

/// A realtime endpoint that acknowledges every join and pushes `event` on demand
async fn realtime_endpoint(event: oneshot::Receiver<Value>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut event = Some(event);
        loop {
            tokio::select! {
                incoming = ws.next() => {
                    let Some(Ok(Message::Text(text))) = incoming else { break };
                    let message: Value = serde_json::from_str(&text).unwrap();
                    if message["event"] == "phx_join" {
                        let reply = json!({
                            "topic": message["topic"],
                            "event": "phx_reply",
                            "payload": { "status": "ok", "response": {} },
                            "ref": message["ref"]
                        });
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                }
                Ok(pushed) = async { event.as_mut().unwrap().await }, if event.is_some() => {
                    event = None;
                    ws.send(Message::Text(pushed.to_string())).await.unwrap();
                }
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_balance_view_follows_confirmation_from_another_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account_row(15, 2)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account_row(20, 3)))
        .mount(&server)
        .await;

    let (push, pushed) = oneshot::channel();
    let realtime = realtime_endpoint(pushed).await;
    let backend = BackendConfig::new(&server.uri(), "anon", "ai-key")
        .with_completion_url(&server.uri())
        .with_realtime_url(&format!("http://{}", realtime));
    let app = DonationApp::connect(&backend, AppConfig::default())
        .await
        .unwrap();

    let mut balance = app.ledger().watch_balance("u1").await.unwrap();
    assert_eq!(balance_of(&balance.recv().await.unwrap()), Some(15));

    // an administrator confirmed an offer from their own client
    push.send(json!({
        "topic": "realtime:public:users",
        "event": "postgres_changes",
        "payload": { "data": { "table": "users", "type": "UPDATE" } },
        "ref": null
    }))
    .unwrap();

    let next = tokio::time::timeout(Duration::from_secs(2), balance.recv())
        .await
        .expect("balance view missed a remote change")
        .unwrap();
    assert_eq!(balance_of(&next), Some(20));
}
