mod support;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::SinkExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite};
use tower::ServiceExt;
use uuid::Uuid;

use support::{build_router, next_event, send_json, TestServer};

#[tokio::test]
async fn health_and_missing_credentials() {
    let (router, _) = build_router().await;

    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let room_id = Uuid::new_v4();
    let response = router
        .oneshot(
            Request::get(format!("/api/v1/rooms/{room_id}/messages"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn websocket_rejects_invalid_token_before_upgrade() {
    let server = TestServer::start().await;

    for url in [
        format!("{}/api/v1/ws?token=garbage", server.base_ws),
        format!("{}/api/v1/ws", server.base_ws),
    ] {
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16())
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("upgrade must fail"),
        }
    }
}

#[tokio::test]
async fn direct_room_message_flow() {
    let server = TestServer::start().await;
    let http = Client::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let response = http
        .post(format!("{}/api/v1/rooms/direct", server.base_http))
        .bearer_auth(server.token(alice))
        .json(&json!({ "userId": bob }))
        .send()
        .await
        .expect("create direct");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let room: Value = response.json().await.expect("room json");
    let room_id = room["id"].as_str().expect("room id").to_owned();

    // 反向参数仍是同一个房间
    let again: Value = http
        .post(format!("{}/api/v1/rooms/direct", server.base_http))
        .bearer_auth(server.token(bob))
        .json(&json!({ "userId": alice }))
        .send()
        .await
        .expect("create direct again")
        .json()
        .await
        .expect("room json");
    assert_eq!(again["id"], room["id"]);

    let mut alice_ws = server.connect(alice).await;
    let auth = next_event(&mut alice_ws, "connection.authenticated").await;
    assert_eq!(auth["data"]["rooms"], json!([room_id]));
    let mut bob_ws = server.connect(bob).await;
    next_event(&mut bob_ws, "connection.authenticated").await;

    send_json(
        &mut alice_ws,
        json!({
            "event": "message.send",
            "data": { "roomId": room_id, "content": "hi bob", "type": "text", "tempId": "t-1" }
        }),
    )
    .await;

    let ack = next_event(&mut alice_ws, "ack").await;
    assert_eq!(ack["data"]["tempId"], "t-1");
    assert_eq!(ack["data"]["status"], "sent");
    let received = next_event(&mut bob_ws, "message.received").await;
    assert_eq!(received["data"]["content"], "hi bob");
    assert_eq!(received["data"]["id"], ack["data"]["messageId"]);

    // 输入状态广播到房间
    send_json(
        &mut bob_ws,
        json!({ "event": "typing.start", "data": { "roomId": room_id } }),
    )
    .await;
    let typing = next_event(&mut alice_ws, "typing.user").await;
    assert_eq!(typing["data"]["isTyping"], true);

    let page: Value = http
        .get(format!(
            "{}/api/v1/rooms/{room_id}/messages?limit=10",
            server.base_http
        ))
        .bearer_auth(server.token(bob))
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("history json");
    assert_eq!(page["messages"].as_array().map(Vec::len), Some(1));
    assert_eq!(page["hasMore"], false);

    let outsider = http
        .get(format!("{}/api/v1/rooms/{room_id}/messages", server.base_http))
        .bearer_auth(server.token(Uuid::new_v4()))
        .send()
        .await
        .expect("history");
    assert_eq!(outsider.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = outsider.json().await.expect("error json");
    assert_eq!(body["code"], "NOT_A_MEMBER");
}

#[tokio::test]
async fn malformed_frame_gets_structured_error() {
    let server = TestServer::start().await;
    let mut socket = server.connect(Uuid::new_v4()).await;
    next_event(&mut socket, "connection.authenticated").await;

    send_json(
        &mut socket,
        json!({ "event": "message.send", "data": { "tempId": "t-9" } }),
    )
    .await;
    let error = next_event(&mut socket, "error").await;
    assert_eq!(error["data"]["error"], "VALIDATION_FAILED");
    assert_eq!(error["data"]["tempId"], "t-9");
}

#[tokio::test]
async fn offline_messages_replay_and_last_seen_survives_disconnect() {
    let server = TestServer::start().await;
    let http = Client::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let room: Value = http
        .post(format!("{}/api/v1/rooms/direct", server.base_http))
        .bearer_auth(server.token(alice))
        .json(&json!({ "userId": bob }))
        .send()
        .await
        .expect("create direct")
        .json()
        .await
        .expect("room json");
    let room_id = room["id"].as_str().expect("room id").to_owned();

    // bob 先上线再离开，留下最后在线时间
    let mut bob_ws = server.connect(bob).await;
    next_event(&mut bob_ws, "connection.authenticated").await;
    bob_ws.close(None).await.expect("close");
    drop(bob_ws);

    let presence_url = format!("{}/api/v1/users/{bob}/presence", server.base_http);
    let mut presence = Value::Null;
    for _ in 0..50 {
        presence = http
            .get(&presence_url)
            .bearer_auth(server.token(alice))
            .send()
            .await
            .expect("presence")
            .json()
            .await
            .expect("presence json");
        if presence["status"] == "offline" {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(presence["status"], "offline");
    assert!(presence["lastSeen"].is_string());

    let mut alice_ws = server.connect(alice).await;
    next_event(&mut alice_ws, "connection.authenticated").await;
    send_json(
        &mut alice_ws,
        json!({
            "event": "message.send",
            "data": { "roomId": room_id, "content": "while you were away", "type": "text", "tempId": "t-2" }
        }),
    )
    .await;
    next_event(&mut alice_ws, "ack").await;

    let mut bob_ws = server.connect(bob).await;
    next_event(&mut bob_ws, "connection.authenticated").await;
    let replayed = next_event(&mut bob_ws, "message.received").await;
    assert_eq!(replayed["data"]["content"], "while you were away");
}
