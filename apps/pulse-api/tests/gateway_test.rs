mod common;

use std::time::Duration;

use pulse_api::config::{AuthMode, Config};
use pulse_api::db::entity::EntityStore;
use pulse_api::notify::job::NOTIFICATION_QUEUE;
use pulse_api::notify::queue::QueueTransport;
use pulse_common::RoomId;
use serde_json::json;

use common::{
    assert_no_event, connect, connect_as, mint_expired_token, next_close, next_event, send,
    start_server, test_context, TEST_SECRET,
};

const QUIET: Duration = Duration::from_millis(200);

fn chat_config() -> Config {
    let mut config = Config::for_tests(TEST_SECRET);
    config.service = pulse_api::config::ServiceKind::Chat;
    config
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn token_on_upgrade_returns_ready() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;

    let mut ws = connect(addr, Some(&common::mint_token("alice"))).await;
    let ready = next_event(&mut ws, "ready").await;
    assert_eq!(ready["data"]["userId"], "alice");
    assert!(ready["data"]["connectionId"]
        .as_str()
        .unwrap()
        .starts_with("conn_"));

    // Presence is written before the user is announced.
    next_event(&mut ws, "userOnline").await;
    assert!(ctx.state.gateway.presence().is_online("alice").await);
}

#[tokio::test]
async fn identify_frame_authenticates() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;

    let mut ws = connect(addr, None).await;
    send(
        &mut ws,
        "identify",
        json!({ "token": common::mint_token("bob") }),
        None,
    )
    .await;
    let ready = next_event(&mut ws, "ready").await;
    assert_eq!(ready["data"]["userId"], "bob");
}

#[tokio::test]
async fn expired_token_is_rejected_with_4004() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;

    let mut ws = connect(addr, Some(&mint_expired_token("alice"))).await;
    let rejected = next_event(&mut ws, "unauthorized").await;
    assert_eq!(rejected["data"]["message"], "Invalid or expired token");

    let close = next_close(&mut ws).await.expect("close frame");
    assert_eq!(u16::from(close.code), 4004);
    let registry_empty = || ctx.state.gateway.registry().is_empty();
    common::eventually(registry_empty).await;
}

#[tokio::test]
async fn first_frame_must_be_identify_when_auth_is_required() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;

    let mut ws = connect(addr, None).await;
    send(&mut ws, "heartbeat", json!({}), None).await;
    let rejected = next_event(&mut ws, "unauthorized").await;
    assert_eq!(rejected["data"]["message"], "Missing credential");
    let close = next_close(&mut ws).await.expect("close frame");
    assert_eq!(u16::from(close.code), 4004);
    assert_eq!(close.reason.as_str(), "Missing credential");
}

#[tokio::test]
async fn observer_can_heartbeat_but_not_join() {
    let mut config = chat_config();
    config.auth_mode = AuthMode::Optional;
    let ctx = test_context(config);
    ctx.entities.add_conversation("c1", &["alice"]);
    let addr = start_server(ctx.state.clone()).await;

    let mut ws = connect(addr, None).await;
    send(&mut ws, "heartbeat", json!({}), None).await;
    next_event(&mut ws, "heartbeatAck").await;

    send(&mut ws, "joinConversation", json!({ "conversationId": "c1" }), Some("j1")).await;
    let err = next_event(&mut ws, "error").await;
    assert_eq!(err["data"]["code"], "UNAUTHORIZED");
    assert_eq!(err["data"]["ref"], "j1");
    assert_eq!(err["data"]["event"], "joinConversation");
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_is_answered_with_heartbeat_ack() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;
    let mut ws = connect_as(addr, "alice").await;

    send(&mut ws, "heartbeat", json!({}), None).await;
    let ack = next_event(&mut ws, "heartbeatAck").await;
    assert_eq!(ack["data"], json!({}));
}

#[tokio::test]
async fn bad_frames_produce_error_events_and_keep_the_connection() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;
    let mut ws = connect_as(addr, "alice").await;

    send(&mut ws, "teleport", json!({}), Some("r1")).await;
    let err = next_event(&mut ws, "error").await;
    assert_eq!(err["data"]["event"], "teleport");
    assert_eq!(err["data"]["code"], "BAD_REQUEST");
    assert_eq!(err["data"]["ref"], "r1");

    send(&mut ws, "joinConversation", json!({ "wrong": 1 }), None).await;
    let err = next_event(&mut ws, "error").await;
    assert_eq!(err["data"]["code"], "BAD_REQUEST");

    {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;
        ws.send(Message::Text("not json".to_string().into()))
            .await
            .unwrap();
    }
    let err = next_event(&mut ws, "error").await;
    assert_eq!(err["data"]["event"], "unknown");

    send(&mut ws, "heartbeat", json!({}), None).await;
    next_event(&mut ws, "heartbeatAck").await;
}

// ---------------------------------------------------------------------------
// Rooms and messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn messaging_scenario() {
    let ctx = test_context(chat_config());
    ctx.entities.add_user("alice", "alice");
    ctx.entities.add_user("bob", "bob");
    ctx.entities.add_conversation("c1", &["alice", "bob"]);
    let addr = start_server(ctx.state.clone()).await;

    let mut alice = connect_as(addr, "alice").await;
    let mut bob = connect_as(addr, "bob").await;

    send(&mut alice, "joinConversation", json!({ "conversationId": "c1" }), Some("j")).await;
    let ack = next_event(&mut alice, "ack").await;
    assert_eq!(ack["data"]["data"]["room"], "conversation:c1");
    send(&mut bob, "joinConversation", json!({ "conversationId": "c1" }), Some("j")).await;
    next_event(&mut bob, "ack").await;

    send(
        &mut alice,
        "sendMessage",
        json!({ "conversationId": "c1", "content": "  hello bob  " }),
        Some("m1"),
    )
    .await;

    let delivered = next_event(&mut bob, "newMessage").await;
    let message_id = delivered["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(delivered["data"]["content"], "hello bob");
    assert_eq!(delivered["data"]["senderId"], "alice");
    assert_eq!(delivered["data"]["sender"]["handle"], "alice");

    // The broadcast carries the persisted record.
    let stored = ctx
        .state
        .entities
        .get_message(&message_id)
        .await
        .unwrap()
        .expect("message persisted");
    assert_eq!(stored.conversation_id, "c1");

    // The sender is in the room too, and also gets an ack.
    let echoed = next_event(&mut alice, "newMessage").await;
    assert_eq!(echoed["data"]["id"], message_id.as_str());
    let ack = next_event(&mut alice, "ack").await;
    assert_eq!(ack["data"]["ref"], "m1");
    assert_eq!(ack["data"]["data"]["id"], message_id.as_str());

    let unread = ctx.state.unread.counts("bob").await;
    assert_eq!(unread.get("c1"), Some(&1));
    assert!(ctx.state.unread.counts("alice").await.is_empty());

    send(
        &mut bob,
        "markRead",
        json!({ "conversationId": "c1", "messageId": message_id }),
        Some("r"),
    )
    .await;
    next_event(&mut bob, "ack").await;

    let read = next_event(&mut alice, "messageRead").await;
    assert_eq!(read["data"]["userId"], "bob");
    assert_eq!(read["data"]["messageId"], message_id.as_str());
    assert_no_event(&mut bob, "messageRead", QUIET).await;

    assert_eq!(ctx.entities.last_read("bob", "c1"), Some(message_id));
    assert!(ctx.state.unread.counts("bob").await.get("c1").is_none());
}

#[tokio::test]
async fn non_participant_cannot_join_or_send() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice", "bob"]);
    let addr = start_server(ctx.state.clone()).await;
    let mut eve = connect_as(addr, "eve").await;

    send(&mut eve, "joinConversation", json!({ "conversationId": "c1" }), None).await;
    let err = next_event(&mut eve, "error").await;
    assert_eq!(err["data"]["code"], "FORBIDDEN");

    send(
        &mut eve,
        "sendMessage",
        json!({ "conversationId": "c1", "content": "hi" }),
        None,
    )
    .await;
    let err = next_event(&mut eve, "error").await;
    assert_eq!(err["data"]["code"], "FORBIDDEN");
    assert!(ctx
        .state
        .gateway
        .registry()
        .room_members(&RoomId::conversation("c1"))
        .is_empty());
}

#[tokio::test]
async fn room_fanout_is_isolated() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice", "bob"]);
    ctx.entities.add_conversation("c2", &["carol", "bob"]);
    let addr = start_server(ctx.state.clone()).await;

    let mut alice = connect_as(addr, "alice").await;
    let mut carol = connect_as(addr, "carol").await;
    // Bob participates in c1 but never joins the room.
    let mut bob = connect_as(addr, "bob").await;

    send(&mut alice, "joinConversation", json!({ "conversationId": "c1" }), None).await;
    next_event(&mut alice, "ack").await;
    send(&mut carol, "joinConversation", json!({ "conversationId": "c2" }), None).await;
    next_event(&mut carol, "ack").await;

    send(
        &mut alice,
        "sendMessage",
        json!({ "conversationId": "c1", "content": "only c1" }),
        None,
    )
    .await;
    next_event(&mut alice, "newMessage").await;

    assert_no_event(&mut carol, "newMessage", QUIET).await;
    assert_no_event(&mut bob, "newMessage", QUIET).await;
}

#[tokio::test]
async fn empty_message_without_attachment_is_rejected() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice"]);
    let addr = start_server(ctx.state.clone()).await;
    let mut alice = connect_as(addr, "alice").await;

    send(
        &mut alice,
        "sendMessage",
        json!({ "conversationId": "c1", "content": "   " }),
        Some("m"),
    )
    .await;
    let err = next_event(&mut alice, "error").await;
    assert_eq!(err["data"]["code"], "BAD_REQUEST");
    assert_eq!(err["data"]["event"], "sendMessage");

    send(
        &mut alice,
        "sendMessage",
        json!({ "conversationId": "c1", "attachmentUrl": "https://cdn.example.com/a.png" }),
        Some("m2"),
    )
    .await;
    let ack = next_event(&mut alice, "ack").await;
    assert_eq!(ack["data"]["ref"], "m2");
    assert!(ack["data"]["data"]["content"].is_null());
}

#[tokio::test]
async fn mark_read_rejects_message_from_other_conversation() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice"]);
    ctx.entities.add_conversation("c2", &["alice"]);
    let addr = start_server(ctx.state.clone()).await;
    let mut alice = connect_as(addr, "alice").await;

    send(
        &mut alice,
        "sendMessage",
        json!({ "conversationId": "c2", "content": "elsewhere" }),
        None,
    )
    .await;
    let ack = next_event(&mut alice, "ack").await;
    let other_id = ack["data"]["data"]["id"].as_str().unwrap().to_string();

    send(
        &mut alice,
        "markRead",
        json!({ "conversationId": "c1", "messageId": other_id }),
        None,
    )
    .await;
    let err = next_event(&mut alice, "error").await;
    assert_eq!(err["data"]["code"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typing_reaches_everyone_else_in_the_room() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice", "bob"]);
    let addr = start_server(ctx.state.clone()).await;
    let mut alice = connect_as(addr, "alice").await;
    let mut bob = connect_as(addr, "bob").await;

    for ws in [&mut alice, &mut bob] {
        send(ws, "joinConversation", json!({ "conversationId": "c1" }), None).await;
        next_event(ws, "ack").await;
    }

    send(&mut alice, "typing", json!({ "conversationId": "c1" }), None).await;
    next_event(&mut alice, "ack").await;
    let typing = next_event(&mut bob, "userTyping").await;
    assert_eq!(typing["data"]["userId"], "alice");
    assert_eq!(typing["data"]["conversationId"], "c1");
    assert_eq!(
        ctx.state.typing.typing_users(&RoomId::conversation("c1")).await,
        vec!["alice".to_string()]
    );

    send(&mut alice, "stopTyping", json!({ "conversationId": "c1" }), None).await;
    next_event(&mut alice, "ack").await;
    next_event(&mut bob, "userStoppedTyping").await;
    assert!(ctx
        .state
        .typing
        .typing_users(&RoomId::conversation("c1"))
        .await
        .is_empty());

    assert_no_event(&mut alice, "userTyping", QUIET).await;
}

#[tokio::test]
async fn typing_requires_a_joined_room() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice"]);
    let addr = start_server(ctx.state.clone()).await;
    let mut alice = connect_as(addr, "alice").await;

    send(&mut alice, "typing", json!({ "conversationId": "c1" }), None).await;
    let err = next_event(&mut alice, "error").await;
    assert_eq!(err["data"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn participants_without_a_connection_get_a_message_notification() {
    let ctx = test_context(chat_config());
    ctx.entities.add_conversation("c1", &["alice", "bob", "carol"]);
    let addr = start_server(ctx.state.clone()).await;

    let mut alice = connect_as(addr, "alice").await;
    let _bob = connect_as(addr, "bob").await;
    send(&mut alice, "joinConversation", json!({ "conversationId": "c1" }), Some("j")).await;
    next_event(&mut alice, "ack").await;

    send(
        &mut alice,
        "sendMessage",
        json!({ "conversationId": "c1", "content": "standup?" }),
        Some("m1"),
    )
    .await;
    let ack = next_event(&mut alice, "ack").await;
    assert_eq!(ack["data"]["ref"], "m1");

    assert_eq!(ctx.queue.pending(NOTIFICATION_QUEUE).await, 1);
    let delivery = ctx.queue.reserve(NOTIFICATION_QUEUE).await.unwrap().unwrap();
    assert_eq!(delivery.job.payload["type"], "MESSAGE");
    assert_eq!(delivery.job.payload["actorId"], "alice");
    assert_eq!(delivery.job.payload["recipientId"], "carol");
    assert_eq!(delivery.job.payload["metadata"]["channelId"], "c1");
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn last_connection_closing_announces_offline() {
    let ctx = test_context(chat_config());
    let addr = start_server(ctx.state.clone()).await;

    let mut bob = connect_as(addr, "bob").await;
    let mut first = connect_as(addr, "alice").await;
    let mut second = connect_as(addr, "alice").await;
    next_event(&mut second, "userOnline").await;

    first.close(None).await.unwrap();
    assert_no_event(&mut bob, "userOffline", QUIET).await;
    assert!(ctx.state.gateway.presence().is_online("alice").await);

    second.close(None).await.unwrap();
    let offline = next_event(&mut bob, "userOffline").await;
    assert_eq!(offline["data"]["userId"], "alice");
    assert!(!ctx.state.gateway.presence().is_online("alice").await);
    assert!(ctx.state.gateway.registry().user_connections("alice").is_empty());
}
