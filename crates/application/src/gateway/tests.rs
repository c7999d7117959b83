use std::time::Duration;

use async_trait::async_trait;
use config::{HistoryConfig, RateLimitConfig, RateLimitRule, RateLimitStrategy};
use domain::{DeliveryStatus, MessageId, MessageKind, RepositoryError};
use serde_json::json;

use super::*;
use crate::clock::ManualClock;
use crate::error::ErrorCode;
use crate::events::{DeleteMessage, EditMessage, RoomAction, SendMessage};
use crate::history_cache::memory::MemoryHistoryCache;
use crate::local_broadcast::LocalEventBus;
use crate::presence::memory::MemoryPresenceStore;
use crate::rate_limiter::memory::MemoryRateLimitStore;
use crate::repository::memory::{
    MemoryLastSeenRepository, MemoryMessageRepository, MemoryRoomRepository,
};
use crate::repository::{MessageRepository, MockMessageRepository};
use crate::services::{DirectoryServiceDependencies, MessageServiceDependencies};
use crate::typing::memory::MemoryTypingTracker;

/// 测试用凭证：令牌就是用户 UUID
struct UuidTokenVerifier;

#[async_trait]
impl TokenVerifier for UuidTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, ApplicationError> {
        token
            .parse::<Uuid>()
            .map(UserId::from)
            .map_err(|_| ApplicationError::AuthenticationFailed("invalid token".into()))
    }
}

struct Harness {
    gateway: ChatGateway,
    directory: Arc<DirectoryService>,
    messages: Arc<MessageService>,
    typing: Arc<MemoryTypingTracker>,
    presence: Arc<MemoryPresenceStore>,
}

fn harness_with(
    message_repository: Arc<dyn MessageRepository>,
    rate_limit: RateLimitConfig,
) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let directory = Arc::new(DirectoryService::new(DirectoryServiceDependencies {
        room_repository: Arc::new(MemoryRoomRepository::new()),
        clock: clock.clone(),
    }));
    let messages = Arc::new(MessageService::new(MessageServiceDependencies {
        message_repository,
        directory: directory.clone(),
        history_cache: Arc::new(MemoryHistoryCache::new(
            clock.clone(),
            50,
            16,
            Duration::from_secs(600),
        )),
        clock: clock.clone(),
        history: HistoryConfig::default(),
    }));
    let typing = Arc::new(MemoryTypingTracker::new(clock.clone(), Duration::from_secs(5)));
    let presence = Arc::new(MemoryPresenceStore::new(clock.clone(), Duration::from_secs(120)));
    let rate_limiter = Arc::new(ActionRateLimiter::new(
        Arc::new(MemoryRateLimitStore::new(clock.clone())),
        rate_limit,
    ));

    let gateway = ChatGateway::new(ChatGatewayDependencies {
        instance_id: InstanceId::random(),
        directory: directory.clone(),
        messages: messages.clone(),
        presence: presence.clone(),
        typing: typing.clone(),
        rate_limiter,
        event_bus: Arc::new(LocalEventBus::default()),
        token_verifier: Arc::new(UuidTokenVerifier),
        last_seen: Arc::new(MemoryLastSeenRepository::new()),
        clock,
    });

    Harness {
        gateway,
        directory,
        messages,
        typing,
        presence,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(MemoryMessageRepository::new()),
        RateLimitConfig::default(),
    )
}

fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn send(room_id: RoomId, content: &str, temp_id: Option<&str>) -> ClientAction {
    ClientAction::SendMessage(SendMessage {
        room_id,
        content: content.into(),
        kind: MessageKind::Text,
        reply_to_id: None,
        temp_id: temp_id.map(str::to_owned),
    })
}

fn error_code(events: &[ServerEvent]) -> Option<(ErrorCode, Option<String>)> {
    events.iter().find_map(|event| match event {
        ServerEvent::Error(err) => Some((err.error, err.temp_id.clone())),
        _ => None,
    })
}

#[tokio::test]
async fn missing_or_invalid_token_is_rejected() {
    let h = harness();
    let err = h.gateway.authenticate(None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    let err = h.gateway.authenticate(Some("  ")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    let err = h.gateway.authenticate(Some("garbage")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    assert_eq!(h.gateway.registry().connection_count().await, 0);

    let id = Uuid::new_v4();
    let user_id = h.gateway.authenticate(Some(&id.to_string())).await.unwrap();
    assert_eq!(user_id, UserId::from(id));
}

#[tokio::test]
async fn connect_joins_rooms_and_marks_online() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();

    let (session, mut rx) = h.gateway.connect(u1).await.unwrap();
    let events = drain(&mut rx);
    assert_eq!(
        events.first(),
        Some(&ServerEvent::Authenticated(Authenticated {
            user_id: u1,
            rooms: vec![room.id],
        }))
    );
    assert_eq!(h.gateway.registry().rooms_of(session.connection_id()).await, vec![room.id]);

    let record = h.presence.get_presence(u1).await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Online);
    assert_eq!(record.connection, Some(session.handle));
}

#[tokio::test]
async fn send_acks_sender_and_fans_out_once() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (_s2, mut rx2) = h.gateway.connect(u2).await.unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway.route(&s1, send(room.id, "hi", Some("t1"))).await;

    let sender_events = drain(&mut rx1);
    let ack = sender_events
        .iter()
        .find_map(|event| match event {
            ServerEvent::Ack(ack) => Some(ack.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(ack.temp_id, "t1");
    assert_eq!(ack.status, AckStatus::Sent);
    let message_id = ack.message_id.unwrap();

    let received: Vec<Message> = drain(&mut rx2)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::MessageReceived(message) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, message_id);
    assert_eq!(received[0].sender_id, u1);
    assert_eq!(received[0].content, "hi");

    let own = h.messages.find_status(message_id, u1).await.unwrap().unwrap();
    assert_eq!(own.status, DeliveryStatus::Read);
    let other = h.messages.find_status(message_id, u2).await.unwrap().unwrap();
    assert_eq!(other.status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn read_receipt_reaches_original_sender() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (s2, mut rx2) = h.gateway.connect(u2).await.unwrap();

    h.gateway.route(&s1, send(room.id, "hi", None)).await;
    let message_id = drain(&mut rx2)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::MessageReceived(message) => Some(message.id),
            _ => None,
        })
        .unwrap();
    drain(&mut rx1);

    h.gateway
        .route(
            &s2,
            ClientAction::MarkRead(crate::events::MarkRead {
                message_ids: vec![message_id],
                room_id: room.id,
                temp_id: None,
            }),
        )
        .await;

    let receipt = drain(&mut rx1)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::ReadReceipt(receipt) => Some(receipt),
            _ => None,
        })
        .unwrap();
    assert_eq!(receipt.reader_id, u2);
    assert_eq!(receipt.message_ids, vec![message_id]);

    let status = h.messages.find_status(message_id, u2).await.unwrap().unwrap();
    assert_eq!(status.status, DeliveryStatus::Read);
    assert!(status.read_at.is_some());
}

#[tokio::test]
async fn storage_failure_replies_error_and_broadcasts_nothing() {
    let mut repo = MockMessageRepository::new();
    repo.expect_create_with_statuses()
        .returning(|_, _| Err(RepositoryError::storage("disk full")));
    repo.expect_pending_for().returning(|_, _| Ok(Vec::new()));
    let h = harness_with(Arc::new(repo), RateLimitConfig::default());

    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (_s2, mut rx2) = h.gateway.connect(u2).await.unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway.route(&s1, send(room.id, "lost", Some("t9"))).await;

    assert_eq!(
        error_code(&drain(&mut rx1)),
        Some((ErrorCode::StorageFailure, Some("t9".into())))
    );
    assert!(drain(&mut rx2).is_empty());
}

#[tokio::test]
async fn rate_limited_send_gets_distinct_error() {
    let limits = RateLimitConfig {
        send_message: RateLimitRule {
            limit: 2,
            window_secs: 60,
            strategy: RateLimitStrategy::Fixed,
        },
        ..RateLimitConfig::default()
    };
    let h = harness_with(Arc::new(MemoryMessageRepository::new()), limits);
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    drain(&mut rx1);

    h.gateway.route(&s1, send(room.id, "1", Some("a"))).await;
    h.gateway.route(&s1, send(room.id, "2", Some("b"))).await;
    assert!(error_code(&drain(&mut rx1)).is_none());

    h.gateway.route(&s1, send(room.id, "3", Some("c"))).await;
    assert_eq!(
        error_code(&drain(&mut rx1)),
        Some((ErrorCode::RateLimitExceeded, Some("c".into())))
    );
}

#[tokio::test]
async fn outsiders_cannot_post_into_a_room() {
    let h = harness();
    let (u1, u2, outsider) = (user(), user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (session, mut rx) = h.gateway.connect(outsider).await.unwrap();
    drain(&mut rx);

    h.gateway.route(&session, send(room.id, "hey", Some("x"))).await;
    assert_eq!(
        error_code(&drain(&mut rx)),
        Some((ErrorCode::NotAMember, Some("x".into())))
    );
}

#[tokio::test]
async fn malformed_frames_get_validation_errors() {
    let h = harness();
    let (session, mut rx) = h.gateway.connect(user()).await.unwrap();
    drain(&mut rx);

    let frame = json!({"event": "message.send", "data": {"tempId": "t7"}}).to_string();
    h.gateway.route_text(&session, &frame).await;
    assert_eq!(
        error_code(&drain(&mut rx)),
        Some((ErrorCode::ValidationFailed, Some("t7".into())))
    );

    h.gateway.route_text(&session, "not json").await;
    assert_eq!(
        error_code(&drain(&mut rx)),
        Some((ErrorCode::ValidationFailed, None))
    );
}

#[tokio::test]
async fn disconnect_clears_typing_and_notifies_contacts() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (_s2, mut rx2) = h.gateway.connect(u2).await.unwrap();

    h.gateway
        .route(
            &s1,
            ClientAction::TypingStart(RoomAction {
                room_id: room.id,
                temp_id: None,
            }),
        )
        .await;
    assert_eq!(h.typing.list_typing(room.id).await.unwrap(), vec![u1]);
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway.disconnect(&s1).await;

    assert!(h.typing.list_typing(room.id).await.unwrap().is_empty());
    let events = drain(&mut rx2);
    assert!(events.contains(&ServerEvent::Typing(TypingUpdate {
        room_id: room.id,
        user_id: u1,
        is_typing: false,
    })));
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::PresenceOffline(update) if update.user_id == u1
    )));
    let record = h.presence.get_presence(u1).await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Offline);
    assert!(record.connection.is_none());
}

#[tokio::test]
async fn second_connection_keeps_user_online() {
    let h = harness();
    let u1 = user();
    let (first, _rx1) = h.gateway.connect(u1).await.unwrap();
    let (_second, _rx2) = h.gateway.connect(u1).await.unwrap();

    h.gateway.disconnect(&first).await;
    let record = h.presence.get_presence(u1).await.unwrap().unwrap();
    assert!(record.is_online());
}

#[tokio::test]
async fn pending_messages_are_replayed_and_marked_delivered() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, _rx1) = h.gateway.connect(u1).await.unwrap();
    h.gateway.route(&s1, send(room.id, "while you were away", None)).await;

    let (_s2, mut rx2) = h.gateway.connect(u2).await.unwrap();
    let events = drain(&mut rx2);
    assert!(matches!(events.first(), Some(ServerEvent::Authenticated(_))));
    let replayed: Vec<&Message> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageReceived(message) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].content, "while you were away");

    let status = h
        .messages
        .find_status(replayed[0].id, u2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn created_group_joins_connected_members() {
    let h = harness();
    let (creator, member) = (user(), user());
    let (s1, mut rx1) = h.gateway.connect(creator).await.unwrap();
    let (s2, mut rx2) = h.gateway.connect(member).await.unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway
        .route(
            &s1,
            ClientAction::CreateRoom(CreateRoom {
                kind: RoomKind::Group,
                name: Some("launch".into()),
                member_ids: vec![member],
                is_private: None,
                temp_id: Some("r1".into()),
            }),
        )
        .await;

    let room_id = drain(&mut rx1)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::Ack(ack) if ack.temp_id == "r1" => ack.room_id,
            _ => None,
        })
        .unwrap();
    assert!(drain(&mut rx2)
        .iter()
        .any(|event| matches!(event, ServerEvent::RoomCreated(created) if created.room.id == room_id)));
    assert_eq!(h.gateway.registry().rooms_of(s2.connection_id()).await, vec![room_id]);

    h.gateway.route(&s1, send(room_id, "welcome", None)).await;
    assert!(drain(&mut rx2)
        .iter()
        .any(|event| matches!(event, ServerEvent::MessageReceived(m) if m.content == "welcome")));
}

#[tokio::test]
async fn history_is_replied_to_the_requester_only() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (_s2, mut rx2) = h.gateway.connect(u2).await.unwrap();
    h.gateway.route(&s1, send(room.id, "one", None)).await;
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway
        .route(
            &s1,
            ClientAction::History(crate::events::HistoryRequest {
                room_id: room.id,
                cursor: None,
                limit: Some(10),
                direction: None,
                temp_id: None,
            }),
        )
        .await;

    let page = drain(&mut rx1)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::History(page) => Some(page),
            _ => None,
        })
        .unwrap();
    assert_eq!(page.messages.len(), 1);
    assert!(!page.has_more);
    assert!(drain(&mut rx2).is_empty());
}

#[tokio::test]
async fn remote_envelopes_are_delivered_and_own_echo_ignored() {
    let h = harness();
    let u1 = user();
    let (_s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    drain(&mut rx1);

    let event = ServerEvent::PresenceStatusUpdate(PresenceUpdate {
        user_id: user(),
        status: PresenceStatus::Busy,
        last_seen: time::OffsetDateTime::now_utc(),
    });
    let own = EventEnvelope::new(h.gateway.instance_id(), Audience::User(u1), event.clone());
    h.gateway.handle_remote(own).await;
    assert!(drain(&mut rx1).is_empty());

    let remote = EventEnvelope::new(InstanceId::random(), Audience::User(u1), event.clone());
    h.gateway.handle_remote(remote.clone()).await;
    h.gateway.handle_remote(remote).await;
    assert_eq!(drain(&mut rx1), vec![event]);
}

/// 绕过网关直接落库，只取消息 id
async fn persist(h: &Harness, session: &Session, room_id: RoomId, content: &str) -> MessageId {
    let message = h
        .messages
        .create(CreateMessageRequest {
            room_id,
            sender_id: session.user_id,
            content: content.into(),
            kind: MessageKind::Text,
            reply_to_id: None,
        })
        .await
        .unwrap();
    message.id
}

#[tokio::test]
async fn edit_and_delete_fan_out_to_the_room() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (_s2, mut rx2) = h.gateway.connect(u2).await.unwrap();
    let message_id = persist(&h, &s1, room.id, "draft").await;
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway
        .route(
            &s1,
            ClientAction::EditMessage(EditMessage {
                message_id,
                room_id: room.id,
                content: "final".into(),
                temp_id: None,
            }),
        )
        .await;

    for rx in [&mut rx1, &mut rx2] {
        let edited: Vec<Message> = drain(rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::MessageEdited(message) => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].id, message_id);
        assert_eq!(edited[0].content, "final");
    }

    h.gateway
        .route(
            &s1,
            ClientAction::DeleteMessage(DeleteMessage {
                message_id,
                room_id: room.id,
                temp_id: Some("del-1".into()),
            }),
        )
        .await;

    let sender_events = drain(&mut rx1);
    assert!(sender_events.iter().any(|event| matches!(
        event,
        ServerEvent::Ack(ack) if ack.temp_id == "del-1" && ack.status == AckStatus::Ok
    )));
    for events in [sender_events, drain(&mut rx2)] {
        let deleted: Vec<MessageDeleted> = events
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::MessageDeleted(deleted) => Some(deleted),
                _ => None,
            })
            .collect();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].message_id, message_id);
        assert_eq!(deleted[0].room_id, room.id);
    }
}

#[tokio::test]
async fn edit_by_someone_else_is_rejected_without_broadcast() {
    let h = harness();
    let (u1, u2) = (user(), user());
    let (room, _) = h.directory.create_direct(u1, u2).await.unwrap();
    let (s1, mut rx1) = h.gateway.connect(u1).await.unwrap();
    let (s2, mut rx2) = h.gateway.connect(u2).await.unwrap();
    let message_id = persist(&h, &s1, room.id, "mine").await;
    drain(&mut rx1);
    drain(&mut rx2);

    h.gateway
        .route(
            &s2,
            ClientAction::EditMessage(EditMessage {
                message_id,
                room_id: room.id,
                content: "hijacked".into(),
                temp_id: Some("e-1".into()),
            }),
        )
        .await;

    let editor_events = drain(&mut rx2);
    assert_eq!(
        error_code(&editor_events),
        Some((ErrorCode::Unauthorized, Some("e-1".into())))
    );
    assert!(!editor_events
        .iter()
        .any(|event| matches!(event, ServerEvent::MessageEdited(_))));
    assert!(drain(&mut rx1).is_empty());

    let page = h
        .messages
        .history(room.id, u1, HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(page.messages[0].id, message_id);
    assert_eq!(page.messages[0].content, "mine");
}
