//! 连接网关与跨实例扇出
//!
//! 传输层（WebSocket）只负责收发帧；鉴权、入房、动作路由、广播都在这里完成。
//! 本地连接直接写入，其他实例通过事件总线收到同一个信封后投递给自己的连接。

mod registry;

use std::sync::Arc;

use domain::{
    ConnectionHandle, InstanceId, MemberRole, Message, PresenceStatus, RoomId, RoomKind, UserId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::broadcaster::{Audience, EventBus, EventEnvelope};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::events::{
    AckStatus, Authenticated, ClientAction, CreateRoom, HistoryPage, MemberChanged,
    MessageDeleted, PresenceUpdate, ReadReceipt, RoomCreated, ServerEvent, TypingUpdate,
};
use crate::presence::PresenceStore;
use crate::rate_limiter::{ActionRateLimiter, RateLimitedAction};
use crate::repository::LastSeenRepository;
use crate::services::{
    CreateGroupRequest, CreateMessageRequest, DirectoryService, HistoryQuery, MessageService,
};
use crate::typing::TypingTracker;

pub use registry::{ConnectionRegistry, RecentEvents};

/// 连接时补发的离线消息上限
const PENDING_REPLAY_LIMIT: u32 = 500;

/// 一个已通过鉴权的连接
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub handle: ConnectionHandle,
    pub user_id: UserId,
}

impl Session {
    pub fn connection_id(&self) -> Uuid {
        self.handle.connection_id
    }
}

pub struct ChatGatewayDependencies {
    pub instance_id: InstanceId,
    pub directory: Arc<DirectoryService>,
    pub messages: Arc<MessageService>,
    pub presence: Arc<dyn PresenceStore>,
    pub typing: Arc<dyn TypingTracker>,
    pub rate_limiter: Arc<ActionRateLimiter>,
    pub event_bus: Arc<dyn EventBus>,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub last_seen: Arc<dyn LastSeenRepository>,
    pub clock: Arc<dyn Clock>,
}

pub struct ChatGateway {
    deps: ChatGatewayDependencies,
    registry: ConnectionRegistry,
}

impl ChatGateway {
    pub fn new(deps: ChatGatewayDependencies) -> Self {
        Self {
            deps,
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.deps.instance_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// 在接受任何其他输入之前调用；缺失或无效的凭证直接拒绝。
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserId, ApplicationError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApplicationError::AuthenticationFailed("missing token".into()))?;
        self.deps.token_verifier.verify(token).await
    }

    /// 注册连接：标记在线、加入全部房间、发送鉴权确认、补发离线消息。
    pub async fn connect(
        &self,
        user_id: UserId,
    ) -> Result<(Session, mpsc::UnboundedReceiver<ServerEvent>), ApplicationError> {
        let rooms = self.deps.directory.list_rooms_for(user_id).await?;

        let session = Session {
            handle: ConnectionHandle::new(self.deps.instance_id),
            user_id,
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registry
            .register(session.connection_id(), user_id, sender)
            .await;
        let room_ids: Vec<RoomId> = rooms.iter().map(|room| room.id).collect();
        for room_id in &room_ids {
            self.registry.join(session.connection_id(), *room_id).await;
        }

        match self
            .deps
            .presence
            .set_presence(user_id, PresenceStatus::Online, Some(session.handle))
            .await
        {
            Ok(record) => {
                self.notify_contacts(user_id, ServerEvent::PresenceOnline(PresenceUpdate::from(&record)))
                    .await;
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "更新在线状态失败");
            }
        }

        self.reply(
            &session,
            ServerEvent::Authenticated(Authenticated {
                user_id,
                rooms: room_ids,
            }),
        )
        .await;
        self.replay_pending(&session).await;

        tracing::info!(
            user_id = %user_id,
            connection_id = %session.connection_id(),
            rooms = rooms.len(),
            "连接已建立"
        );
        Ok((session, receiver))
    }

    async fn replay_pending(&self, session: &Session) {
        let pending = match self
            .deps
            .messages
            .pending_for(session.user_id, PENDING_REPLAY_LIMIT)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(user_id = %session.user_id, error = %err, "读取离线消息失败");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let mut delivered = Vec::with_capacity(pending.len());
        for message in pending {
            let message_id = message.id;
            if self
                .registry
                .send_to(
                    session.connection_id(),
                    Some(message_id.0),
                    ServerEvent::MessageReceived(message),
                )
                .await
            {
                delivered.push(message_id);
            }
        }
        if let Err(err) = self
            .deps
            .messages
            .mark_delivered(session.user_id, &delivered)
            .await
        {
            tracing::warn!(user_id = %session.user_id, error = %err, "标记离线消息已送达失败");
        }
        tracing::debug!(user_id = %session.user_id, count = delivered.len(), "离线消息已补发");
    }

    /// 该用户在本实例上的最后一个连接断开时，标记离线、清理输入状态并通知联系人。
    pub async fn disconnect(&self, session: &Session) {
        let user_id = session.user_id;
        let Some(remaining) = self.registry.unregister(session.connection_id()).await else {
            return;
        };
        if remaining > 0 {
            tracing::info!(user_id = %user_id, remaining, "连接已断开，用户仍有其他连接");
            return;
        }

        let now = self.deps.clock.now();
        let last_seen = match self
            .deps
            .presence
            .set_presence(user_id, PresenceStatus::Offline, None)
            .await
        {
            Ok(record) => record.last_seen,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "更新离线状态失败");
                now
            }
        };
        if let Err(err) = self.deps.last_seen.record(user_id, last_seen).await {
            tracing::warn!(user_id = %user_id, error = %err, "记录最后在线时间失败");
        }

        match self.deps.typing.clear_user(user_id).await {
            Ok(rooms) => {
                for room_id in rooms {
                    self.broadcast(
                        room_id,
                        ServerEvent::Typing(TypingUpdate {
                            room_id,
                            user_id,
                            is_typing: false,
                        }),
                    )
                    .await;
                }
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "清理输入状态失败");
            }
        }

        self.notify_contacts(
            user_id,
            ServerEvent::PresenceOffline(PresenceUpdate {
                user_id,
                status: PresenceStatus::Offline,
                last_seen,
            }),
        )
        .await;
        tracing::info!(user_id = %user_id, "连接已断开，在线状态已清理");
    }

    /// 心跳：续期在线记录。记录过期或被其他连接清除时重新声明在线，保留显式的 away/busy。
    pub async fn refresh_presence(&self, session: &Session) {
        let status = match self.deps.presence.get_presence(session.user_id).await {
            Ok(Some(record)) if matches!(record.status, PresenceStatus::Away | PresenceStatus::Busy) => {
                record.status
            }
            Ok(_) => PresenceStatus::Online,
            Err(err) => {
                tracing::warn!(user_id = %session.user_id, error = %err, "读取在线状态失败");
                return;
            }
        };
        if let Err(err) = self
            .deps
            .presence
            .set_presence(session.user_id, status, Some(session.handle))
            .await
        {
            tracing::warn!(user_id = %session.user_id, error = %err, "续期在线状态失败");
        }
    }

    /// 处理一帧原始文本。无法解析的帧同样回复结构化错误。
    pub async fn route_text(&self, session: &Session, text: &str) {
        match serde_json::from_str::<ClientAction>(text) {
            Ok(action) => self.route(session, action).await,
            Err(err) => {
                let temp_id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|value| {
                        value
                            .pointer("/data/tempId")
                            .and_then(|v| v.as_str())
                            .map(str::to_owned)
                    });
                let err = ApplicationError::validation(format!("malformed frame: {err}"));
                self.reply(session, ServerEvent::error(&err, temp_id)).await;
            }
        }
    }

    /// 处理一个客户端动作；任何失败都以带 tempId 的错误回复发起连接。
    pub async fn route(&self, session: &Session, action: ClientAction) {
        let name = action.name();
        let temp_id = action.temp_id().map(str::to_owned);
        if let Err(err) = self.handle_action(session, action).await {
            match &err {
                ApplicationError::Storage(_) | ApplicationError::Infrastructure { .. } => {
                    tracing::error!(user_id = %session.user_id, action = name, error = %err, "动作处理失败");
                }
                _ => {
                    tracing::debug!(user_id = %session.user_id, action = name, error = %err, "动作被拒绝");
                }
            }
            self.reply(session, ServerEvent::error(&err, temp_id)).await;
        }
    }

    async fn handle_action(
        &self,
        session: &Session,
        action: ClientAction,
    ) -> Result<(), ApplicationError> {
        let user_id = session.user_id;
        match action {
            ClientAction::SendMessage(payload) => {
                self.deps
                    .rate_limiter
                    .check(RateLimitedAction::SendMessage, user_id)
                    .await?;
                let message = self
                    .deps
                    .messages
                    .create(CreateMessageRequest {
                        room_id: payload.room_id,
                        sender_id: user_id,
                        content: payload.content,
                        kind: payload.kind,
                        reply_to_id: payload.reply_to_id,
                    })
                    .await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack(session, temp_id, AckStatus::Sent, Some(&message))
                        .await;
                }
                self.publish_message(message).await;
            }
            ClientAction::EditMessage(payload) => {
                let message = self
                    .deps
                    .messages
                    .edit(payload.room_id, payload.message_id, user_id, payload.content)
                    .await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack(session, temp_id, AckStatus::Ok, Some(&message)).await;
                }
                self.broadcast(message.room_id, ServerEvent::MessageEdited(message))
                    .await;
            }
            ClientAction::DeleteMessage(payload) => {
                let message = self
                    .deps
                    .messages
                    .soft_delete(payload.room_id, payload.message_id, user_id)
                    .await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack(session, temp_id, AckStatus::Ok, Some(&message)).await;
                }
                if let Some(deleted_at) = message.deleted_at {
                    self.broadcast(
                        message.room_id,
                        ServerEvent::MessageDeleted(MessageDeleted {
                            message_id: message.id,
                            room_id: message.room_id,
                            deleted_at,
                        }),
                    )
                    .await;
                }
            }
            ClientAction::MarkRead(payload) => {
                let outcome = self
                    .deps
                    .messages
                    .mark_read(payload.room_id, user_id, &payload.message_ids)
                    .await?;
                for (sender_id, message_ids) in outcome.receipts {
                    self.send_to_user(
                        sender_id,
                        ServerEvent::ReadReceipt(ReadReceipt {
                            room_id: payload.room_id,
                            reader_id: user_id,
                            message_ids,
                            read_at: outcome.read_at,
                        }),
                    )
                    .await;
                }
                if let Some(temp_id) = payload.temp_id {
                    self.ack_room(session, temp_id, payload.room_id).await;
                }
            }
            ClientAction::TypingStart(payload) => {
                self.deps
                    .rate_limiter
                    .check(RateLimitedAction::Typing, user_id)
                    .await?;
                self.deps
                    .directory
                    .require_member(payload.room_id, user_id)
                    .await?;
                self.deps.typing.start_typing(payload.room_id, user_id).await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack_room(session, temp_id, payload.room_id).await;
                }
                self.broadcast(
                    payload.room_id,
                    ServerEvent::Typing(TypingUpdate {
                        room_id: payload.room_id,
                        user_id,
                        is_typing: true,
                    }),
                )
                .await;
            }
            ClientAction::TypingStop(payload) => {
                self.deps
                    .directory
                    .require_member(payload.room_id, user_id)
                    .await?;
                let was_typing = self.deps.typing.stop_typing(payload.room_id, user_id).await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack_room(session, temp_id, payload.room_id).await;
                }
                if was_typing {
                    self.broadcast(
                        payload.room_id,
                        ServerEvent::Typing(TypingUpdate {
                            room_id: payload.room_id,
                            user_id,
                            is_typing: false,
                        }),
                    )
                    .await;
                }
            }
            ClientAction::History(payload) => {
                let page = self
                    .deps
                    .messages
                    .history(
                        payload.room_id,
                        user_id,
                        HistoryQuery {
                            cursor: payload.cursor,
                            limit: payload.limit,
                            direction: payload.direction.unwrap_or_default(),
                        },
                    )
                    .await?;
                self.reply(
                    session,
                    ServerEvent::History(HistoryPage {
                        room_id: payload.room_id,
                        messages: page.messages,
                        next_cursor: page.next_cursor.map(|cursor| cursor.encode()),
                        has_more: page.has_more,
                    }),
                )
                .await;
            }
            ClientAction::CreateRoom(payload) => {
                self.deps
                    .rate_limiter
                    .check(RateLimitedAction::CreateRoom, user_id)
                    .await?;
                self.create_room(session, payload).await?;
            }
            ClientAction::UpdatePresence(payload) => {
                let record = self
                    .deps
                    .presence
                    .set_presence(user_id, payload.status, Some(session.handle))
                    .await?;
                if let Some(temp_id) = payload.temp_id {
                    self.reply(session, ServerEvent::ack(temp_id, AckStatus::Ok))
                        .await;
                }
                self.notify_contacts(
                    user_id,
                    ServerEvent::PresenceStatusUpdate(PresenceUpdate::from(&record)),
                )
                .await;
            }
            ClientAction::LeaveRoom(payload) => {
                let member = self.deps.directory.leave_room(payload.room_id, user_id).await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack_room(session, temp_id, payload.room_id).await;
                }
                self.broadcast(
                    payload.room_id,
                    ServerEvent::MemberLeft(MemberChanged {
                        room_id: payload.room_id,
                        user_id,
                        role: member.role,
                    }),
                )
                .await;
            }
            ClientAction::SetMemberRole(payload) => {
                let member = self
                    .deps
                    .directory
                    .set_member_role(payload.room_id, user_id, payload.user_id, payload.role)
                    .await?;
                if let Some(temp_id) = payload.temp_id {
                    self.ack_room(session, temp_id, payload.room_id).await;
                }
                self.broadcast(
                    payload.room_id,
                    ServerEvent::MemberUpdated(MemberChanged {
                        room_id: payload.room_id,
                        user_id: member.user_id,
                        role: member.role,
                    }),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn create_room(
        &self,
        session: &Session,
        payload: CreateRoom,
    ) -> Result<(), ApplicationError> {
        let user_id = session.user_id;
        let (room, member_ids, created) = match payload.kind {
            RoomKind::Direct => {
                let others: Vec<UserId> = payload
                    .member_ids
                    .iter()
                    .copied()
                    .filter(|id| *id != user_id)
                    .collect();
                let [other] = others.as_slice() else {
                    return Err(ApplicationError::validation(
                        "a direct room needs exactly one other member",
                    ));
                };
                let (room, created) = self.deps.directory.create_direct(user_id, *other).await?;
                (room, vec![user_id, *other], created)
            }
            RoomKind::Group => {
                let (room, member_ids) = self
                    .deps
                    .directory
                    .create_group(CreateGroupRequest {
                        creator: user_id,
                        member_ids: payload.member_ids,
                        name: payload.name,
                        is_private: payload.is_private.unwrap_or(false),
                    })
                    .await?;
                (room, member_ids, true)
            }
        };

        let room_id = room.id;
        if let Some(temp_id) = payload.temp_id {
            self.ack_room(session, temp_id, room_id).await;
        }
        if created {
            self.broadcast(room_id, ServerEvent::RoomCreated(RoomCreated { room, member_ids }))
                .await;
        } else {
            self.reply(session, ServerEvent::RoomCreated(RoomCreated { room, member_ids }))
                .await;
        }
        Ok(())
    }

    /// 新消息以消息 ID 作为事件 ID，重复投递由接收端丢弃。
    async fn publish_message(&self, message: Message) {
        let envelope = EventEnvelope::new(
            self.deps.instance_id,
            Audience::Room(message.room_id),
            ServerEvent::MessageReceived(message.clone()),
        )
        .with_event_id(message.id.0);
        self.dispatch(envelope).await;
    }

    /// 广播给房间内的所有连接，无论连接在哪个实例上。
    pub async fn broadcast(&self, room_id: RoomId, event: ServerEvent) {
        let envelope = EventEnvelope::new(self.deps.instance_id, Audience::Room(room_id), event);
        self.dispatch(envelope).await;
    }

    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) {
        let envelope = EventEnvelope::new(self.deps.instance_id, Audience::User(user_id), event);
        self.dispatch(envelope).await;
    }

    async fn notify_contacts(&self, user_id: UserId, event: ServerEvent) {
        let contacts = match self.deps.directory.contacts_of(user_id).await {
            Ok(contacts) => contacts,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "读取联系人失败");
                return;
            }
        };
        for contact in contacts {
            self.send_to_user(contact, event.clone()).await;
        }
    }

    /// 先投递本地连接，再发布给其他实例。发布失败只影响跨实例投递。
    async fn dispatch(&self, envelope: EventEnvelope) {
        self.deliver_local(&envelope).await;
        if let Err(err) = self.deps.event_bus.publish(&envelope).await {
            tracing::warn!(event_id = %envelope.event_id, error = %err, "跨实例发布失败");
        }
    }

    /// 处理其他实例发布的事件；自己发布的回声直接忽略。
    pub async fn handle_remote(&self, envelope: EventEnvelope) {
        if envelope.origin == self.deps.instance_id {
            return;
        }
        self.deliver_local(&envelope).await;
    }

    async fn deliver_local(&self, envelope: &EventEnvelope) {
        // 房间创建要先让成员的连接入房，才能收到这条事件
        if let ServerEvent::RoomCreated(created) = &envelope.event {
            for member in &created.member_ids {
                self.registry.join_user(*member, created.room.id).await;
            }
        }

        let reached = self.registry.deliver(envelope).await;
        tracing::trace!(event_id = %envelope.event_id, users = reached.len(), "本地投递完成");

        if let ServerEvent::MemberLeft(change) = &envelope.event {
            if change.role == MemberRole::Left {
                self.registry.leave_user(change.user_id, change.room_id).await;
            }
        }
    }

    async fn reply(&self, session: &Session, event: ServerEvent) {
        if !self
            .registry
            .send_to(session.connection_id(), None, event)
            .await
        {
            tracing::debug!(connection_id = %session.connection_id(), "连接已关闭，丢弃回复");
        }
    }

    async fn ack(
        &self,
        session: &Session,
        temp_id: String,
        status: AckStatus,
        message: Option<&Message>,
    ) {
        let mut event = ServerEvent::ack(temp_id, status);
        if let (ServerEvent::Ack(ack), Some(message)) = (&mut event, message) {
            ack.message_id = Some(message.id);
            ack.room_id = Some(message.room_id);
        }
        self.reply(session, event).await;
    }

    async fn ack_room(&self, session: &Session, temp_id: String, room_id: RoomId) {
        let mut event = ServerEvent::ack(temp_id, AckStatus::Ok);
        if let ServerEvent::Ack(ack) = &mut event {
            ack.room_id = Some(room_id);
        }
        self.reply(session, event).await;
    }
}

/// 把事件总线的订阅端接到网关上
pub fn spawn_remote_listener(
    gateway: Arc<ChatGateway>,
    mut envelopes: mpsc::UnboundedReceiver<EventEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = envelopes.recv().await {
            gateway.handle_remote(envelope).await;
        }
        tracing::info!(instance_id = %gateway.instance_id(), "事件订阅已结束");
    })
}

#[cfg(test)]
mod tests;
