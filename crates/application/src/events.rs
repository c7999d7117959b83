//! 连接上的 JSON 帧
//!
//! 双向都是 `{"event": "<name>", "data": {...}}`，负载字段使用 camelCase。

use domain::{
    MemberRole, Message, MessageId, MessageKind, PageDirection, PresenceRecord, PresenceStatus,
    Room, RoomId, RoomKind, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApplicationError, ErrorCode};

/// 客户端发来的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientAction {
    #[serde(rename = "message.send")]
    SendMessage(SendMessage),
    #[serde(rename = "message.edit")]
    EditMessage(EditMessage),
    #[serde(rename = "message.delete")]
    DeleteMessage(DeleteMessage),
    #[serde(rename = "message.read")]
    MarkRead(MarkRead),
    #[serde(rename = "typing.start")]
    TypingStart(RoomAction),
    #[serde(rename = "typing.stop")]
    TypingStop(RoomAction),
    #[serde(rename = "message.history")]
    History(HistoryRequest),
    #[serde(rename = "room.create")]
    CreateRoom(CreateRoom),
    #[serde(rename = "presence.status.update")]
    UpdatePresence(UpdatePresence),
    #[serde(rename = "room.leave")]
    LeaveRoom(RoomAction),
    #[serde(rename = "room.member.role")]
    SetMemberRole(SetMemberRole),
}

impl ClientAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::SendMessage(_) => "message.send",
            ClientAction::EditMessage(_) => "message.edit",
            ClientAction::DeleteMessage(_) => "message.delete",
            ClientAction::MarkRead(_) => "message.read",
            ClientAction::TypingStart(_) => "typing.start",
            ClientAction::TypingStop(_) => "typing.stop",
            ClientAction::History(_) => "message.history",
            ClientAction::CreateRoom(_) => "room.create",
            ClientAction::UpdatePresence(_) => "presence.status.update",
            ClientAction::LeaveRoom(_) => "room.leave",
            ClientAction::SetMemberRole(_) => "room.member.role",
        }
    }

    /// 客户端用于关联乐观更新的临时 ID
    pub fn temp_id(&self) -> Option<&str> {
        let temp_id = match self {
            ClientAction::SendMessage(p) => &p.temp_id,
            ClientAction::EditMessage(p) => &p.temp_id,
            ClientAction::DeleteMessage(p) => &p.temp_id,
            ClientAction::MarkRead(p) => &p.temp_id,
            ClientAction::TypingStart(p) | ClientAction::TypingStop(p) => &p.temp_id,
            ClientAction::History(p) => &p.temp_id,
            ClientAction::CreateRoom(p) => &p.temp_id,
            ClientAction::UpdatePresence(p) => &p.temp_id,
            ClientAction::LeaveRoom(p) => &p.temp_id,
            ClientAction::SetMemberRole(p) => &p.temp_id,
        };
        temp_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: RoomId,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub content: String,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub message_ids: Vec<MessageId>,
    pub room_id: RoomId,
    #[serde(default)]
    pub temp_id: Option<String>,
}

/// 只携带房间 ID 的动作（输入状态、离开房间）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAction {
    pub room_id: RoomId,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub direction: Option<PageDirection>,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub kind: RoomKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePresence {
    pub status: PresenceStatus,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMemberRole {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: MemberRole,
    #[serde(default)]
    pub temp_id: Option<String>,
}

/// 服务端推送的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection.authenticated")]
    Authenticated(Authenticated),
    #[serde(rename = "message.received")]
    MessageReceived(Message),
    #[serde(rename = "message.edited")]
    MessageEdited(Message),
    #[serde(rename = "message.deleted")]
    MessageDeleted(MessageDeleted),
    #[serde(rename = "message.read.receipt")]
    ReadReceipt(ReadReceipt),
    #[serde(rename = "typing.user")]
    Typing(TypingUpdate),
    #[serde(rename = "presence.online")]
    PresenceOnline(PresenceUpdate),
    #[serde(rename = "presence.offline")]
    PresenceOffline(PresenceUpdate),
    #[serde(rename = "presence.status.update")]
    PresenceStatusUpdate(PresenceUpdate),
    #[serde(rename = "room.created")]
    RoomCreated(RoomCreated),
    #[serde(rename = "room.member.left")]
    MemberLeft(MemberChanged),
    #[serde(rename = "room.member.updated")]
    MemberUpdated(MemberChanged),
    #[serde(rename = "message.history")]
    History(HistoryPage),
    #[serde(rename = "ack")]
    Ack(Ack),
    #[serde(rename = "error")]
    Error(ErrorEvent),
}

impl ServerEvent {
    pub fn error(err: &ApplicationError, temp_id: Option<String>) -> Self {
        ServerEvent::Error(ErrorEvent {
            error: err.code(),
            temp_id,
            message: err.to_string(),
        })
    }

    pub fn ack(temp_id: String, status: AckStatus) -> Self {
        ServerEvent::Ack(Ack {
            temp_id,
            message_id: None,
            room_id: None,
            status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticated {
    pub user_id: UserId,
    pub rooms: Vec<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    pub room_id: RoomId,
    #[serde(with = "time::serde::rfc3339")]
    pub deleted_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub room_id: RoomId,
    pub reader_id: UserId,
    pub message_ids: Vec<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
}

impl From<&PresenceRecord> for PresenceUpdate {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            user_id: record.user_id,
            status: record.status,
            last_seen: record.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room: Room,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberChanged {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub room_id: RoomId,
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// 消息已持久化
    Sent,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub temp_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub status: AckStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub error: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub message: String,
}
