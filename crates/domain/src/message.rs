use data_encoding::BASE64URL_NOPAD;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{truncate_to_micros, MessageId, RoomId, Timestamp, UserId};

/// 消息删除后替换正文的占位文本。
pub const DELETED_PLACEHOLDER: &str = "[message deleted]";

/// 单条消息正文的最大字符数。
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// 媒体类消息的附加信息。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// 消息类型，媒体类消息必须携带元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image { metadata: MediaMetadata },
    File { metadata: MediaMetadata },
    Audio { metadata: MediaMetadata },
    Video { metadata: MediaMetadata },
    System,
}

impl MessageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image { .. } => "image",
            MessageKind::File { .. } => "file",
            MessageKind::Audio { .. } => "audio",
            MessageKind::Video { .. } => "video",
            MessageKind::System => "system",
        }
    }

    pub fn metadata(&self) -> Option<&MediaMetadata> {
        match self {
            MessageKind::Image { metadata }
            | MessageKind::File { metadata }
            | MessageKind::Audio { metadata }
            | MessageKind::Video { metadata } => Some(metadata),
            MessageKind::Text | MessageKind::System => None,
        }
    }

    /// 由存储层的 (type, metadata) 两列重新组装。
    pub fn from_parts(type_name: &str, metadata: Option<MediaMetadata>) -> Result<Self, DomainError> {
        let media = |metadata: Option<MediaMetadata>| {
            metadata.ok_or_else(|| {
                DomainError::invalid_argument("metadata", format!("required for {type_name}"))
            })
        };
        match type_name {
            "text" => Ok(MessageKind::Text),
            "system" => Ok(MessageKind::System),
            "image" => Ok(MessageKind::Image {
                metadata: media(metadata)?,
            }),
            "file" => Ok(MessageKind::File {
                metadata: media(metadata)?,
            }),
            "audio" => Ok(MessageKind::Audio {
                metadata: media(metadata)?,
            }),
            "video" => Ok(MessageKind::Video {
                metadata: media(metadata)?,
            }),
            other => Err(DomainError::invalid_argument(
                "type",
                format!("unknown message type {other}"),
            )),
        }
    }

    fn validate(&self) -> Result<(), DomainError> {
        if let Some(metadata) = self.metadata() {
            if metadata.url.trim().is_empty() {
                return Err(DomainError::invalid_argument("metadata.url", "cannot be empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub edited_at: Option<Timestamp>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub deleted_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        room_id: RoomId,
        sender_id: UserId,
        content: impl Into<String>,
        kind: MessageKind,
        reply_to_id: Option<MessageId>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let content = content.into();
        Self::validate_content(&content, &kind)?;
        kind.validate()?;
        Ok(Self {
            id: MessageId::generate(),
            room_id,
            sender_id,
            content,
            kind,
            reply_to_id,
            created_at: truncate_to_micros(created_at),
            edited_at: None,
            deleted_at: None,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }

    pub fn edit(&mut self, content: impl Into<String>, at: Timestamp) -> Result<(), DomainError> {
        if self.is_deleted() {
            return Err(DomainError::MessageDeleted);
        }
        let content = content.into();
        Self::validate_content(&content, &self.kind)?;
        self.content = content;
        self.edited_at = Some(truncate_to_micros(at));
        Ok(())
    }

    /// 软删除：保留 ID 与排序位置，只替换正文。
    pub fn soft_delete(&mut self, at: Timestamp) -> Result<(), DomainError> {
        if self.is_deleted() {
            return Err(DomainError::MessageDeleted);
        }
        self.content = DELETED_PLACEHOLDER.to_owned();
        self.deleted_at = Some(truncate_to_micros(at));
        Ok(())
    }

    fn validate_content(content: &str, kind: &MessageKind) -> Result<(), DomainError> {
        // 媒体消息允许空正文（仅发送附件）
        if kind.metadata().is_none() && content.trim().is_empty() {
            return Err(DomainError::invalid_argument("content", "cannot be empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(DomainError::invalid_argument("content", "too long"));
        }
        Ok(())
    }
}

/// 分页游标：房间内消息按 (created_at, id) 全序排列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCursor {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    pub id: MessageId,
}

impl MessageCursor {
    /// 编码为对客户端不透明的字符串。
    pub fn encode(&self) -> String {
        // 只包含时间戳和 UUID，序列化不会失败
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64URL_NOPAD.encode(&json)
    }

    pub fn decode(raw: &str) -> Result<Self, DomainError> {
        let bytes = BASE64URL_NOPAD
            .decode(raw.as_bytes())
            .map_err(|_| DomainError::invalid_argument("cursor", "malformed encoding"))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| DomainError::invalid_argument("cursor", "malformed payload"))
    }
}

/// 分页方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    #[default]
    Before,
    After,
}

/// 单个接收者的投递状态，只能向前推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown delivery status {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub status: DeliveryStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<Timestamp>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<Timestamp>,
}

impl MessageStatus {
    /// 发送者自己的状态行创建时即为已读。
    pub fn for_sender(message: &Message) -> Self {
        Self {
            message_id: message.id,
            recipient_id: message.sender_id,
            status: DeliveryStatus::Read,
            delivered_at: Some(message.created_at),
            read_at: Some(message.created_at),
        }
    }

    pub fn for_recipient(message: &Message, recipient_id: UserId) -> Self {
        Self {
            message_id: message.id,
            recipient_id,
            status: DeliveryStatus::Sent,
            delivered_at: None,
            read_at: None,
        }
    }

    /// 推进状态；返回是否真的发生了变化。
    pub fn advance(&mut self, to: DeliveryStatus, at: Timestamp) -> bool {
        if to <= self.status {
            return false;
        }
        let at = truncate_to_micros(at);
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        if to == DeliveryStatus::Read {
            self.read_at = Some(at);
        }
        self.status = to;
        true
    }
}
