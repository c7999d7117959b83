use async_trait::async_trait;
use domain::{InstanceId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::ServerEvent;

/// 事件的投递范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Audience {
    /// 房间内全部活跃成员的连接
    Room(RoomId),
    /// 某个用户的全部连接
    User(UserId),
}

/// 跨实例传递的事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// 接收端据此去重
    pub event_id: Uuid,
    pub origin: InstanceId,
    pub audience: Audience,
    pub event: ServerEvent,
}

impl EventEnvelope {
    pub fn new(origin: InstanceId, audience: Audience, event: ServerEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            origin,
            audience,
            event,
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
    #[error("broadcast channel unavailable: {0}")]
    Unavailable(String),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// 跨实例发布/订阅通道
///
/// 发布一次，所有订阅的实例至少收到一次；返回收到该事件的订阅者数量。
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<usize, BroadcastError>;
}
