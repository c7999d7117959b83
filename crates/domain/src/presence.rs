use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConnectionHandle, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
}

impl PresenceStatus {
    pub fn is_online(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "online" => Ok(PresenceStatus::Online),
            "offline" => Ok(PresenceStatus::Offline),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown presence status {other}"),
            )),
        }
    }
}

/// 在线状态记录，存放在共享的快速存储里，进程重启丢失是可以接受的。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub connection: Option<ConnectionHandle>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

impl PresenceRecord {
    pub fn new(
        user_id: UserId,
        status: PresenceStatus,
        connection: Option<ConnectionHandle>,
        now: Timestamp,
    ) -> Self {
        // 离线记录不再持有连接句柄
        let connection = if status.is_online() { connection } else { None };
        Self {
            user_id,
            status,
            connection,
            last_seen: now,
            updated_at: now,
        }
    }

    /// 没有记录时的默认视图。
    pub fn offline(user_id: UserId, last_seen: Timestamp) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            connection: None,
            last_seen,
            updated_at: last_seen,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status.is_online()
    }
}
