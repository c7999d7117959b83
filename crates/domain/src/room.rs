use crate::errors::DomainError;
use crate::value_objects::{RoomId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Direct,
    Group,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Direct => "direct",
            RoomKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "direct" => Ok(RoomKind::Direct),
            "group" => Ok(RoomKind::Group),
            other => Err(DomainError::invalid_argument(
                "room_kind",
                format!("unknown kind {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub kind: RoomKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_private: bool,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub deleted_at: Option<Timestamp>,
}

impl Room {
    /// 单聊房间：ID 由双方身份推导，永远是私有的。
    pub fn new_direct(a: UserId, b: UserId, created_at: Timestamp) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::invalid_argument(
                "member_ids",
                "direct room needs two distinct users",
            ));
        }
        Ok(Self {
            id: RoomId::direct(a, b),
            kind: RoomKind::Direct,
            name: None,
            is_private: true,
            created_by: a,
            created_at,
            deleted_at: None,
        })
    }

    pub fn new_group(
        creator: UserId,
        name: Option<String>,
        is_private: bool,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let name = match name {
            Some(name) => Some(Self::validate_name(name)?),
            None => None,
        };
        Ok(Self {
            id: RoomId::random(),
            kind: RoomKind::Group,
            name,
            is_private,
            created_by: creator,
            created_at,
            deleted_at: None,
        })
    }

    pub fn is_direct(&self) -> bool {
        self.kind == RoomKind::Direct
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn validate_name(name: String) -> Result<String, DomainError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("name", "cannot be empty"));
        }
        if trimmed.chars().count() > 100 {
            return Err(DomainError::invalid_argument("name", "too long"));
        }
        Ok(trimmed.to_owned())
    }
}
