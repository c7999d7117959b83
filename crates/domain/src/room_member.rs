use crate::errors::DomainError;
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
    /// 软退出：保留记录用于审计，但不再接收广播。
    Left,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
            MemberRole::Left => "left",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "admin" => Ok(MemberRole::Admin),
            "member" => Ok(MemberRole::Member),
            "left" => Ok(MemberRole::Left),
            other => Err(DomainError::invalid_argument(
                "role",
                format!("unknown role {other}"),
            )),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, MemberRole::Left)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: MemberRole,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: Timestamp,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub left_at: Option<Timestamp>,
    pub last_read_message_id: Option<MessageId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_read_at: Option<Timestamp>,
    pub notifications_enabled: bool,
}

impl Membership {
    pub fn new(room_id: RoomId, user_id: UserId, role: MemberRole, joined_at: Timestamp) -> Self {
        Self {
            room_id,
            user_id,
            role,
            joined_at,
            left_at: None,
            last_read_message_id: None,
            last_read_at: None,
            notifications_enabled: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.role.is_active()
    }

    pub fn is_admin(&self) -> bool {
        self.role == MemberRole::Admin
    }

    /// member/admin → left；已经离开的成员不能再次离开。
    pub fn leave(&mut self, at: Timestamp) -> Result<(), DomainError> {
        if !self.is_active() {
            return Err(DomainError::not_allowed("member already left"));
        }
        self.role = MemberRole::Left;
        self.left_at = Some(at);
        Ok(())
    }

    /// 仅在 member 与 admin 之间切换。
    pub fn change_role(&mut self, role: MemberRole) -> Result<(), DomainError> {
        if !self.is_active() {
            return Err(DomainError::not_allowed("member has left the room"));
        }
        if role == MemberRole::Left {
            return Err(DomainError::invalid_argument(
                "role",
                "use leave to exit a room",
            ));
        }
        self.role = role;
        Ok(())
    }

    pub fn record_last_read(&mut self, message_id: MessageId, at: Timestamp) {
        self.last_read_message_id = Some(message_id);
        self.last_read_at = Some(at);
    }
}
