use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = OffsetDateTime;

/// 将时间戳截断到微秒精度。
///
/// PostgreSQL 的 `timestamptz` 只保存到微秒，所有进入领域模型的时间都先截断，
/// 保证内存中的排序与数据库中的排序完全一致。
pub fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    let micros = ts.nanosecond() / 1_000 * 1_000;
    ts.replace_nanosecond(micros).unwrap_or(ts)
}

/// 用户唯一标识（由外部认证系统签发）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| DomainError::invalid_argument("user_id", "not a uuid"))
    }
}

/// 单聊房间 ID 的命名空间。
const DIRECT_ROOM_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d2e_8a4b_4c1e_9d7a_3b5e_0c4f_1a22);

/// 聊天室唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// 群聊使用随机 ID。
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// 单聊房间 ID 由两个成员确定性地推导。
    ///
    /// 先对两个用户 ID 排序，再以固定命名空间计算 UUIDv5，
    /// 因此 `direct(a, b) == direct(b, a)`，重复创建总是落到同一行。
    pub fn direct(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let name = format!("direct:{}:{}", low.0.simple(), high.0.simple());
        Self(Uuid::new_v5(&DIRECT_ROOM_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RoomId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<RoomId> for Uuid {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl FromStr for RoomId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| DomainError::invalid_argument("room_id", "not a uuid"))
    }
}

/// 消息唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// 生成按时间递增的 UUIDv7，用作同一微秒内的次级排序键。
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<MessageId> for Uuid {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// 网关实例标识，每个进程启动时生成一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 连接句柄：哪个实例上的哪条连接正在服务该用户。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHandle {
    pub instance_id: InstanceId,
    pub connection_id: Uuid,
}

impl ConnectionHandle {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            connection_id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.connection_id)
    }
}
