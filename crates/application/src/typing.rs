use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{RoomId, UserId};
use uuid::Uuid;

use crate::clock::{unix_millis, Clock};
use crate::error::ApplicationError;

/// 房间内"正在输入"状态
///
/// 条目在 TTL 后自动失效，显式的 stop 立即生效。
#[async_trait]
pub trait TypingTracker: Send + Sync {
    /// 重复调用会刷新过期时间
    async fn start_typing(&self, room_id: RoomId, user_id: UserId) -> Result<(), ApplicationError>;

    /// 返回该用户之前是否处于输入状态
    async fn stop_typing(&self, room_id: RoomId, user_id: UserId) -> Result<bool, ApplicationError>;

    async fn list_typing(&self, room_id: RoomId) -> Result<Vec<UserId>, ApplicationError>;

    /// 清除用户在所有房间的输入状态，返回仍处于输入中的房间
    async fn clear_user(&self, user_id: UserId) -> Result<Vec<RoomId>, ApplicationError>;
}

/// Redis实现
///
/// 每个房间一个有序集合，分值是条目的过期时间（毫秒）；另有每用户一个集合记录其输入中的房间，
/// 断线时据此清理。两个键本身都带 `ttl + grace` 的过期时间。
pub struct RedisTypingTracker {
    redis_client: Arc<redis::Client>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    grace: Duration,
}

impl RedisTypingTracker {
    pub fn new(
        redis_client: Arc<redis::Client>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            redis_client,
            clock,
            ttl,
            grace,
        }
    }

    fn room_key(room_id: RoomId) -> String {
        format!("typing:room:{}", room_id)
    }

    fn user_key(user_id: UserId) -> String {
        format!("typing:user:{}", user_id)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, ApplicationError> {
        self.redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                let message = format!("Redis connection failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })
    }
}

fn redis_failure(e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis operation failed: {e}");
    ApplicationError::infrastructure_with_source(message, e)
}

#[async_trait]
impl TypingTracker for RedisTypingTracker {
    async fn start_typing(&self, room_id: RoomId, user_id: UserId) -> Result<(), ApplicationError> {
        let now = unix_millis(self.clock.now());
        let expires_at = now + self.ttl.as_millis() as i64;
        let key_ttl = (self.ttl + self.grace).as_millis() as i64;
        let room_key = Self::room_key(room_id);
        let user_key = Self::user_key(user_id);

        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .zadd(&room_key, user_id.to_string(), expires_at)
            .ignore()
            .pexpire(&room_key, key_ttl)
            .ignore()
            .sadd(&user_key, room_id.to_string())
            .ignore()
            .pexpire(&user_key, key_ttl)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;
        Ok(())
    }

    async fn stop_typing(&self, room_id: RoomId, user_id: UserId) -> Result<bool, ApplicationError> {
        let now = unix_millis(self.clock.now());
        let room_key = Self::room_key(room_id);

        let mut conn = self.get_connection().await?;
        let (score, _, _): (Option<f64>, i64, i64) = redis::pipe()
            .zscore(&room_key, user_id.to_string())
            .zrem(&room_key, user_id.to_string())
            .srem(Self::user_key(user_id), room_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        Ok(score.is_some_and(|expires_at| expires_at > now as f64))
    }

    async fn list_typing(&self, room_id: RoomId) -> Result<Vec<UserId>, ApplicationError> {
        let now = unix_millis(self.clock.now());
        let room_key = Self::room_key(room_id);

        let mut conn = self.get_connection().await?;
        let (members,): (Vec<String>,) = redis::pipe()
            .zrembyscore(&room_key, "-inf", now)
            .ignore()
            .zrange(&room_key, 0, -1)
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        Ok(members
            .iter()
            .filter_map(|raw| raw.parse::<Uuid>().ok())
            .map(UserId::from)
            .collect())
    }

    async fn clear_user(&self, user_id: UserId) -> Result<Vec<RoomId>, ApplicationError> {
        let now = unix_millis(self.clock.now());
        let user_key = Self::user_key(user_id);
        let member = user_id.to_string();

        let mut conn = self.get_connection().await?;
        let rooms: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&user_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;
        let rooms: Vec<RoomId> = rooms
            .iter()
            .filter_map(|raw| raw.parse::<Uuid>().ok())
            .map(RoomId::from)
            .collect();
        if rooms.is_empty() {
            return Ok(Vec::new());
        }

        let mut lookup = redis::pipe();
        for room_id in &rooms {
            lookup.zscore(Self::room_key(*room_id), &member);
        }
        let scores: Vec<Option<f64>> = lookup
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        let mut cleanup = redis::pipe();
        for room_id in &rooms {
            cleanup.zrem(Self::room_key(*room_id), &member).ignore();
        }
        cleanup.del(&user_key).ignore();
        let _: () = cleanup
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        Ok(rooms
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| score.is_some_and(|expires_at| expires_at > now as f64))
            .map(|(room_id, _)| room_id)
            .collect())
    }
}

pub mod memory {
    use std::collections::HashMap;

    use domain::Timestamp;
    use tokio::sync::Mutex;

    use super::*;

    pub struct MemoryTypingTracker {
        clock: Arc<dyn Clock>,
        ttl: Duration,
        rooms: Mutex<HashMap<RoomId, HashMap<UserId, Timestamp>>>,
    }

    impl MemoryTypingTracker {
        pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
            Self {
                clock,
                ttl,
                rooms: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl TypingTracker for MemoryTypingTracker {
        async fn start_typing(
            &self,
            room_id: RoomId,
            user_id: UserId,
        ) -> Result<(), ApplicationError> {
            let expires_at = self.clock.now() + self.ttl;
            self.rooms
                .lock()
                .await
                .entry(room_id)
                .or_default()
                .insert(user_id, expires_at);
            Ok(())
        }

        async fn stop_typing(
            &self,
            room_id: RoomId,
            user_id: UserId,
        ) -> Result<bool, ApplicationError> {
            let now = self.clock.now();
            let mut rooms = self.rooms.lock().await;
            let removed = rooms
                .get_mut(&room_id)
                .and_then(|entries| entries.remove(&user_id));
            Ok(removed.is_some_and(|expires_at| expires_at > now))
        }

        async fn list_typing(&self, room_id: RoomId) -> Result<Vec<UserId>, ApplicationError> {
            let now = self.clock.now();
            let mut rooms = self.rooms.lock().await;
            let Some(entries) = rooms.get_mut(&room_id) else {
                return Ok(Vec::new());
            };
            entries.retain(|_, expires_at| *expires_at > now);
            let mut users: Vec<UserId> = entries.keys().copied().collect();
            users.sort();
            Ok(users)
        }

        async fn clear_user(&self, user_id: UserId) -> Result<Vec<RoomId>, ApplicationError> {
            let now = self.clock.now();
            let mut rooms = self.rooms.lock().await;
            let mut cleared = Vec::new();
            for (room_id, entries) in rooms.iter_mut() {
                if let Some(expires_at) = entries.remove(&user_id) {
                    if expires_at > now {
                        cleared.push(*room_id);
                    }
                }
            }
            rooms.retain(|_, entries| !entries.is_empty());
            Ok(cleared)
        }
    }
}
