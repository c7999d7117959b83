use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{ConnectionHandle, PresenceRecord, PresenceStatus, UserId};

use crate::clock::Clock;
use crate::error::ApplicationError;

/// 在线状态存储
///
/// 尽力而为：没有记录等价于离线，永远不是错误。同一用户的写入后写者胜出。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        connection: Option<ConnectionHandle>,
    ) -> Result<PresenceRecord, ApplicationError>;

    async fn get_presence(&self, user_id: UserId)
        -> Result<Option<PresenceRecord>, ApplicationError>;

    /// 返回给定用户中当前在线的子集，保持输入顺序。
    async fn get_online(&self, user_ids: &[UserId]) -> Result<Vec<UserId>, ApplicationError>;
}

/// Redis实现的在线状态存储
///
/// 每个用户一条 JSON 记录，`SET EX` 写入，过期即视为离线。
pub struct RedisPresenceStore {
    redis_client: Arc<redis::Client>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl RedisPresenceStore {
    pub fn new(redis_client: Arc<redis::Client>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            redis_client,
            clock,
            ttl,
        }
    }

    fn presence_key(user_id: UserId) -> String {
        format!("presence:{}", user_id)
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

fn decode_record(raw: &str) -> Option<PresenceRecord> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::warn!(error = %err, "丢弃无法解析的在线状态记录");
            None
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        connection: Option<ConnectionHandle>,
    ) -> Result<PresenceRecord, ApplicationError> {
        let record = PresenceRecord::new(user_id, status, connection, self.clock.now());
        let payload = serde_json::to_string(&record).map_err(|e| {
            ApplicationError::infrastructure_with_source("Failed to encode presence", e)
        })?;

        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(Self::presence_key(user_id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        tracing::debug!(user_id = %user_id, status = ?status, "在线状态已更新");
        Ok(record)
    }

    async fn get_presence(
        &self,
        user_id: UserId,
    ) -> Result<Option<PresenceRecord>, ApplicationError> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::presence_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;
        Ok(raw.as_deref().and_then(decode_record))
    }

    async fn get_online(&self, user_ids: &[UserId]) -> Result<Vec<UserId>, ApplicationError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = user_ids.iter().copied().map(Self::presence_key).collect();

        let mut conn = self.get_connection().await?;
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        Ok(user_ids
            .iter()
            .zip(raw)
            .filter(|(_, raw)| {
                raw.as_deref()
                    .and_then(decode_record)
                    .map(|record| record.is_online())
                    .unwrap_or(false)
            })
            .map(|(user_id, _)| *user_id)
            .collect())
    }
}

pub mod memory {
    use std::collections::HashMap;

    use domain::Timestamp;
    use tokio::sync::RwLock;

    use super::*;

    pub struct MemoryPresenceStore {
        clock: Arc<dyn Clock>,
        ttl: Duration,
        records: RwLock<HashMap<UserId, (PresenceRecord, Timestamp)>>,
    }

    impl MemoryPresenceStore {
        pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
            Self {
                clock,
                ttl,
                records: RwLock::new(HashMap::new()),
            }
        }

        async fn live(&self, user_id: UserId) -> Option<PresenceRecord> {
            let now = self.clock.now();
            self.records
                .read()
                .await
                .get(&user_id)
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(record, _)| record.clone())
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn set_presence(
            &self,
            user_id: UserId,
            status: PresenceStatus,
            connection: Option<ConnectionHandle>,
        ) -> Result<PresenceRecord, ApplicationError> {
            let now = self.clock.now();
            let record = PresenceRecord::new(user_id, status, connection, now);
            let mut records = self.records.write().await;
            records.retain(|_, (_, expires_at)| *expires_at > now);
            records.insert(user_id, (record.clone(), now + self.ttl));
            Ok(record)
        }

        async fn get_presence(
            &self,
            user_id: UserId,
        ) -> Result<Option<PresenceRecord>, ApplicationError> {
            Ok(self.live(user_id).await)
        }

        async fn get_online(&self, user_ids: &[UserId]) -> Result<Vec<UserId>, ApplicationError> {
            let mut online = Vec::new();
            for user_id in user_ids {
                if self.live(*user_id).await.is_some_and(|r| r.is_online()) {
                    online.push(*user_id);
                }
            }
            Ok(online)
        }
    }
}
