use std::sync::Arc;

use async_trait::async_trait;
use config::{RateLimitConfig, RateLimitRule, RateLimitStrategy};
use domain::UserId;

use crate::clock::{unix_millis, Clock};
use crate::error::ApplicationError;

/// 限流计数存储。所有计数都带 TTL，从不持久化。
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 固定窗口：首次计数时设置窗口长度的过期时间，超过 `limit` 后拒绝直到过期。
    async fn allow(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool, ApplicationError>;

    /// 滑动窗口：清理 `now - window_millis` 之前的记录，剩余数量达到 `limit` 时拒绝。
    async fn allow_sliding(
        &self,
        key: &str,
        limit: u32,
        window_millis: u64,
    ) -> Result<bool, ApplicationError>;
}

/// 受限流保护的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitedAction {
    SendMessage,
    Typing,
    CreateRoom,
}

impl RateLimitedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitedAction::SendMessage => "message.send",
            RateLimitedAction::Typing => "typing",
            RateLimitedAction::CreateRoom => "room.create",
        }
    }
}

/// 按动作类型套用配置规则的限流器
///
/// 存储不可用时放行并记录告警，限流故障不能阻断消息收发。
pub struct ActionRateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl ActionRateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn rule(&self, action: RateLimitedAction) -> RateLimitRule {
        match action {
            RateLimitedAction::SendMessage => self.config.send_message,
            RateLimitedAction::Typing => self.config.typing,
            RateLimitedAction::CreateRoom => self.config.create_room,
        }
    }

    fn key(action: RateLimitedAction, user_id: UserId) -> String {
        format!("rate:{}:{}", action.as_str(), user_id)
    }

    pub async fn check(
        &self,
        action: RateLimitedAction,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let rule = self.rule(action);
        let key = Self::key(action, user_id);
        let allowed = match rule.strategy {
            RateLimitStrategy::Fixed => self.store.allow(&key, rule.limit, rule.window_secs).await,
            RateLimitStrategy::Sliding => {
                self.store
                    .allow_sliding(&key, rule.limit, rule.window_secs * 1_000)
                    .await
            }
        };

        match allowed {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(user_id = %user_id, action = action.as_str(), "触发限流");
                Err(ApplicationError::RateLimitExceeded {
                    action: action.as_str().to_owned(),
                })
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    action = action.as_str(),
                    error = %err,
                    "限流存储不可用，放行请求"
                );
                Ok(())
            }
        }
    }
}

/// Redis实现的限流存储
pub struct RedisRateLimitStore {
    redis_client: Arc<redis::Client>,
    clock: Arc<dyn Clock>,
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= limit then
  return 0
end
redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
return 1
"#;

impl RedisRateLimitStore {
    pub fn new(redis_client: Arc<redis::Client>, clock: Arc<dyn Clock>) -> Self {
        Self {
            redis_client,
            clock,
        }
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

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn allow(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool, ApplicationError> {
        let mut conn = self.get_connection().await?;

        // SET NX 只在窗口的第一次计数时设置过期时间，INCR 保留已有 TTL
        let (count,): (u64,) = redis::pipe()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(window_secs)
            .arg("NX")
            .ignore()
            .incr(key, 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                let message = format!("Redis operation failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })?;

        Ok(count <= u64::from(limit))
    }

    async fn allow_sliding(
        &self,
        key: &str,
        limit: u32,
        window_millis: u64,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.get_connection().await?;
        let now = unix_millis(self.clock.now());
        // 同一毫秒内的多次请求需要不同的成员
        let member = format!("{now}-{}", uuid::Uuid::new_v4().simple());

        let allowed: i32 = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(key)
            .arg(now)
            .arg(window_millis)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                let message = format!("Redis operation failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })?;

        Ok(allowed == 1)
    }
}

pub mod memory {
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use domain::Timestamp;
    use tokio::sync::Mutex;

    use super::*;

    struct FixedWindow {
        count: u64,
        expires_at: Timestamp,
    }

    struct SlidingLog {
        window: Duration,
        hits: VecDeque<Timestamp>,
    }

    impl SlidingLog {
        fn purge(&mut self, now: Timestamp) {
            let horizon = now - self.window;
            while self.hits.front().is_some_and(|at| *at <= horizon) {
                self.hits.pop_front();
            }
        }
    }

    #[derive(Default)]
    struct Counters {
        fixed: HashMap<String, FixedWindow>,
        sliding: HashMap<String, SlidingLog>,
    }

    pub struct MemoryRateLimitStore {
        clock: Arc<dyn Clock>,
        counters: Mutex<Counters>,
    }

    impl MemoryRateLimitStore {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                clock,
                counters: Mutex::new(Counters::default()),
            }
        }

        #[cfg(test)]
        pub(crate) async fn tracked_keys(&self) -> usize {
            let counters = self.counters.lock().await;
            counters.fixed.len() + counters.sliding.len()
        }
    }

    #[async_trait]
    impl RateLimitStore for MemoryRateLimitStore {
        async fn allow(
            &self,
            key: &str,
            limit: u32,
            window_secs: u64,
        ) -> Result<bool, ApplicationError> {
            let now = self.clock.now();
            let mut counters = self.counters.lock().await;
            counters.fixed.retain(|_, window| window.expires_at > now);

            let window = counters
                .fixed
                .entry(key.to_owned())
                .or_insert_with(|| FixedWindow {
                    count: 0,
                    expires_at: now + Duration::from_secs(window_secs),
                });
            window.count += 1;
            Ok(window.count <= u64::from(limit))
        }

        async fn allow_sliding(
            &self,
            key: &str,
            limit: u32,
            window_millis: u64,
        ) -> Result<bool, ApplicationError> {
            let now = self.clock.now();
            let mut counters = self.counters.lock().await;
            // 窗口内已没有记录的键直接移除
            counters.sliding.retain(|_, log| {
                log.purge(now);
                !log.hits.is_empty()
            });

            let log = counters
                .sliding
                .entry(key.to_owned())
                .or_insert_with(|| SlidingLog {
                    window: Duration::from_millis(window_millis),
                    hits: VecDeque::new(),
                });
            log.window = Duration::from_millis(window_millis);
            log.purge(now);
            if log.hits.len() >= limit as usize {
                if log.hits.is_empty() {
                    counters.sliding.remove(key);
                }
                return Ok(false);
            }
            log.hits.push_back(now);
            Ok(true)
        }
    }
}
