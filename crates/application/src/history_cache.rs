use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{Message, MessageCursor, RoomId};

use crate::clock::Clock;
use crate::error::ApplicationError;

/// 房间最新消息的读穿缓存
///
/// 每个房间缓存的是"最新的一段连续消息"：新消息追加到末尾，首页回源结果并入窗口，
/// 超出容量时从最旧的一端裁剪。因此窗口内任意游标之前的消息都是连续的，
/// 只要窗口里游标之前的条目数足够，就能直接回答这一页。
#[async_trait]
pub trait HistoryCache: Send + Sync {
    async fn put(&self, room_id: RoomId, message: &Message) -> Result<(), ApplicationError>;

    /// 房间的失效代数，每次 `invalidate` 都会让它变化。
    async fn generation(&self, room_id: RoomId) -> Result<u64, ApplicationError>;

    /// 并入从数据库读到的最新一页（必须是不带游标的首页）。
    /// `generation` 是读库之前取到的代数；期间房间被失效过则放弃写入并返回 `false`。
    async fn put_many(
        &self,
        room_id: RoomId,
        generation: u64,
        messages: &[Message],
    ) -> Result<bool, ApplicationError>;

    /// 返回 `before` 之前最近的 `limit` 条消息（新到旧）；窗口不足以回答时返回 `None`。
    async fn get(
        &self,
        room_id: RoomId,
        before: Option<MessageCursor>,
        limit: usize,
    ) -> Result<Option<Vec<Message>>, ApplicationError>;

    async fn invalidate(&self, room_id: RoomId) -> Result<(), ApplicationError>;
}

/// 微秒级分值在 f64 中可以精确表示，有序集合里的顺序与 (created_at, id) 一致：
/// 分值相同的成员按字典序排列，而小写带连字符的 UUID 字符串字典序与字节序相同。
fn score(cursor: &MessageCursor) -> f64 {
    (cursor.created_at.unix_timestamp_nanos() / 1_000) as f64
}

/// 代数一致时才写入首页，裁剪与写入在同一个脚本里完成
const WARM_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current ~= tonumber(ARGV[1]) then
  return 0
end
for i = 4, #ARGV, 3 do
  redis.call('ZADD', KEYS[2], ARGV[i + 1], ARGV[i])
  redis.call('HSET', KEYS[3], ARGV[i], ARGV[i + 2])
end
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('EXPIRE', KEYS[3], ARGV[2])
local overflow = redis.call('ZRANGE', KEYS[2], 0, -tonumber(ARGV[3]) - 1)
if #overflow > 0 then
  redis.call('ZREM', KEYS[2], unpack(overflow))
  redis.call('HDEL', KEYS[3], unpack(overflow))
end
return 1
"#;

/// Redis实现：有序集合保存顺序，哈希表保存消息 JSON，另有一个代数键记录失效次数。
pub struct RedisHistoryCache {
    redis_client: Arc<redis::Client>,
    capacity: usize,
    ttl: Duration,
}

impl RedisHistoryCache {
    pub fn new(redis_client: Arc<redis::Client>, capacity: usize, ttl: Duration) -> Self {
        Self {
            redis_client,
            capacity,
            ttl,
        }
    }

    fn index_key(room_id: RoomId) -> String {
        format!("history:{}:index", room_id)
    }

    fn body_key(room_id: RoomId) -> String {
        format!("history:{}:messages", room_id)
    }

    fn generation_key(room_id: RoomId) -> String {
        format!("history:{}:gen", room_id)
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
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

    async fn store(&self, room_id: RoomId, messages: &[Message]) -> Result<(), ApplicationError> {
        if messages.is_empty() {
            return Ok(());
        }
        let index_key = Self::index_key(room_id);
        let body_key = Self::body_key(room_id);
        let ttl = self.ttl_secs();

        let mut pipe = redis::pipe();
        for message in messages {
            let body = encode(message)?;
            pipe.zadd(&index_key, message.id.to_string(), score(&message.cursor()))
                .ignore()
                .hset(&body_key, message.id.to_string(), body)
                .ignore();
        }
        pipe.expire(&index_key, ttl)
            .ignore()
            .expire(&body_key, ttl)
            .ignore()
            // 超出容量的最旧条目
            .zrange(&index_key, 0, -(self.capacity as isize) - 1);

        let mut conn = self.get_connection().await?;
        let (overflow,): (Vec<String>,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        if !overflow.is_empty() {
            let _: () = redis::pipe()
                .zrem(&index_key, &overflow)
                .ignore()
                .hdel(&body_key, &overflow)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(redis_failure)?;
        }
        Ok(())
    }
}

fn encode(message: &Message) -> Result<String, ApplicationError> {
    serde_json::to_string(message)
        .map_err(|e| ApplicationError::infrastructure_with_source("Failed to encode message", e))
}

fn redis_failure(e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis operation failed: {e}");
    ApplicationError::infrastructure_with_source(message, e)
}

#[async_trait]
impl HistoryCache for RedisHistoryCache {
    async fn put(&self, room_id: RoomId, message: &Message) -> Result<(), ApplicationError> {
        self.store(room_id, std::slice::from_ref(message)).await
    }

    async fn generation(&self, room_id: RoomId) -> Result<u64, ApplicationError> {
        let mut conn = self.get_connection().await?;
        let generation: Option<u64> = redis::cmd("GET")
            .arg(Self::generation_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;
        Ok(generation.unwrap_or(0))
    }

    async fn put_many(
        &self,
        room_id: RoomId,
        generation: u64,
        messages: &[Message],
    ) -> Result<bool, ApplicationError> {
        if messages.is_empty() {
            return Ok(true);
        }
        let script = redis::Script::new(WARM_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(Self::generation_key(room_id))
            .key(Self::index_key(room_id))
            .key(Self::body_key(room_id))
            .arg(generation)
            .arg(self.ttl_secs())
            .arg(self.capacity);
        for message in messages {
            invocation
                .arg(message.id.to_string())
                .arg(score(&message.cursor()))
                .arg(encode(message)?);
        }

        let mut conn = self.get_connection().await?;
        let written: i32 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(redis_failure)?;
        Ok(written == 1)
    }

    async fn get(
        &self,
        room_id: RoomId,
        before: Option<MessageCursor>,
        limit: usize,
    ) -> Result<Option<Vec<Message>>, ApplicationError> {
        if limit == 0 || limit > self.capacity {
            return Ok(None);
        }
        let index_key = Self::index_key(room_id);
        let mut conn = self.get_connection().await?;

        let ids: Vec<String> = match before {
            None => redis::cmd("ZREVRANGE")
                .arg(&index_key)
                .arg(0)
                .arg(limit as isize - 1)
                .query_async(&mut conn)
                .await
                .map_err(redis_failure)?,
            Some(cursor) => {
                // 同一微秒内可能有多条消息，多取一些再按 id 精确过滤
                let slack = 16;
                let candidates: Vec<(String, f64)> = redis::cmd("ZREVRANGEBYSCORE")
                    .arg(&index_key)
                    .arg(score(&cursor))
                    .arg("-inf")
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit + slack)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_failure)?;
                let cursor_score = score(&cursor);
                let cursor_id = cursor.id.to_string();
                let fetched = candidates.len();
                let filtered: Vec<String> = candidates
                    .into_iter()
                    .filter(|(id, s)| *s < cursor_score || *id < cursor_id)
                    .map(|(id, _)| id)
                    .take(limit)
                    .collect();
                if filtered.len() < limit && fetched == limit + slack {
                    return Ok(None);
                }
                filtered
            }
        };

        if ids.len() < limit {
            return Ok(None);
        }

        let bodies: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(Self::body_key(room_id))
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;

        let mut messages = Vec::with_capacity(bodies.len());
        for body in bodies {
            // 索引与正文不一致（例如过期时间错开）时按未命中处理
            let Some(body) = body else {
                return Ok(None);
            };
            match serde_json::from_str::<Message>(&body) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::warn!(room_id = %room_id, error = %err, "缓存中的消息无法解析");
                    return Ok(None);
                }
            }
        }
        Ok(Some(messages))
    }

    async fn invalidate(&self, room_id: RoomId) -> Result<(), ApplicationError> {
        let mut conn = self.get_connection().await?;
        let generation_key = Self::generation_key(room_id);
        let _: () = redis::pipe()
            .atomic()
            .del(vec![Self::index_key(room_id), Self::body_key(room_id)])
            .ignore()
            .incr(&generation_key, 1)
            .ignore()
            .expire(&generation_key, self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_failure)?;
        Ok(())
    }
}

pub mod memory {
    use std::collections::{BTreeMap, HashMap};

    use domain::Timestamp;
    use tokio::sync::Mutex;

    use super::*;

    struct RoomWindow {
        messages: BTreeMap<MessageCursor, Message>,
        expires_at: Timestamp,
        last_access: u64,
    }

    #[derive(Default)]
    struct Windows {
        rooms: HashMap<RoomId, RoomWindow>,
        /// 房间 → (代数, 失效时间)；超过 TTL 的记录会被清掉
        generations: HashMap<RoomId, (u64, Timestamp)>,
        tick: u64,
    }

    /// 内存 LRU 缓存：按房间淘汰最久未访问的窗口，每个窗口有独立的过期时间。
    pub struct MemoryHistoryCache {
        clock: Arc<dyn Clock>,
        capacity: usize,
        max_rooms: usize,
        ttl: Duration,
        windows: Mutex<Windows>,
    }

    impl MemoryHistoryCache {
        pub fn new(clock: Arc<dyn Clock>, capacity: usize, max_rooms: usize, ttl: Duration) -> Self {
            Self {
                clock,
                capacity,
                max_rooms,
                ttl,
                windows: Mutex::new(Windows::default()),
            }
        }

        fn evict_if_needed(&self, windows: &mut Windows, now: Timestamp) {
            windows.rooms.retain(|_, window| window.expires_at > now);
            while windows.rooms.len() >= self.max_rooms {
                let Some(lru) = windows
                    .rooms
                    .iter()
                    .min_by_key(|(_, window)| window.last_access)
                    .map(|(room_id, _)| *room_id)
                else {
                    break;
                };
                windows.rooms.remove(&lru);
            }
        }

        async fn store(&self, room_id: RoomId, messages: &[Message]) {
            let mut windows = self.windows.lock().await;
            self.store_locked(&mut windows, room_id, messages);
        }

        fn store_locked(&self, windows: &mut Windows, room_id: RoomId, messages: &[Message]) {
            if messages.is_empty() {
                return;
            }
            let now = self.clock.now();
            windows.tick += 1;
            let tick = windows.tick;

            if !windows.rooms.contains_key(&room_id) {
                self.evict_if_needed(windows, now);
            }
            let window = windows.rooms.entry(room_id).or_insert_with(|| RoomWindow {
                messages: BTreeMap::new(),
                expires_at: now + self.ttl,
                last_access: tick,
            });
            if window.expires_at <= now {
                window.messages.clear();
            }
            for message in messages {
                window.messages.insert(message.cursor(), message.clone());
            }
            while window.messages.len() > self.capacity {
                window.messages.pop_first();
            }
            window.expires_at = now + self.ttl;
            window.last_access = tick;
        }
    }

    #[async_trait]
    impl HistoryCache for MemoryHistoryCache {
        async fn put(&self, room_id: RoomId, message: &Message) -> Result<(), ApplicationError> {
            self.store(room_id, std::slice::from_ref(message)).await;
            Ok(())
        }

        async fn generation(&self, room_id: RoomId) -> Result<u64, ApplicationError> {
            let windows = self.windows.lock().await;
            Ok(windows
                .generations
                .get(&room_id)
                .map(|(generation, _)| *generation)
                .unwrap_or(0))
        }

        async fn put_many(
            &self,
            room_id: RoomId,
            generation: u64,
            messages: &[Message],
        ) -> Result<bool, ApplicationError> {
            let mut windows = self.windows.lock().await;
            let current = windows
                .generations
                .get(&room_id)
                .map(|(generation, _)| *generation)
                .unwrap_or(0);
            if current != generation {
                return Ok(false);
            }
            self.store_locked(&mut windows, room_id, messages);
            Ok(true)
        }

        async fn get(
            &self,
            room_id: RoomId,
            before: Option<MessageCursor>,
            limit: usize,
        ) -> Result<Option<Vec<Message>>, ApplicationError> {
            let now = self.clock.now();
            let mut windows = self.windows.lock().await;
            windows.tick += 1;
            let tick = windows.tick;

            let expired = match windows.rooms.get(&room_id) {
                Some(window) => window.expires_at <= now,
                None => return Ok(None),
            };
            if expired {
                windows.rooms.remove(&room_id);
                return Ok(None);
            }
            let Some(window) = windows.rooms.get_mut(&room_id) else {
                return Ok(None);
            };
            window.last_access = tick;

            let page: Vec<Message> = match before {
                Some(cursor) => window
                    .messages
                    .range(..cursor)
                    .rev()
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect(),
                None => window.messages.values().rev().take(limit).cloned().collect(),
            };
            if limit == 0 || page.len() < limit {
                return Ok(None);
            }
            Ok(Some(page))
        }

        async fn invalidate(&self, room_id: RoomId) -> Result<(), ApplicationError> {
            let now = self.clock.now();
            let ttl = self.ttl;
            let mut windows = self.windows.lock().await;
            windows.rooms.remove(&room_id);
            windows.tick += 1;
            let generation = windows.tick;
            windows.generations.retain(|_, (_, at)| *at + ttl > now);
            windows.generations.insert(room_id, (generation, now));
            Ok(())
        }
    }
}
