//! Redis 事件总线
//!
//! 发布端走 `ConnectionManager`（断线自动重连）；订阅端单独持有一条 PubSub 连接，
//! 断开后按指数退避重连，收到的信封经无界通道交给网关。

use std::sync::Arc;

use application::{Audience, BroadcastError, EventBus, EventEnvelope};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use super::error::{RedisError, RedisResult};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// 信封对应的频道名
pub fn channel_for(prefix: &str, audience: &Audience) -> String {
    match audience {
        Audience::Room(room_id) => format!("{prefix}room:{room_id}"),
        Audience::User(user_id) => format!("{prefix}user:{user_id}"),
    }
}

pub struct RedisEventBus {
    connection: ConnectionManager,
    channel_prefix: String,
}

impl RedisEventBus {
    pub async fn connect(client: &Client, channel_prefix: impl Into<String>) -> RedisResult<Self> {
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("创建 Redis 连接管理器失败: {e}"),
            })?;
        Ok(Self {
            connection,
            channel_prefix: channel_prefix.into(),
        })
    }

    async fn publish_payload(&self, channel: &str, payload: String) -> RedisResult<usize> {
        let mut connection = self.connection.clone();
        connection
            .publish::<_, _, usize>(channel, payload)
            .await
            .map_err(|e| RedisError::PublishError {
                message: format!("发布到频道 {channel} 失败: {e}"),
            })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<usize, BroadcastError> {
        let channel = channel_for(&self.channel_prefix, &envelope.audience);
        let payload = serde_json::to_string(envelope).map_err(RedisError::from)?;
        let receivers = self.publish_payload(&channel, payload).await?;
        debug!(channel = %channel, event_id = %envelope.event_id, receivers, "事件已发布");
        Ok(receivers)
    }
}

/// 模式订阅 `<prefix>*`，把解析出的信封送进返回的通道。
///
/// 接收端被丢弃后监听任务退出。
pub fn spawn_subscriber(
    client: Arc<Client>,
    channel_prefix: String,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<EventEnvelope>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let pattern = format!("{channel_prefix}*");
        let mut retry_count: u32 = 0;
        loop {
            match listen(&client, &pattern, &sender).await {
                Ok(()) => {
                    info!(pattern = %pattern, "Redis 订阅监听已停止");
                    break;
                }
                Err(err) => {
                    if sender.is_closed() {
                        break;
                    }
                    retry_count = retry_count.saturating_add(1);
                    let delay = Duration::from_millis(100 * 2_u64.pow(retry_count.min(10)))
                        .min(MAX_RECONNECT_DELAY);
                    error!(error = %err, retry_count, delay_ms = delay.as_millis() as u64, "Redis 订阅中断，稍后重连");
                    sleep(delay).await;
                }
            }
        }
    });
    (handle, receiver)
}

/// 返回 Ok 表示接收端已关闭；连接问题返回 Err 由调用方重连
async fn listen(
    client: &Client,
    pattern: &str,
    sender: &mpsc::UnboundedSender<EventEnvelope>,
) -> RedisResult<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RedisError::ConnectionError {
            message: format!("获取 PubSub 连接失败: {e}"),
        })?;
    pubsub
        .psubscribe(pattern)
        .await
        .map_err(|e| RedisError::SubscribeError {
            message: format!("订阅模式 {pattern} 失败: {e}"),
        })?;
    info!(pattern = %pattern, "已订阅 Redis 事件频道");

    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "获取消息负载失败");
                continue;
            }
        };
        match serde_json::from_str::<EventEnvelope>(&payload) {
            Ok(envelope) => {
                if sender.send(envelope).is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(channel = %msg.get_channel_name(), error = %e, "无法解析事件信封，已丢弃");
            }
        }
    }

    Err(RedisError::SubscribeError {
        message: "PubSub 连接已关闭".into(),
    })
}
