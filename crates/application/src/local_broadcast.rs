// 进程内的事件总线
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::broadcaster::{BroadcastError, EventBus, EventEnvelope};

/// 基于 tokio broadcast 的总线。单实例部署使用；多个网关共享同一个实例即可模拟多实例。
#[derive(Clone)]
pub struct LocalEventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// 转成与 Redis 订阅端相同形式的接收端
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "本地事件总线订阅者落后，丢弃部分事件");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<usize, BroadcastError> {
        // 没有订阅者不算失败
        Ok(self.sender.send(envelope.clone()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Audience;
    use crate::events::{ServerEvent, TypingUpdate};
    use domain::{InstanceId, RoomId, UserId};
    use uuid::Uuid;

    #[tokio::test]
    async fn every_subscriber_receives_the_envelope() {
        let bus = LocalEventBus::default();
        let mut first = bus.subscribe_channel();
        let mut second = bus.subscribe_channel();

        let room_id = RoomId::random();
        let envelope = EventEnvelope::new(
            InstanceId::random(),
            Audience::Room(room_id),
            ServerEvent::Typing(TypingUpdate {
                room_id,
                user_id: UserId::from(Uuid::new_v4()),
                is_typing: true,
            }),
        );

        assert_eq!(bus.publish(&envelope).await.unwrap(), 2);
        assert_eq!(first.recv().await.unwrap(), envelope);
        assert_eq!(second.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = LocalEventBus::default();
        let envelope = EventEnvelope::new(
            InstanceId::random(),
            Audience::User(UserId::from(Uuid::new_v4())),
            ServerEvent::Authenticated(crate::events::Authenticated {
                user_id: UserId::from(Uuid::new_v4()),
                rooms: vec![],
            }),
        );
        assert_eq!(bus.publish(&envelope).await.unwrap(), 0);
    }
}
