use std::sync::Arc;

use application::history_cache::memory::MemoryHistoryCache;
use application::presence::memory::MemoryPresenceStore;
use application::rate_limiter::memory::MemoryRateLimitStore;
use application::repository::memory::{
    MemoryLastSeenRepository, MemoryMessageRepository, MemoryRoomRepository,
};
use application::typing::memory::MemoryTypingTracker;
use application::{
    spawn_remote_listener, ActionRateLimiter, ChatGateway, ChatGatewayDependencies, Clock,
    DirectoryService, DirectoryServiceDependencies, EventBus, EventEnvelope, HistoryCache,
    LastSeenRepository, LocalEventBus, MessageRepository, MessageService,
    MessageServiceDependencies, PresenceStore, RateLimitStore, RedisHistoryCache,
    RedisPresenceStore, RedisRateLimitStore, RedisTypingTracker, RoomRepository, SystemClock,
    TokenVerifier, TypingTracker,
};
use config::{AppConfig, DatabaseBackend, FastStoreBackend};
use domain::InstanceId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    fallback_broadcaster::FallbackEventBus,
    migrations::MIGRATOR,
    redis::{spawn_subscriber, RedisError, RedisEventBus},
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
}

/// 按配置选出的全部后端
pub struct Infrastructure {
    pub config: AppConfig,
    pub instance_id: InstanceId,
    pub clock: Arc<dyn Clock>,
    pub room_repository: Arc<dyn RoomRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub last_seen_repository: Arc<dyn LastSeenRepository>,
    pub presence: Arc<dyn PresenceStore>,
    pub typing: Arc<dyn TypingTracker>,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub history_cache: Arc<dyn HistoryCache>,
    pub event_bus: Arc<dyn EventBus>,
    /// 其他实例（内存模式下是自己）发布的事件
    pub remote_events: mpsc::UnboundedReceiver<EventEnvelope>,
}

/// 组装好的核心服务
#[derive(Clone)]
pub struct ChatServices {
    pub gateway: Arc<ChatGateway>,
    pub directory: Arc<DirectoryService>,
    pub messages: Arc<MessageService>,
    pub presence: Arc<dyn PresenceStore>,
    pub last_seen: Arc<dyn LastSeenRepository>,
}

impl Infrastructure {
    pub async fn connect(config: AppConfig) -> Result<Self, InfrastructureError> {
        let instance_id = config
            .server
            .instance_id
            .map(InstanceId)
            .unwrap_or_else(InstanceId::random);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (room_repository, message_repository, last_seen_repository): (
            Arc<dyn RoomRepository>,
            Arc<dyn MessageRepository>,
            Arc<dyn LastSeenRepository>,
        ) = match config.database.backend {
            DatabaseBackend::Postgres => {
                let pool =
                    create_pg_pool(&config.database.url, config.database.max_connections).await?;
                MIGRATOR.run(&pool).await?;
                let storage = PgStorage::new(pool);
                info!("使用 PostgreSQL 持久化");
                (
                    storage.room_repository,
                    storage.message_repository,
                    storage.last_seen_repository,
                )
            }
            DatabaseBackend::Memory => {
                info!("使用进程内持久化，重启后数据丢失");
                (
                    Arc::new(MemoryRoomRepository::new()),
                    Arc::new(MemoryMessageRepository::new()),
                    Arc::new(MemoryLastSeenRepository::new()),
                )
            }
        };

        let infrastructure = match config.redis.backend {
            FastStoreBackend::Redis => {
                let client = Arc::new(redis::Client::open(config.redis.url.as_str()).map_err(
                    |e| RedisError::ConfigError {
                        message: format!("创建 Redis 客户端失败: {e}"),
                    },
                )?);
                let redis_bus =
                    RedisEventBus::connect(&client, config.redis.channel_prefix.clone()).await?;
                let (_listener, remote_events) =
                    spawn_subscriber(client.clone(), config.redis.channel_prefix.clone());
                info!(instance_id = %instance_id, "使用 Redis 快速存储与跨实例广播");

                Self {
                    presence: Arc::new(RedisPresenceStore::new(
                        client.clone(),
                        clock.clone(),
                        config.presence.ttl(),
                    )),
                    typing: Arc::new(RedisTypingTracker::new(
                        client.clone(),
                        clock.clone(),
                        config.typing.ttl(),
                        config.typing.grace(),
                    )),
                    rate_limit_store: Arc::new(RedisRateLimitStore::new(
                        client.clone(),
                        clock.clone(),
                    )),
                    history_cache: Arc::new(RedisHistoryCache::new(
                        client,
                        config.history.cache_capacity,
                        config.history.cache_ttl(),
                    )),
                    event_bus: Arc::new(FallbackEventBus::new(Arc::new(redis_bus))),
                    remote_events,
                    instance_id,
                    clock,
                    room_repository,
                    message_repository,
                    last_seen_repository,
                    config,
                }
            }
            FastStoreBackend::Memory => {
                let bus = LocalEventBus::default();
                let remote_events = bus.subscribe_channel();
                info!(instance_id = %instance_id, "使用进程内快速存储，仅支持单实例");

                Self {
                    presence: Arc::new(MemoryPresenceStore::new(
                        clock.clone(),
                        config.presence.ttl(),
                    )),
                    typing: Arc::new(MemoryTypingTracker::new(clock.clone(), config.typing.ttl())),
                    rate_limit_store: Arc::new(MemoryRateLimitStore::new(clock.clone())),
                    history_cache: Arc::new(MemoryHistoryCache::new(
                        clock.clone(),
                        config.history.cache_capacity,
                        config.history.max_cached_rooms,
                        config.history.cache_ttl(),
                    )),
                    event_bus: Arc::new(bus),
                    remote_events,
                    instance_id,
                    clock,
                    room_repository,
                    message_repository,
                    last_seen_repository,
                    config,
                }
            }
        };

        Ok(infrastructure)
    }

    /// 组装目录、消息管道和网关，并启动跨实例事件监听
    pub fn into_services(
        self,
        token_verifier: Arc<dyn TokenVerifier>,
    ) -> (ChatServices, JoinHandle<()>) {
        let directory = Arc::new(DirectoryService::new(DirectoryServiceDependencies {
            room_repository: self.room_repository,
            clock: self.clock.clone(),
        }));
        let messages = Arc::new(MessageService::new(MessageServiceDependencies {
            message_repository: self.message_repository,
            directory: directory.clone(),
            history_cache: self.history_cache,
            clock: self.clock.clone(),
            history: self.config.history.clone(),
        }));
        let rate_limiter = Arc::new(ActionRateLimiter::new(
            self.rate_limit_store,
            self.config.rate_limit.clone(),
        ));

        let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
            instance_id: self.instance_id,
            directory: directory.clone(),
            messages: messages.clone(),
            presence: self.presence.clone(),
            typing: self.typing,
            rate_limiter,
            event_bus: self.event_bus,
            token_verifier,
            last_seen: self.last_seen_repository.clone(),
            clock: self.clock,
        }));
        let listener = spawn_remote_listener(gateway.clone(), self.remote_events);

        (
            ChatServices {
                gateway,
                directory,
                messages,
                presence: self.presence,
                last_seen: self.last_seen_repository,
            },
            listener,
        )
    }
}
