//! 应用层实现。
//!
//! 限流、在线状态、输入状态、历史缓存这些快速存储抽象与其 Redis 实现放在一起，
//! 房间目录与消息管道是围绕领域模型的用例服务，网关把它们组合起来处理连接上的动作。

pub mod auth;
pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod events;
pub mod gateway;
pub mod history_cache;
pub mod local_broadcast;
pub mod presence;
pub mod rate_limiter;
pub mod repository;
pub mod services;
pub mod typing;

pub use auth::TokenVerifier;
pub use broadcaster::{Audience, BroadcastError, EventBus, EventEnvelope};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ApplicationError, ErrorCode};
pub use events::{ClientAction, ServerEvent};
pub use gateway::{spawn_remote_listener, ChatGateway, ChatGatewayDependencies, Session};
pub use history_cache::{HistoryCache, RedisHistoryCache};
pub use local_broadcast::LocalEventBus;
pub use presence::{PresenceStore, RedisPresenceStore};
pub use rate_limiter::{ActionRateLimiter, RateLimitStore, RateLimitedAction, RedisRateLimitStore};
pub use repository::{LastSeenRepository, MessageRepository, RoomRepository};
pub use services::{
    CreateGroupRequest, CreateMessageRequest, DirectoryService, DirectoryServiceDependencies,
    HistoryQuery, MessagePage, MessageService, MessageServiceDependencies, ReadOutcome,
};
pub use typing::{RedisTypingTracker, TypingTracker};
