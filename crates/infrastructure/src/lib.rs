//! 基础设施层实现。
//!
//! PostgreSQL 仓储、数据库迁移、Redis 跨实例事件总线、断路器降级总线，
//! 以及按配置组装全部后端的构建器。

pub mod builder;
pub mod fallback_broadcaster;
pub mod migrations;
pub mod redis;
pub mod repository;

pub use builder::{ChatServices, Infrastructure, InfrastructureError};
pub use fallback_broadcaster::{CircuitConfig, CircuitState, FallbackEventBus};
pub use migrations::MIGRATOR;
pub use redis::{spawn_subscriber, RedisError, RedisEventBus};
pub use repository::{
    create_pg_pool, PgLastSeenRepository, PgMessageRepository, PgRoomRepository, PgStorage,
};
