//! 统一配置中心
//!
//! 配置按以下顺序叠加，后者覆盖前者：
//! - 内置默认值
//! - `APP_CONFIG_FILE` 指向的文件（yaml / json / toml）
//! - `APP_` 前缀的环境变量，`__` 分隔层级，例如 `APP_DATABASE__URL`

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub presence: PresenceConfig,
    pub typing: TypingConfig,
    pub history: HistoryConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 多实例部署时用于识别自身发布的事件；缺省时启动随机生成。
    pub instance_id: Option<Uuid>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Memory,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            url: String::new(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FastStoreBackend {
    Redis,
    Memory,
}

/// Redis配置：在线状态、输入状态、限流、历史缓存和跨实例广播共用。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub backend: FastStoreBackend,
    pub url: String,
    pub channel_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            backend: FastStoreBackend::Memory,
            url: "redis://127.0.0.1:6379".into(),
            channel_prefix: "chat:".into(),
        }
    }
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "local-development-secret-change-me-0123456789".into(),
            expiration_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    Fixed,
    Sliding,
}

/// 单个动作的限流规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: u64,
    pub strategy: RateLimitStrategy,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub send_message: RateLimitRule,
    pub typing: RateLimitRule,
    pub create_room: RateLimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            send_message: RateLimitRule {
                limit: 10,
                window_secs: 60,
                strategy: RateLimitStrategy::Fixed,
            },
            typing: RateLimitRule {
                limit: 30,
                window_secs: 60,
                strategy: RateLimitStrategy::Sliding,
            },
            create_room: RateLimitRule {
                limit: 3,
                window_secs: 3600,
                strategy: RateLimitStrategy::Fixed,
            },
        }
    }
}

/// 在线状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub ttl_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 120,
            heartbeat_secs: 30,
        }
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// 输入状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    pub ttl_secs: u64,
    pub grace_secs: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            grace_secs: 1,
        }
    }
}

impl TypingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// 历史消息与缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// 每个房间缓存的最新消息条数
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    /// 内存缓存最多保留的房间数
    pub max_cached_rooms: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 200,
            cache_ttl_secs: 86_400,
            max_cached_rooms: 1024,
            default_page_size: 50,
            max_page_size: 100,
            timeout_ms: 5_000,
        }
    }
}

impl HistoryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// 按 默认值 -> APP_CONFIG_FILE -> APP_* 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Self::defaults();
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed("APP_").split("__"));
        Self::from_figment(fig)
    }

    pub fn defaults() -> Figment {
        Figment::new().merge(Serialized::defaults(AppConfig::default()))
    }

    pub fn from_figment(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = fig.extract().map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.backend == DatabaseBackend::Postgres {
            if self.database.url.is_empty() {
                return Err(ConfigError::InvalidDatabaseUrl(
                    "Database URL cannot be empty".to_string(),
                ));
            }
            if self.database.max_connections == 0 {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "Max connections must be greater than 0".to_string(),
                ));
            }
        }

        if self.redis.backend == FastStoreBackend::Redis && self.redis.url.is_empty() {
            return Err(ConfigError::InvalidRedisConfig(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        // 至少 256 位
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        for (name, rule) in [
            ("send_message", &self.rate_limit.send_message),
            ("typing", &self.rate_limit.typing),
            ("create_room", &self.rate_limit.create_room),
        ] {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(ConfigError::InvalidRateLimit(format!(
                    "{name}: limit and window must be greater than 0"
                )));
            }
        }

        if self.presence.ttl_secs == 0 || self.presence.heartbeat_secs >= self.presence.ttl_secs {
            return Err(ConfigError::InvalidPresenceConfig(
                "heartbeat must be shorter than presence ttl".to_string(),
            ));
        }

        if self.typing.ttl_secs == 0 {
            return Err(ConfigError::InvalidTypingConfig(
                "typing ttl must be greater than 0".to_string(),
            ));
        }

        let history = &self.history;
        if history.default_page_size == 0
            || history.max_page_size == 0
            || history.default_page_size > history.max_page_size
        {
            return Err(ConfigError::InvalidHistoryConfig(
                "page sizes must be positive and default <= max".to_string(),
            ));
        }
        if history.cache_capacity == 0 || history.max_cached_rooms == 0 || history.timeout_ms == 0
        {
            return Err(ConfigError::InvalidHistoryConfig(
                "cache capacity, cached rooms and timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
    #[error("Invalid redis configuration: {0}")]
    InvalidRedisConfig(String),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("Invalid presence configuration: {0}")]
    InvalidPresenceConfig(String),
    #[error("Invalid typing configuration: {0}")]
    InvalidTypingConfig(String),
    #[error("Invalid history configuration: {0}")]
    InvalidHistoryConfig(String),
    #[error("Failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),
}
