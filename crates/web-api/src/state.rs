use std::sync::Arc;
use std::time::Duration;

use application::{ChatGateway, DirectoryService, LastSeenRepository, MessageService, PresenceStore};
use infrastructure::ChatServices;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChatGateway>,
    pub directory: Arc<DirectoryService>,
    pub messages: Arc<MessageService>,
    pub presence: Arc<dyn PresenceStore>,
    pub last_seen: Arc<dyn LastSeenRepository>,
    pub jwt_service: Arc<JwtService>,
    /// 连接心跳间隔，每次心跳续期在线状态
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(services: ChatServices, jwt_service: Arc<JwtService>, heartbeat: Duration) -> Self {
        Self {
            gateway: services.gateway,
            directory: services.directory,
            messages: services.messages,
            presence: services.presence,
            last_seen: services.last_seen,
            jwt_service,
            heartbeat,
        }
    }
}
