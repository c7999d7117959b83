//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 连接交给网关，少量 REST 查询委托给应用层服务。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{bearer_token, Claims, JwtService};
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
