//! 主应用程序入口
//!
//! 加载配置、按配置选择后端、启动 Axum Web API 服务。

use std::sync::Arc;

use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let heartbeat = config.presence.heartbeat();
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    let infrastructure = Infrastructure::connect(config).await?;
    let instance_id = infrastructure.instance_id;
    let (services, remote_listener) = infrastructure.into_services(jwt_service.clone());

    let state = AppState::new(services, jwt_service, heartbeat);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!(instance_id = %instance_id, "聊天网关启动在 http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    remote_listener.abort();
    tracing::info!("聊天网关已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听退出信号失败");
    }
}
