use crate::error::ApiError;
use crate::state::AppState;
use application::{ServerEvent, Session};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// WebSocket 连接管理器
///
/// 封装单个已鉴权连接：
/// - 网关事件写出
/// - 客户端动作交给网关路由
/// - 心跳续期在线状态
/// - 断开时清理
pub struct WebSocketConnection {
    state: AppState,
    session: Session,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl WebSocketConnection {
    /// 在网关注册连接。鉴权确认和离线消息此时已进入事件队列。
    pub async fn new(state: AppState, user_id: UserId) -> Result<Self, ApiError> {
        let (session, events) = state.gateway.connect(user_id).await.map_err(|err| {
            tracing::error!(error = %err, user_id = %user_id, "注册连接失败");
            ApiError::from(err)
        })?;

        tracing::info!(
            user_id = %user_id,
            connection_id = %session.connection_id(),
            "WebSocket 连接已建立"
        );

        Ok(Self {
            state,
            session,
            events,
        })
    }

    /// 运行 WebSocket 连接的主循环，直到任一方向结束
    pub async fn run(self, socket: WebSocket) {
        let Self {
            state,
            session,
            mut events,
        } = self;
        let (mut sender, mut incoming) = socket.split();

        // 所有对 sender 的写操作都经过这个通道
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendPing => WsMessage::Ping(Vec::new().into()),
                        WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                    },
                    event = events.recv() => match event {
                        Some(event) => match serde_json::to_string(&event) {
                            Ok(json) => WsMessage::Text(json.into()),
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to serialize websocket payload");
                                continue;
                            }
                        },
                        // 网关已注销该连接
                        None => break,
                    },
                };
                if sender.send(frame).await.is_err() {
                    tracing::warn!("Failed to send websocket frame");
                    break;
                }
            }
            let _ = sender.close().await;
            tracing::debug!("WebSocket发送任务结束");
        });

        let mut recv_task = {
            let gateway = state.gateway.clone();
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    match message {
                        WsMessage::Text(text) => {
                            gateway.route_text(&session, text.as_str()).await;
                        }
                        WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => gateway.route_text(&session, text).await,
                            Err(_) => tracing::debug!("忽略非 UTF-8 二进制帧"),
                        },
                        WsMessage::Ping(data) => {
                            if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Pong(_) => {
                            tracing::debug!("收到pong消息");
                        }
                        WsMessage::Close(_) => {
                            tracing::info!("WebSocket收到关闭消息");
                            break;
                        }
                    }
                }
                tracing::debug!("WebSocket接收任务结束");
            })
        };

        let mut heartbeat_task = {
            let gateway = state.gateway.clone();
            let period = state.heartbeat;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // 第一次 tick 立即触发，连接时已经标记在线
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    gateway.refresh_presence(&session).await;
                    if cmd_tx.send(WsCommand::SendPing).await.is_err() {
                        break;
                    }
                }
            })
        };

        tokio::select! {
            _ = &mut send_task => {}
            _ = &mut recv_task => {}
            _ = &mut heartbeat_task => {}
        }
        send_task.abort();
        recv_task.abort();
        heartbeat_task.abort();

        state.gateway.disconnect(&session).await;
        tracing::info!(
            user_id = %session.user_id,
            connection_id = %session.connection_id(),
            "WebSocket连接已断开"
        );
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPing,
    SendPong(Vec<u8>),
}
