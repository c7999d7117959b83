use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::AppConfig;
use futures_util::{SinkExt, StreamExt};
use infrastructure::Infrastructure;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState, JwtService};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 纯内存后端的完整服务
pub async fn build_router() -> (Router, Arc<JwtService>) {
    let config = AppConfig::default();
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let heartbeat = config.presence.heartbeat();
    let infrastructure = Infrastructure::connect(config)
        .await
        .expect("memory infrastructure");
    let (services, _listener) = infrastructure.into_services(jwt_service.clone());
    let state = AppState::new(services, jwt_service.clone(), heartbeat);
    (router(state), jwt_service)
}

pub struct TestServer {
    pub base_http: String,
    pub base_ws: String,
    pub jwt: Arc<JwtService>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let (router, jwt) = build_router().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            base_http: format!("http://{addr}"),
            base_ws: format!("ws://{addr}"),
            jwt,
            _shutdown: shutdown_tx,
        }
    }

    pub fn token(&self, user_id: Uuid) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub async fn connect(&self, user_id: Uuid) -> Client {
        let url = format!("{}/api/v1/ws?token={}", self.base_ws, self.token(user_id));
        let (socket, _) = connect_async(url).await.expect("websocket connect");
        socket
    }
}

pub async fn send_json(socket: &mut Client, frame: Value) {
    socket
        .send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// 读到指定事件为止，跳过其他事件
pub async fn next_event(socket: &mut Client, name: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let message = socket
                .next()
                .await
                .expect("socket closed")
                .expect("socket error");
            if let TungsteniteMessage::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                if value["event"] == name {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}
