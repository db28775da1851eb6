use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{MemoryStore, RouterSettings, SystemClock};
use config::{SeedConfig, SeedUser};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use web_api::{router, AppState, ChatStorage};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: MemoryStore,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    /// 启动一个使用内存存储的服务，预置用户 3/9/5 和商品 77
    pub async fn spawn() -> Self {
        let store = MemoryStore::new();
        let users = [(3, "Ana"), (9, "Bruno"), (5, "Eve")]
            .into_iter()
            .map(|(id, name)| SeedUser {
                id,
                display_name: name.to_string(),
                session_token: format!("tok-{id}"),
            })
            .collect();
        store
            .seed(&SeedConfig {
                users,
                listings: vec![77],
            })
            .await;

        let state = AppState::new(
            ChatStorage::from(store.clone()),
            RouterSettings::default(),
            Arc::new(SystemClock),
        );
        let app = router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            store,
            _shutdown: shutdown_tx,
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/api/v1/ws?token={}", self.addr, token)
    }

    /// 建立连接并读掉问候帧
    pub async fn connect(&self, token: &str) -> Socket {
        let (mut socket, _) = connect_async(self.ws_url(token)).await.expect("connect");
        let greeting = next_event(&mut socket).await;
        assert_eq!(greeting["event"], "connected");
        socket
    }
}

pub async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// 读取下一条事件帧，跳过控制帧
pub async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("json frame");
        }
    }
}

/// 读取事件直到找到指定类型
pub async fn next_event_of(socket: &mut Socket, event: &str) -> Value {
    loop {
        let value = next_event(socket).await;
        if value["event"] == event {
            return value;
        }
    }
}

/// 在短时间内确认没有指定类型的事件到达
pub async fn assert_no_event(socket: &mut Socket, event: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                assert_ne!(value["event"], event, "unexpected {event}: {value}");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return,
        }
    }
}
