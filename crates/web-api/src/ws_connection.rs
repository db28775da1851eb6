use application::{ClientFrame, ServerEvent, Session};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::User;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// WebSocket 连接
///
/// 封装单个 WebSocket 连接的生命周期：
/// - 注册到频道注册表并更新在线状态
/// - 发送任务把出站队列里的事件写回客户端
/// - 接收任务按顺序把客户端帧交给消息路由器
/// - 断开时注销连接并更新在线状态
pub struct WebSocketConnection {
    socket: Option<WebSocket>,
    state: AppState,
    session: Session,
    outbox: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl WebSocketConnection {
    /// 登记连接、标记在线并发送问候帧
    pub async fn new(socket: WebSocket, state: AppState, user: User) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let connection_id = state.registry.register(user.id, outbox_tx).await;
        state.presence.connected(user.id).await;

        tracing::info!(user_id = %user.id, connection_id = %connection_id, "WebSocket 连接已建立");

        let greeting = ServerEvent::Connected {
            user_id: user.id,
            display_name: user.display_name.clone(),
        };
        if let Err(err) = state.registry.send_to(connection_id, greeting).await {
            tracing::warn!(error = %err, "Failed to queue greeting");
        }

        Self {
            socket: Some(socket),
            state,
            session: Session::new(connection_id, user),
            outbox: Some(outbox_rx),
        }
    }

    /// 运行连接主循环，直到任一方向结束
    pub async fn run(mut self) {
        let (Some(socket), Some(mut outbox)) = (self.socket.take(), self.outbox.take()) else {
            tracing::error!("WebSocket 连接被重复运行");
            return;
        };
        let (mut sender, mut incoming) = socket.split();

        // 控制帧与事件帧共用同一个写端
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                    },
                    Some(event) = outbox.recv() => match event.to_json() {
                        Ok(json) => WsMessage::Text(json.into()),
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to serialize websocket payload");
                            continue;
                        }
                    },
                    else => break,
                };
                if sender.send(frame).await.is_err() {
                    tracing::warn!("Failed to write websocket frame");
                    break;
                }
            }
            tracing::debug!("WebSocket发送任务结束");
        });

        let mut recv_task = {
            let state = self.state.clone();
            let session = self.session.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    if Self::handle_incoming(&state, &session, message, &cmd_tx)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                tracing::debug!("WebSocket接收任务结束");
            })
        };

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        // 连接断开时清理订阅和在线状态
        let user_id = self.session.user_id();
        self.state.registry.remove(self.session.connection_id).await;
        self.state.presence.disconnected(user_id).await;

        tracing::info!(
            user_id = %user_id,
            connection_id = %self.session.connection_id,
            "WebSocket连接已断开，在线状态已清理"
        );
    }

    /// 处理一条客户端帧；返回 `Err` 表示应结束连接
    async fn handle_incoming(
        state: &AppState,
        session: &Session,
        message: WsMessage,
        cmd_tx: &mpsc::Sender<WsCommand>,
    ) -> Result<(), ()> {
        match message {
            WsMessage::Close(_) => {
                tracing::info!("WebSocket收到关闭消息");
                return Err(());
            }
            WsMessage::Ping(data) => {
                tracing::debug!("收到ping消息，发送pong回应");
                if cmd_tx
                    .send(WsCommand::SendPong(data.to_vec()))
                    .await
                    .is_err()
                {
                    tracing::warn!("Failed to send pong command");
                    return Err(());
                }
            }
            WsMessage::Pong(_) => {
                tracing::debug!("收到pong消息");
            }
            WsMessage::Text(text) => {
                Self::handle_text(state, session, text.as_str()).await;
            }
            WsMessage::Binary(_) => {
                tracing::debug!("忽略二进制帧");
            }
        }
        Ok(())
    }

    async fn handle_text(state: &AppState, session: &Session, text: &str) {
        let reply = match ClientFrame::parse(text) {
            Ok(frame) => state
                .chat
                .dispatch(session, frame.event)
                .await
                .map(|ack| ServerEvent::Ack {
                    ack_id: frame.ack_id,
                    ack,
                }),
            Err(err) => {
                tracing::debug!(error = %err, "无法解析的客户端帧");
                Some(ServerEvent::Error {
                    ack_id: err.ack_id,
                    code: "BAD_FRAME".to_string(),
                    message: err.to_string(),
                })
            }
        };

        if let Some(reply) = reply {
            if let Err(err) = state.registry.send_to(session.connection_id, reply).await {
                tracing::warn!(error = %err, "Failed to queue reply");
            }
        }
    }
}

/// WebSocket 控制帧写命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Vec<u8>),
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        tracing::debug!(
            user_id = %self.session.user_id(),
            connection_id = %self.session.connection_id,
            "WebSocketConnection 被销毁"
        );
    }
}
