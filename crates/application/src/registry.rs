//! 连接注册表
//!
//! 记录每个连接订阅了哪些频道。会话频道按会话标识划分，
//! 个人频道按用户划分，用于会话视图之外的新消息提醒。
//! 注册表由网关持有并显式注入路由器，订阅关系只能通过这里的方法修改。

use std::collections::{HashMap, HashSet};

use domain::{ConversationId, UserId};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApplicationError;
use crate::protocol::ServerEvent;

pub type ConnectionId = Uuid;

/// 每个连接的出站队列，由连接自己的发送任务消费
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// 广播频道
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Conversation(ConversationId),
    User(UserId),
}

struct ConnectionEntry {
    user_id: UserId,
    outbox: Outbox,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn detach(&mut self, connection: ConnectionId, channel: &Channel) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&connection);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    state: RwLock<RegistryState>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新连接并订阅该用户的个人频道
    pub async fn register(&self, user_id: UserId, outbox: Outbox) -> ConnectionId {
        let connection = Uuid::new_v4();
        let personal = Channel::User(user_id);
        let mut state = self.state.write().await;
        state
            .channels
            .entry(personal.clone())
            .or_default()
            .insert(connection);
        state.connections.insert(
            connection,
            ConnectionEntry {
                user_id,
                outbox,
                channels: HashSet::from([personal]),
            },
        );
        debug!(connection_id = %connection, user_id = %user_id, "连接已登记");
        connection
    }

    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        channel: Channel,
    ) -> Result<(), ApplicationError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let entry = state
            .connections
            .get_mut(&connection)
            .ok_or(ApplicationError::ConnectionNotFound)?;
        if entry.channels.insert(channel.clone()) {
            state.channels.entry(channel).or_default().insert(connection);
        }
        Ok(())
    }

    /// 取消订阅；未订阅时什么也不做
    pub async fn unsubscribe(&self, connection: ConnectionId, channel: &Channel) {
        let mut state = self.state.write().await;
        let removed = state
            .connections
            .get_mut(&connection)
            .map(|entry| entry.channels.remove(channel))
            .unwrap_or(false);
        if removed {
            state.detach(connection, channel);
        }
    }

    /// 注销连接并清理它的全部订阅，返回连接所属用户
    pub async fn remove(&self, connection: ConnectionId) -> Option<UserId> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(&connection)?;
        for channel in &entry.channels {
            state.detach(connection, channel);
        }
        debug!(connection_id = %connection, user_id = %entry.user_id, "连接已注销");
        Some(entry.user_id)
    }

    /// 向频道内所有连接投递事件，返回成功投递的连接数。
    ///
    /// 单个连接的出站队列已关闭不会影响其他订阅者。
    pub async fn publish(&self, channel: &Channel, event: ServerEvent) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.channels.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        let mut failed = 0;
        for connection in members {
            let Some(entry) = state.connections.get(connection) else {
                continue;
            };
            match entry.outbox.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    failed += 1;
                    warn!(connection_id = %connection, ?channel, "出站队列已关闭，跳过该连接");
                }
            }
        }

        if failed > 0 {
            warn!(?channel, delivered, failed, "部分连接投递失败");
        }
        delivered
    }

    /// 只发给单个连接
    pub async fn send_to(
        &self,
        connection: ConnectionId,
        event: ServerEvent,
    ) -> Result<(), ApplicationError> {
        let state = self.state.read().await;
        let entry = state
            .connections
            .get(&connection)
            .ok_or(ApplicationError::ConnectionNotFound)?;
        entry
            .outbox
            .send(event)
            .map_err(|_| ApplicationError::ConnectionNotFound)
    }

    pub async fn subscriber_count(&self, channel: &Channel) -> usize {
        self.state
            .read()
            .await
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_subscribed(&self, connection: ConnectionId, channel: &Channel) -> bool {
        self.state
            .read()
            .await
            .connections
            .get(&connection)
            .is_some_and(|entry| entry.channels.contains(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event(id: u32) -> ServerEvent {
        ServerEvent::MessagesRead {
            conversation_id: ConversationId::from("3-9"),
            reader_id: UserId(id as i64),
        }
    }

    #[tokio::test]
    async fn register_subscribes_personal_channel() {
        let registry = ChannelRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(UserId(9), tx).await;

        let delivered = registry.publish(&Channel::User(UserId(9)), read_event(1)).await;
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await, Some(read_event(1)));
    }

    #[tokio::test]
    async fn closed_outbox_does_not_block_other_subscribers() {
        let registry = ChannelRegistry::new();
        let channel = Channel::Conversation(ConversationId::from("3-9"));

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let dead = registry.register(UserId(3), dead_tx).await;
        registry.subscribe(dead, channel.clone()).await.unwrap();
        drop(dead_rx);

        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let live = registry.register(UserId(9), live_tx).await;
        registry.subscribe(live, channel.clone()).await.unwrap();

        assert_eq!(registry.publish(&channel, read_event(1)).await, 1);
        assert_eq!(live_rx.recv().await, Some(read_event(1)));
    }

    #[tokio::test]
    async fn per_subscriber_order_is_preserved() {
        let registry = ChannelRegistry::new();
        let channel = Channel::Conversation(ConversationId::from("3-9"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.register(UserId(3), tx).await;
        registry.subscribe(conn, channel.clone()).await.unwrap();

        for i in 0..50 {
            registry.publish(&channel, read_event(i)).await;
        }
        for i in 0..50 {
            assert_eq!(rx.recv().await, Some(read_event(i)));
        }
    }

    #[tokio::test]
    async fn remove_drops_every_subscription() {
        let registry = ChannelRegistry::new();
        let channel = Channel::Conversation(ConversationId::from("3-9"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(UserId(3), tx).await;
        registry.subscribe(conn, channel.clone()).await.unwrap();
        assert_eq!(registry.subscriber_count(&channel).await, 1);

        assert_eq!(registry.remove(conn).await, Some(UserId(3)));
        assert_eq!(registry.subscriber_count(&channel).await, 0);
        assert_eq!(registry.subscriber_count(&Channel::User(UserId(3))).await, 0);
        assert_eq!(registry.connection_count().await, 0);
        assert!(registry.subscribe(conn, channel).await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_a_noop_when_not_subscribed() {
        let registry = ChannelRegistry::new();
        let channel = Channel::Conversation(ConversationId::from("3-9"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(UserId(3), tx).await;

        registry.unsubscribe(conn, &channel).await;
        registry.subscribe(conn, channel.clone()).await.unwrap();
        registry.unsubscribe(conn, &channel).await;
        assert!(!registry.is_subscribed(conn, &channel).await);
    }
}
