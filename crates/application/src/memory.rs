//! 进程内会话存储
//!
//! 所有状态放在同一把锁后面，每个仓储操作都在持锁期间完成，
//! 因此屏蔽检查与消息写入天然是原子的。用于测试和 `memory` 存储后端。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{
    AppendOutcome, BlockOutcome, Conversation, ConversationId, ConversationRepository,
    ConversationSummary, ListingDirectory, ListingId, Message, MessageId, MessageRepository,
    NewMessage, ParticipantPair, RepositoryError, RepositoryFuture, Timestamp, User, UserId,
    UserRepository,
};
use config::SeedConfig;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    listings: HashSet<ListingId>,
    conversations: HashMap<ConversationId, Conversation>,
    /// 每个会话的消息按 `(created_at, id)` 顺序追加
    messages: HashMap<ConversationId, Vec<Message>>,
    next_message_id: i64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入或覆盖用户记录，供账户子系统同步和测试使用
    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    pub async fn insert_listing(&self, listing: ListingId) {
        self.state.write().await.listings.insert(listing);
    }

    /// 导入配置里声明的用户和商品，每个用户带一个可用的会话凭证
    pub async fn seed(&self, seed: &SeedConfig) {
        let mut state = self.state.write().await;
        for entry in &seed.users {
            let mut user = User::new(UserId(entry.id), entry.display_name.clone());
            user.rotate_session(entry.session_token.clone());
            state.users.insert(user.id, user);
        }
        state
            .listings
            .extend(seed.listings.iter().copied().map(ListingId));
    }

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.state.read().await.users.get(&id).cloned()
    }

    pub async fn find_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.state.read().await.conversations.get(id).cloned()
    }

    pub async fn conversation_count(&self) -> usize {
        self.state.read().await.conversations.len()
    }

    pub async fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.state
            .read()
            .await
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }
}

impl UserRepository for MemoryStore {
    fn find_by_id(&self, id: UserId) -> RepositoryFuture<Option<User>> {
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.users.get(&id).cloned()) })
    }

    fn find_by_session_token(&self, token: String) -> RepositoryFuture<Option<User>> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            Ok(state
                .users
                .values()
                .find(|user| user.session_token.as_deref() == Some(token.as_str()))
                .cloned())
        })
    }

    fn set_online(&self, id: UserId, online: bool, at: Timestamp) -> RepositoryFuture<()> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let user = state.users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            user.set_presence(online, at);
            Ok(())
        })
    }
}

impl ConversationRepository for MemoryStore {
    fn get_or_create(
        &self,
        participants: ParticipantPair,
        listing_id: Option<ListingId>,
        now: Timestamp,
    ) -> RepositoryFuture<Conversation> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let conversation = state
                .conversations
                .entry(participants.conversation_id())
                .or_insert_with(|| Conversation::open(participants, listing_id, now));
            Ok(conversation.clone())
        })
    }

    fn find_by_id(&self, id: ConversationId) -> RepositoryFuture<Option<Conversation>> {
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.conversations.get(&id).cloned()) })
    }

    fn set_blocked(
        &self,
        id: ConversationId,
        blocker: UserId,
    ) -> RepositoryFuture<Option<(Conversation, BlockOutcome)>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let Some(conversation) = state.conversations.get_mut(&id) else {
                return Ok(None);
            };
            let outcome = conversation.block(blocker)?;
            Ok(Some((conversation.clone(), outcome)))
        })
    }

    fn list_for_user(&self, user: UserId) -> RepositoryFuture<Vec<ConversationSummary>> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            let mut summaries: Vec<ConversationSummary> = state
                .conversations
                .values()
                .filter(|conversation| conversation.participants.contains(user))
                .map(|conversation| {
                    let messages = state
                        .messages
                        .get(&conversation.id)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    ConversationSummary {
                        conversation: conversation.clone(),
                        unread_count: messages
                            .iter()
                            .filter(|m| m.sender_id != user && !m.is_read)
                            .count() as u64,
                        last_message: messages.last().cloned(),
                    }
                })
                .collect();
            summaries.sort_by(|a, b| {
                b.conversation
                    .updated_at
                    .cmp(&a.conversation.updated_at)
                    .then_with(|| b.conversation.id.as_str().cmp(a.conversation.id.as_str()))
            });
            Ok(summaries)
        })
    }
}

impl MessageRepository for MemoryStore {
    fn append(&self, message: NewMessage) -> RepositoryFuture<AppendOutcome> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut guard = state.write().await;
            let state = &mut *guard;
            let Some(conversation) = state.conversations.get_mut(&message.conversation_id) else {
                return Ok(AppendOutcome::ConversationMissing);
            };
            if conversation.is_blocked {
                return Ok(AppendOutcome::Blocked);
            }

            let created_at = conversation.next_message_time(message.sent_at);
            conversation.touch(created_at);
            state.next_message_id += 1;
            let stored = Message {
                id: MessageId(state.next_message_id),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                sender_role: message.sender_role,
                text: message.text,
                is_read: false,
                created_at,
            };
            state
                .messages
                .entry(stored.conversation_id.clone())
                .or_default()
                .push(stored.clone());
            Ok(AppendOutcome::Appended(stored))
        })
    }

    fn mark_read(&self, conversation: ConversationId, reader: UserId) -> RepositoryFuture<u64> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let mut flipped = 0;
            if let Some(messages) = state.messages.get_mut(&conversation) {
                for message in messages
                    .iter_mut()
                    .filter(|m| m.sender_id != reader && !m.is_read)
                {
                    message.is_read = true;
                    flipped += 1;
                }
            }
            Ok(flipped)
        })
    }

    fn history(
        &self,
        conversation: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> RepositoryFuture<Vec<Message>> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            let messages = state
                .messages
                .get(&conversation)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let end = match before {
                Some(id) => messages
                    .iter()
                    .position(|m| m.id == id)
                    .ok_or(RepositoryError::NotFound)?,
                None => messages.len(),
            };
            let start = end.saturating_sub(limit as usize);
            Ok(messages[start..end].to_vec())
        })
    }

    fn count(&self, conversation: ConversationId) -> RepositoryFuture<u64> {
        let state = self.state.clone();
        Box::pin(async move {
            Ok(state
                .read()
                .await
                .messages
                .get(&conversation)
                .map_or(0, |messages| messages.len() as u64))
        })
    }
}

impl ListingDirectory for MemoryStore {
    fn exists(&self, listing: ListingId) -> RepositoryFuture<bool> {
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.listings.contains(&listing)) })
    }
}
