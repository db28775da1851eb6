use std::sync::Arc;

use application::{
    ChannelRegistry, ChatRouter, ChatRouterDependencies, Clock, IdentityResolver, MemoryStore,
    PresenceTracker, RouterSettings, SessionTokenResolver,
};
use domain::{ConversationRepository, ListingDirectory, MessageRepository, UserRepository};

/// 会话存储的四个接口，内存实现与 PostgreSQL 实现都可以装配进来
#[derive(Clone)]
pub struct ChatStorage {
    pub users: Arc<dyn UserRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub listings: Arc<dyn ListingDirectory>,
}

impl From<MemoryStore> for ChatStorage {
    fn from(store: MemoryStore) -> Self {
        Self {
            users: Arc::new(store.clone()),
            conversations: Arc::new(store.clone()),
            messages: Arc::new(store.clone()),
            listings: Arc::new(store),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<dyn IdentityResolver>,
    pub registry: Arc<ChannelRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub chat: Arc<ChatRouter>,
}

impl AppState {
    pub fn new(storage: ChatStorage, settings: RouterSettings, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let presence = Arc::new(PresenceTracker::new(storage.users.clone(), clock.clone()));
        let identity: Arc<dyn IdentityResolver> =
            Arc::new(SessionTokenResolver::new(storage.users.clone()));
        let chat = Arc::new(ChatRouter::new(ChatRouterDependencies {
            users: storage.users,
            conversations: storage.conversations,
            messages: storage.messages,
            listings: storage.listings,
            registry: registry.clone(),
            clock,
            settings,
        }));

        Self {
            identity,
            registry,
            presence,
            chat,
        }
    }
}
