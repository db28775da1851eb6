//! 实时消息路由
//!
//! 所有入站事件都经过 [`ChatRouter::dispatch`]，按事件类型分派到具体用例。
//! 用例按顺序做校验、持久化，持久化成功后才广播。

use std::sync::Arc;

use config::ChatConfig;
use domain::{
    AppendOutcome, BlockOutcome, Conversation, ConversationId, ConversationRepository,
    ConversationSummary, ListingDirectory, ListingId, Message, MessageId, MessageRepository,
    MessageText, NewMessage, ParticipantPair, SenderRole, User, UserId, UserRepository,
};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::protocol::{Ack, ClientEvent, ServerEvent};
use crate::registry::{Channel, ChannelRegistry, ConnectionId};

/// 已认证连接的上下文
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user: User,
}

impl Session {
    pub fn new(connection_id: ConnectionId, user: User) -> Self {
        Self {
            connection_id,
            user,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }
}

/// 发送消息请求
#[derive(Debug, Clone)]
pub struct SendMessageCommand {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub sender_role: SenderRole,
}

/// 路由器可调的行为参数
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub preview_chars: usize,
    pub enforce_join_membership: bool,
    pub history_page_limit: u32,
}

impl From<&ChatConfig> for RouterSettings {
    fn from(config: &ChatConfig) -> Self {
        Self {
            preview_chars: config.preview_chars,
            enforce_join_membership: config.enforce_join_membership,
            history_page_limit: config.history_page_limit,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

pub struct ChatRouterDependencies {
    pub users: Arc<dyn UserRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub listings: Arc<dyn ListingDirectory>,
    pub registry: Arc<ChannelRegistry>,
    pub clock: Arc<dyn Clock>,
    pub settings: RouterSettings,
}

pub struct ChatRouter {
    deps: ChatRouterDependencies,
}

impl ChatRouter {
    pub fn new(deps: ChatRouterDependencies) -> Self {
        Self { deps }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.deps.registry
    }

    /// 分派一个入站事件。`send_message` 与 `block_chat` 总会返回回执，
    /// 其余事件没有回执，失败只记录日志。
    pub async fn dispatch(&self, session: &Session, event: ClientEvent) -> Option<Ack> {
        match event {
            ClientEvent::JoinChat { conversation_id } => {
                if let Err(err) = self.join_chat(session, &conversation_id).await {
                    warn!(
                        user_id = %session.user_id(),
                        conversation_id = %conversation_id,
                        error = %err,
                        "加入会话频道失败"
                    );
                }
                None
            }
            ClientEvent::LeaveChat { conversation_id } => {
                self.leave_chat(session, &conversation_id).await;
                None
            }
            ClientEvent::SendMessage {
                conversation_id,
                sender_id,
                text,
                sender_role,
                client_temp_id,
            } => {
                let command = SendMessageCommand {
                    conversation_id,
                    sender_id,
                    text,
                    sender_role,
                };
                let ack = match self.send_message(session, command).await {
                    Ok(message) => Ack::Ok {
                        message: Some(message),
                        client_temp_id,
                    },
                    Err(err) => Ack::error(err.ack_reason()),
                };
                Some(ack)
            }
            ClientEvent::MarkRead {
                conversation_id,
                reader_id,
            } => {
                if let Err(err) = self.mark_read(session, &conversation_id, reader_id).await {
                    warn!(
                        user_id = %session.user_id(),
                        conversation_id = %conversation_id,
                        error = %err,
                        "标记已读失败"
                    );
                }
                None
            }
            ClientEvent::BlockChat {
                conversation_id,
                blocker_id,
            } => {
                let ack = match self.block_chat(session, &conversation_id, blocker_id).await {
                    Ok(_) => Ack::ok(),
                    Err(err) => Ack::error(err.ack_reason()),
                };
                Some(ack)
            }
        }
    }

    /// 订阅会话频道
    pub async fn join_chat(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<(), ApplicationError> {
        if self.deps.settings.enforce_join_membership {
            let participants = match self.deps.conversations.find_by_id(conversation_id.clone()).await? {
                Some(conversation) => conversation.participants,
                // 会话尚未创建时按标识本身判断，首条消息会创建它
                None => ParticipantPair::parse(conversation_id)?,
            };
            if !participants.contains(session.user_id()) {
                return Err(ApplicationError::NotParticipant);
            }
        }

        self.deps
            .registry
            .subscribe(
                session.connection_id,
                Channel::Conversation(conversation_id.clone()),
            )
            .await?;
        debug!(user_id = %session.user_id(), conversation_id = %conversation_id, "已加入会话频道");
        Ok(())
    }

    pub async fn leave_chat(&self, session: &Session, conversation_id: &ConversationId) {
        self.deps
            .registry
            .unsubscribe(
                session.connection_id,
                &Channel::Conversation(conversation_id.clone()),
            )
            .await;
    }

    /// 发送消息：校验身份，必要时懒创建会话，检查屏蔽后原子写入，最后广播。
    #[instrument(skip(self, session, command), fields(user_id = %session.user_id(), conversation_id = %command.conversation_id))]
    pub async fn send_message(
        &self,
        session: &Session,
        command: SendMessageCommand,
    ) -> Result<Message, ApplicationError> {
        let sender = session.user_id();
        if command.sender_id != sender {
            warn!(claimed_sender = %command.sender_id, "发送者身份不匹配，疑似伪造");
            return Err(ApplicationError::IdentityMismatch);
        }

        let text = MessageText::new(command.text)?;
        let conversation = self
            .resolve_conversation(&command.conversation_id, sender)
            .await?;
        conversation.ensure_can_send(sender)?;

        let outcome = self
            .deps
            .messages
            .append(NewMessage {
                conversation_id: conversation.id.clone(),
                sender_id: sender,
                sender_role: command.sender_role,
                text,
                sent_at: self.deps.clock.now(),
            })
            .await?;
        let message = match outcome {
            AppendOutcome::Appended(message) => message,
            AppendOutcome::Blocked => return Err(ApplicationError::ChatBlocked),
            AppendOutcome::ConversationMissing => {
                error!("会话在写入消息时已不存在");
                return Err(ApplicationError::ConversationNotFound);
            }
        };

        self.deps
            .registry
            .publish(
                &Channel::Conversation(conversation.id.clone()),
                ServerEvent::ReceiveMessage {
                    message: message.clone(),
                },
            )
            .await;

        if let Some(recipient) = conversation.participants.other(sender) {
            let delivered = self
                .deps
                .registry
                .publish(
                    &Channel::User(recipient),
                    ServerEvent::NewMessageNotification {
                        conversation_id: conversation.id.clone(),
                        sender_name: session.user.display_name.clone(),
                        text_preview: message.text.preview(self.deps.settings.preview_chars),
                        listing_id: conversation.listing_id,
                    },
                )
                .await;
            debug!(recipient = %recipient, delivered, "新消息提醒已投递");
        }

        info!(message_id = %message.id, "消息已发送");
        Ok(message)
    }

    /// 查找会话，不存在时按参与者对幂等创建
    async fn resolve_conversation(
        &self,
        conversation_id: &ConversationId,
        sender: UserId,
    ) -> Result<Conversation, ApplicationError> {
        if let Some(conversation) = self
            .deps
            .conversations
            .find_by_id(conversation_id.clone())
            .await?
        {
            return Ok(conversation);
        }

        let pair = ParticipantPair::parse(conversation_id)
            .map_err(|err| ApplicationError::creation_failed(err.to_string()))?;
        if !pair.contains(sender) {
            return Err(ApplicationError::NotParticipant);
        }
        for participant in [pair.low(), pair.high()] {
            let exists = self
                .deps
                .users
                .find_by_id(participant)
                .await
                .map_err(|err| ApplicationError::creation_failed(err.to_string()))?
                .is_some();
            if !exists {
                return Err(ApplicationError::creation_failed(format!(
                    "unknown user {participant}"
                )));
            }
        }

        let conversation = self
            .deps
            .conversations
            .get_or_create(pair, None, self.deps.clock.now())
            .await
            .map_err(|err| ApplicationError::creation_failed(err.to_string()))?;
        info!(conversation_id = %conversation.id, "会话已创建");
        Ok(conversation)
    }

    /// 把对方发来的未读消息标为已读，有变化时广播 `messages_read`
    pub async fn mark_read(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        reader_id: UserId,
    ) -> Result<u64, ApplicationError> {
        if reader_id != session.user_id() {
            warn!(user_id = %session.user_id(), claimed_reader = %reader_id, "已读者身份不匹配");
            return Err(ApplicationError::IdentityMismatch);
        }
        self.participant_conversation(conversation_id, reader_id)
            .await?;

        let flipped = self
            .deps
            .messages
            .mark_read(conversation_id.clone(), reader_id)
            .await?;
        if flipped > 0 {
            self.deps
                .registry
                .publish(
                    &Channel::Conversation(conversation_id.clone()),
                    ServerEvent::MessagesRead {
                        conversation_id: conversation_id.clone(),
                        reader_id,
                    },
                )
                .await;
        }
        Ok(flipped)
    }

    /// 屏蔽会话，对双方同时生效；重复屏蔽不改变 `blocked_by` 也不再广播
    pub async fn block_chat(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        blocker_id: UserId,
    ) -> Result<BlockOutcome, ApplicationError> {
        if blocker_id != session.user_id() {
            warn!(user_id = %session.user_id(), claimed_blocker = %blocker_id, "屏蔽者身份不匹配");
            return Err(ApplicationError::IdentityMismatch);
        }
        self.participant_conversation(conversation_id, blocker_id)
            .await?;

        let (conversation, outcome) = self
            .deps
            .conversations
            .set_blocked(conversation_id.clone(), blocker_id)
            .await?
            .ok_or(ApplicationError::ConversationNotFound)?;

        if outcome == BlockOutcome::Blocked {
            info!(conversation_id = %conversation.id, blocked_by = %blocker_id, "会话已屏蔽");
            self.deps
                .registry
                .publish(
                    &Channel::Conversation(conversation.id.clone()),
                    ServerEvent::ChatBlocked {
                        conversation_id: conversation.id.clone(),
                        blocked_by: blocker_id,
                    },
                )
                .await;
        }
        Ok(outcome)
    }

    /// 为两位用户创建或返回会话，可附带商品上下文
    pub async fn ensure_chat(
        &self,
        user: UserId,
        other: UserId,
        listing: Option<ListingId>,
    ) -> Result<Conversation, ApplicationError> {
        let pair = ParticipantPair::new(user, other)?;
        if self.deps.users.find_by_id(other).await?.is_none() {
            return Err(ApplicationError::creation_failed(format!(
                "unknown user {other}"
            )));
        }
        if let Some(listing) = listing {
            if !self.deps.listings.exists(listing).await? {
                return Err(ApplicationError::ListingNotFound);
            }
        }

        let conversation = self
            .deps
            .conversations
            .get_or_create(pair, listing, self.deps.clock.now())
            .await?;
        Ok(conversation)
    }

    pub async fn conversations_for(
        &self,
        user: UserId,
    ) -> Result<Vec<ConversationSummary>, ApplicationError> {
        Ok(self.deps.conversations.list_for_user(user).await?)
    }

    /// 历史消息，仅会话参与者可读；`limit` 会被限制在配置的单页上限内
    pub async fn history(
        &self,
        user: UserId,
        conversation_id: &ConversationId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.participant_conversation(conversation_id, user).await?;
        let max = self.deps.settings.history_page_limit;
        let limit = limit.unwrap_or(max).clamp(1, max);
        Ok(self
            .deps
            .messages
            .history(conversation_id.clone(), limit, before)
            .await?)
    }

    async fn participant_conversation(
        &self,
        conversation_id: &ConversationId,
        user: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self
            .deps
            .conversations
            .find_by_id(conversation_id.clone())
            .await?
            .ok_or(ApplicationError::ConversationNotFound)?;
        if !conversation.participants.contains(user) {
            return Err(ApplicationError::NotParticipant);
        }
        Ok(conversation)
    }
}
