use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::{
    AppendOutcome, BlockOutcome, Conversation, ConversationId, ConversationRepository,
    ConversationSummary, ListingDirectory, ListingId, Message, MessageId, MessageRepository,
    MessageText, NewMessage, ParticipantPair, RepositoryError, RepositoryFuture, SenderRole,
    Timestamp, User, UserId, UserRepository,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgConnection, PgPool};
use tracing::debug;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

const CONVERSATION_COLUMNS: &str =
    "id, participant_low, participant_high, listing_id, is_blocked, blocked_by, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_role, body, is_read, created_at";

#[derive(Debug, FromRow)]
struct UserRecord {
    id: i64,
    display_name: String,
    session_token: Option<String>,
    is_online: bool,
    last_seen_at: Option<DateTime<Utc>>,
}

impl From<UserRecord> for User {
    fn from(value: UserRecord) -> Self {
        User {
            id: UserId(value.id),
            display_name: value.display_name,
            is_online: value.is_online,
            last_seen_at: value.last_seen_at,
            session_token: value.session_token,
        }
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: String,
    participant_low: i64,
    participant_high: i64,
    listing_id: Option<i64>,
    is_blocked: bool,
    blocked_by: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        let participants =
            ParticipantPair::new(UserId(value.participant_low), UserId(value.participant_high))?;
        let id = ConversationId::new(value.id);
        if participants.conversation_id() != id {
            return Err(invalid_data(format!(
                "conversation id {id} does not match its participants"
            )));
        }

        Ok(Conversation {
            id,
            participants,
            listing_id: value.listing_id.map(ListingId),
            is_blocked: value.is_blocked,
            blocked_by: value.blocked_by.map(UserId),
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    conversation_id: String,
    sender_id: i64,
    sender_role: String,
    body: String,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId(value.id),
            conversation_id: ConversationId::new(value.conversation_id),
            sender_id: UserId(value.sender_id),
            sender_role: SenderRole::parse(&value.sender_role)?,
            text: MessageText::new(value.body)?,
            is_read: value.is_read,
            created_at: value.created_at,
        })
    }
}

/// 会话列表查询的一行：会话列、未读数以及可能为空的最后一条消息
#[derive(Debug, FromRow)]
struct SummaryRecord {
    #[sqlx(flatten)]
    conversation: ConversationRecord,
    unread_count: i64,
    last_id: Option<i64>,
    last_sender_id: Option<i64>,
    last_sender_role: Option<String>,
    last_body: Option<String>,
    last_is_read: Option<bool>,
    last_created_at: Option<DateTime<Utc>>,
}

impl TryFrom<SummaryRecord> for ConversationSummary {
    type Error = RepositoryError;

    fn try_from(value: SummaryRecord) -> Result<Self, Self::Error> {
        let conversation = Conversation::try_from(value.conversation)?;
        let last_message = match (
            value.last_id,
            value.last_sender_id,
            value.last_sender_role,
            value.last_body,
            value.last_is_read,
            value.last_created_at,
        ) {
            (Some(id), Some(sender_id), Some(sender_role), Some(body), Some(is_read), Some(created_at)) => {
                Some(Message::try_from(MessageRecord {
                    id,
                    conversation_id: conversation.id.to_string(),
                    sender_id,
                    sender_role,
                    body,
                    is_read,
                    created_at,
                })?)
            }
            _ => None,
        };

        Ok(ConversationSummary {
            conversation,
            unread_count: u64::try_from(value.unread_count)
                .map_err(|_| invalid_data("negative unread count"))?,
            last_message,
        })
    }
}

/// 在当前事务内锁住会话行
async fn lock_conversation(
    conn: &mut PgConnection,
    id: &ConversationId,
) -> Result<Option<Conversation>, RepositoryError> {
    let record = sqlx::query_as::<_, ConversationRecord>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_str())
    .fetch_optional(conn)
    .await
    .map_err(map_sqlx_err)?;

    record.map(Conversation::try_from).transpose()
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl UserRepository for PgUserRepository {
    fn find_by_id(&self, id: UserId) -> RepositoryFuture<Option<User>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, UserRecord>(
                r#"SELECT id, display_name, session_token, is_online, last_seen_at FROM users WHERE id = $1"#,
            )
            .bind(id.value())
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(record.map(User::from))
        })
    }

    fn find_by_session_token(&self, token: String) -> RepositoryFuture<Option<User>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, UserRecord>(
                r#"SELECT id, display_name, session_token, is_online, last_seen_at FROM users WHERE session_token = $1"#,
            )
            .bind(token)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(record.map(User::from))
        })
    }

    fn set_online(&self, id: UserId, online: bool, at: Timestamp) -> RepositoryFuture<()> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let result =
                sqlx::query(r#"UPDATE users SET is_online = $2, last_seen_at = $3 WHERE id = $1"#)
                    .bind(id.value())
                    .bind(online)
                    .bind(at)
                    .execute(&pool)
                    .await
                    .map_err(map_sqlx_err)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound);
            }
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ConversationRepository for PgConversationRepository {
    fn get_or_create(
        &self,
        participants: ParticipantPair,
        listing_id: Option<ListingId>,
        now: Timestamp,
    ) -> RepositoryFuture<Conversation> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let id = participants.conversation_id();
            // 主键冲突说明另一方已先创建，保留已有记录不做任何修改
            sqlx::query(
                r#"
                INSERT INTO conversations (id, participant_low, participant_high, listing_id, is_blocked, created_at, updated_at)
                VALUES ($1, $2, $3, $4, FALSE, $5, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(id.as_str())
            .bind(participants.low().value())
            .bind(participants.high().value())
            .bind(listing_id.map(|listing| listing.0))
            .bind(now)
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;

            let record = sqlx::query_as::<_, ConversationRecord>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
            ))
            .bind(id.as_str())
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Conversation::try_from(record)
        })
    }

    fn find_by_id(&self, id: ConversationId) -> RepositoryFuture<Option<Conversation>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, ConversationRecord>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
            ))
            .bind(id.as_str())
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            record.map(Conversation::try_from).transpose()
        })
    }

    fn set_blocked(
        &self,
        id: ConversationId,
        blocker: UserId,
    ) -> RepositoryFuture<Option<(Conversation, BlockOutcome)>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            let Some(mut conversation) = lock_conversation(&mut tx, &id).await? else {
                return Ok(None);
            };
            let outcome = conversation.block(blocker)?;

            if outcome == BlockOutcome::Blocked {
                let record = sqlx::query_as::<_, ConversationRecord>(&format!(
                    r#"
                    UPDATE conversations
                    SET is_blocked = TRUE, blocked_by = $2
                    WHERE id = $1
                    RETURNING {CONVERSATION_COLUMNS}
                    "#
                ))
                .bind(id.as_str())
                .bind(blocker.value())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                conversation = Conversation::try_from(record)?;
            }

            tx.commit().await.map_err(map_sqlx_err)?;
            Ok(Some((conversation, outcome)))
        })
    }

    fn list_for_user(&self, user: UserId) -> RepositoryFuture<Vec<ConversationSummary>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let records = sqlx::query_as::<_, SummaryRecord>(
                r#"
                SELECT c.id, c.participant_low, c.participant_high, c.listing_id, c.is_blocked,
                       c.blocked_by, c.created_at, c.updated_at,
                       (SELECT COUNT(*) FROM messages u
                         WHERE u.conversation_id = c.id AND u.sender_id <> $1 AND NOT u.is_read) AS unread_count,
                       lm.id AS last_id, lm.sender_id AS last_sender_id, lm.sender_role AS last_sender_role,
                       lm.body AS last_body, lm.is_read AS last_is_read, lm.created_at AS last_created_at
                FROM conversations c
                LEFT JOIN LATERAL (
                    SELECT m.id, m.sender_id, m.sender_role, m.body, m.is_read, m.created_at
                    FROM messages m
                    WHERE m.conversation_id = c.id
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT 1
                ) lm ON TRUE
                WHERE c.participant_low = $1 OR c.participant_high = $1
                ORDER BY c.updated_at DESC, c.id DESC
                "#,
            )
            .bind(user.value())
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            records.into_iter().map(ConversationSummary::try_from).collect()
        })
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MessageRepository for PgMessageRepository {
    fn append(&self, message: NewMessage) -> RepositoryFuture<AppendOutcome> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            // 行锁保证与并发的屏蔽请求串行化
            let Some(conversation) = lock_conversation(&mut tx, &message.conversation_id).await?
            else {
                return Ok(AppendOutcome::ConversationMissing);
            };
            if conversation.is_blocked {
                debug!(conversation_id = %conversation.id, "会话已屏蔽，拒绝写入");
                return Ok(AppendOutcome::Blocked);
            }

            let created_at = conversation.next_message_time(message.sent_at);
            let record = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                INSERT INTO messages (conversation_id, sender_id, sender_role, body, is_read, created_at)
                VALUES ($1, $2, $3, $4, FALSE, $5)
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(conversation.id.as_str())
            .bind(message.sender_id.value())
            .bind(message.sender_role.as_str())
            .bind(message.text.as_str())
            .bind(created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            sqlx::query(r#"UPDATE conversations SET updated_at = $2 WHERE id = $1"#)
                .bind(conversation.id.as_str())
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

            tx.commit().await.map_err(map_sqlx_err)?;
            Ok(AppendOutcome::Appended(Message::try_from(record)?))
        })
    }

    fn mark_read(&self, conversation: ConversationId, reader: UserId) -> RepositoryFuture<u64> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE messages SET is_read = TRUE
                WHERE conversation_id = $1 AND sender_id <> $2 AND NOT is_read
                "#,
            )
            .bind(conversation.as_str())
            .bind(reader.value())
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(result.rows_affected())
        })
    }

    fn history(
        &self,
        conversation: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> RepositoryFuture<Vec<Message>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let anchor = match before {
                Some(id) => Some(
                    sqlx::query_as::<_, (DateTime<Utc>, i64)>(
                        r#"SELECT created_at, id FROM messages WHERE id = $1 AND conversation_id = $2"#,
                    )
                    .bind(id.0)
                    .bind(conversation.as_str())
                    .fetch_optional(&pool)
                    .await
                    .map_err(map_sqlx_err)?
                    .ok_or(RepositoryError::NotFound)?,
                ),
                None => None,
            };

            // 先倒序取最近的一页，再翻转为升序
            let records = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS} FROM (
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE conversation_id = $1
                      AND ($3::TIMESTAMPTZ IS NULL OR (created_at, id) < ($3, $4))
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                ) page
                ORDER BY created_at ASC, id ASC
                "#
            ))
            .bind(conversation.as_str())
            .bind(i64::from(limit))
            .bind(anchor.map(|(created_at, _)| created_at))
            .bind(anchor.map(|(_, id)| id))
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            records.into_iter().map(Message::try_from).collect()
        })
    }

    fn count(&self, conversation: ConversationId) -> RepositoryFuture<u64> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar(r#"SELECT COUNT(*) FROM messages WHERE conversation_id = $1"#)
                    .bind(conversation.as_str())
                    .fetch_one(&pool)
                    .await
                    .map_err(map_sqlx_err)?;

            u64::try_from(count).map_err(|_| invalid_data("negative message count"))
        })
    }
}

#[derive(Clone)]
pub struct PgListingDirectory {
    pool: PgPool,
}

impl PgListingDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ListingDirectory for PgListingDirectory {
    fn exists(&self, listing: ListingId) -> RepositoryFuture<bool> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query_scalar(r#"SELECT EXISTS (SELECT 1 FROM listings WHERE id = $1)"#)
                .bind(listing.0)
                .fetch_one(&pool)
                .await
                .map_err(map_sqlx_err)
        })
    }
}

pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub conversation_repository: Arc<PgConversationRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub listing_directory: Arc<PgListingDirectory>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            conversation_repository: Arc::new(PgConversationRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            listing_directory: Arc::new(PgListingDirectory::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
