//! Database utilities and the PostgreSQL record store

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgExecutor, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::{str::FromStr, time::Duration};
use time::OffsetDateTime;

use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use crate::types::{
    Attachment, AttachmentDescriptor, ConversationKey, HistoryCursor, Identity, IdentityId,
    Message, MessageId, NewGlobalMessage, NewMessage,
};

/// Upper bound on rows returned by one attachment sweep
const ATTACHMENT_SWEEP_BATCH: i64 = 500;

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// Record store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct IdentityRow {
    id: i64,
    display_name: String,
    kind: String,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = StoreError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        Ok(Identity {
            id: row.id,
            display_name: row.display_name,
            kind: row.kind.parse().map_err(StoreError::Corrupt)?,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    sender_id: i64,
    receiver_id: i64,
    conversation_key: String,
    body: Option<String>,
    client_token: String,
    created_at: OffsetDateTime,
}

impl MessageRow {
    fn into_message(self, attachments: Vec<AttachmentDescriptor>) -> StoreResult<Message> {
        let conversation_key: ConversationKey = self
            .conversation_key
            .parse()
            .map_err(|e: crate::error::ValidationError| StoreError::Corrupt(e.to_string()))?;

        Ok(Message {
            id: MessageId::Confirmed(self.id),
            sender_id: self.sender_id,
            receiver_id: Some(self.receiver_id),
            conversation_key: Some(conversation_key),
            body: self.body,
            attachments,
            client_token: Some(self.client_token),
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct AttachmentRow {
    message_id: i64,
    storage_key: String,
    file_name: String,
    mime_type: String,
    size_bytes: i64,
}

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, conversation_key, body, client_token, created_at";

/// Load attachment descriptors for a batch of message ids
async fn attachments_for<'e>(
    executor: impl PgExecutor<'e>,
    message_ids: &[i64],
) -> StoreResult<HashMap<i64, Vec<AttachmentDescriptor>>> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, AttachmentRow>(
        r#"
        SELECT message_id, storage_key, file_name, mime_type, size_bytes
        FROM attachments
        WHERE message_id = ANY($1)
        ORDER BY id ASC
        "#,
    )
    .bind(message_ids)
    .fetch_all(executor)
    .await?;

    let mut by_message: HashMap<i64, Vec<AttachmentDescriptor>> = HashMap::new();
    for row in rows {
        by_message
            .entry(row.message_id)
            .or_default()
            .push(AttachmentDescriptor {
                storage_key: row.storage_key,
                file_name: row.file_name,
                mime_type: row.mime_type,
                size_bytes: row.size_bytes,
            });
    }
    Ok(by_message)
}

#[async_trait]
impl Store for PgStore {
    async fn create_message(&self, draft: NewMessage) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (sender_id, receiver_id, conversation_key, body, client_token, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (sender_id, client_token) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(draft.sender_id)
        .bind(draft.receiver_id)
        .bind(draft.conversation_key.to_string())
        .bind(&draft.body)
        .bind(&draft.client_token)
        .bind(draft.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let message = match inserted {
            Some(id) => {
                if let Some(attachment) = &draft.attachment {
                    sqlx::query(
                        r#"
                        INSERT INTO attachments (message_id, storage_key, file_name, mime_type, size_bytes)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (storage_key) DO UPDATE SET message_id = EXCLUDED.message_id
                        "#,
                    )
                    .bind(id)
                    .bind(&attachment.storage_key)
                    .bind(&attachment.file_name)
                    .bind(&attachment.mime_type)
                    .bind(attachment.size_bytes)
                    .execute(&mut *tx)
                    .await?;
                }
                draft.confirmed(id)
            }
            None => {
                let row = sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = $1 AND client_token = $2"
                ))
                .bind(draft.sender_id)
                .bind(&draft.client_token)
                .fetch_one(&mut *tx)
                .await?;

                tracing::debug!(
                    message_id = row.id,
                    sender_id = draft.sender_id,
                    idempotency_token = %draft.client_token,
                    "Repeated message write resolved to existing row"
                );

                let mut attachments = attachments_for(&mut *tx, &[row.id]).await?;
                let descriptors = attachments.remove(&row.id).unwrap_or_default();
                row.into_message(descriptors)?
            }
        };

        tx.commit().await?;
        Ok(message)
    }

    async fn create_global_message(&self, draft: NewGlobalMessage) -> StoreResult<Message> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO global_messages (sender_id, body, created_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(draft.sender_id)
        .bind(&draft.body)
        .bind(draft.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(draft.confirmed(id))
    }

    async fn get_user(&self, id: IdentityId) -> StoreResult<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(
            "SELECT id, display_name, kind FROM identities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Identity::try_from).transpose()
    }

    async fn delete_identity(&self, id: IdentityId) -> StoreResult<bool> {
        // Messages and global posts cascade; attachments are detached and
        // picked up by the attachment sweep.
        let result = sqlx::query("DELETE FROM identities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_online(&self) -> StoreResult<Vec<Identity>> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            "SELECT id, display_name, kind FROM identities WHERE is_online ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Identity::try_from).collect()
    }

    async fn set_presence(
        &self,
        id: IdentityId,
        is_online: bool,
        last_seen: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE identities SET is_online = $2, last_seen_at = $3 WHERE id = $1")
            .bind(id)
            .bind(is_online)
            .bind(last_seen)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn conversation_history(
        &self,
        key: ConversationKey,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_key = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(key.to_string())
        .bind(before.map(|c| c.created_at))
        .bind(before.map(|c| c.id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut attachments = attachments_for(&self.pool, &ids).await?;

        rows.into_iter()
            .map(|row| {
                let descriptors = attachments.remove(&row.id).unwrap_or_default();
                row.into_message(descriptors)
            })
            .collect()
    }

    async fn get_old_attachments(&self, before: OffsetDateTime) -> StoreResult<Vec<Attachment>> {
        #[derive(FromRow)]
        struct OldAttachmentRow {
            id: i64,
            storage_key: String,
            file_name: String,
            created_at: OffsetDateTime,
        }

        let rows = sqlx::query_as::<_, OldAttachmentRow>(
            r#"
            SELECT id, storage_key, file_name, created_at
            FROM attachments
            WHERE message_id IS NULL AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(ATTACHMENT_SWEEP_BATCH)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Attachment {
                id: r.id,
                storage_key: r.storage_key,
                file_name: r.file_name,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn delete_attachment(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM attachments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
