use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{contact_name, AppendOutcome, ContactDirectory, ConversationStore, MessageLog};
use crate::{
    error::StoreError,
    types::{
        json_text, now_iso, parse_json_text, ChatMessage, Contact, Conversation,
        ConversationStatus, ConversationWithContact, MessageRole, Platform,
    },
};

const CONTACT_COLUMNS: &str = "id, platform, external_id, name, metadata, created_at";
const CONVERSATION_COLUMNS: &str =
    "id, contact_id, channel, status, bot_enabled, last_message_at, created_at";
const MESSAGE_COLUMNS: &str =
    "seq, id, conversation_id, content, role, platform_message_id, metadata, created_at";

/// PostgreSQL-backed store. Uniqueness is enforced by the indexes in
/// `migrations/`, so concurrent webhook requests converge on one row.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn corrupt(err: String) -> StoreError {
    StoreError::Corrupt(err)
}

fn parse_contact_row(row: &PgRow) -> Result<Contact, StoreError> {
    let platform: String = row.try_get("platform")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Contact {
        id: row.try_get("id")?,
        platform: platform.parse().map_err(corrupt)?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        metadata: parse_json_text(&metadata),
        created_at: row.try_get("created_at")?,
    })
}

fn parse_conversation_row(row: &PgRow) -> Result<Conversation, StoreError> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        channel: channel.parse().map_err(corrupt)?,
        status: status.parse().map_err(corrupt)?,
        bot_enabled: row.try_get("bot_enabled")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_message_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let role: String = row.try_get("role")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        content: row.try_get("content")?,
        role: role.parse().map_err(corrupt)?,
        platform_message_id: row.try_get("platform_message_id")?,
        metadata: parse_json_text(&metadata),
        created_at: row.try_get("created_at")?,
        seq: row.try_get("seq")?,
    })
}

#[async_trait]
impl ContactDirectory for PgStore {
    async fn resolve(
        &self,
        platform: Platform,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Contact, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(&format!(
            "INSERT INTO contacts (id, platform, external_id, name, metadata, created_at) \
             VALUES ($1, $2, $3, $4, '{{}}', $5) \
             ON CONFLICT (platform, external_id) DO UPDATE SET platform = EXCLUDED.platform \
             RETURNING {CONTACT_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(platform.as_str())
        .bind(external_id)
        .bind(contact_name(external_id, display_name_hint))
        .bind(now_iso())
        .fetch_one(&self.pool)
        .await?;
        parse_contact_row(&row)
    }

    async fn get_contact(&self, id: &str) -> Result<Contact, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("contact", id))?;
        parse_contact_row(&row)
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_contact_row).collect()
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn get_or_create(
        &self,
        contact_id: &str,
        channel: Platform,
    ) -> Result<Conversation, StoreError> {
        let now = now_iso();
        let row = sqlx::query(&format!(
            "INSERT INTO conversations \
             (id, contact_id, channel, status, bot_enabled, last_message_at, created_at) \
             VALUES ($1, $2, $3, 'active', TRUE, $4, $4) \
             ON CONFLICT (contact_id, channel) WHERE status <> 'closed' \
             DO UPDATE SET channel = EXCLUDED.channel \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(contact_id)
        .bind(channel.as_str())
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        parse_conversation_row(&row)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("conversation", id))?;
        parse_conversation_row(&row)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationWithContact>, StoreError> {
        let rows = sqlx::query(
            "SELECT cv.id, cv.contact_id, cv.channel, cv.status, cv.bot_enabled, \
                    cv.last_message_at, cv.created_at, \
                    ct.id AS contact_id_ref, ct.platform AS contact_platform, \
                    ct.external_id AS contact_external_id, ct.name AS contact_name, \
                    ct.metadata AS contact_metadata, ct.created_at AS contact_created_at \
             FROM conversations cv \
             JOIN contacts ct ON ct.id = cv.contact_id \
             ORDER BY cv.last_message_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ConversationWithContact, StoreError> {
                let platform: String = row.try_get("contact_platform")?;
                let metadata: String = row.try_get("contact_metadata")?;
                let contact = Contact {
                    id: row.try_get("contact_id_ref")?,
                    platform: platform.parse().map_err(corrupt)?,
                    external_id: row.try_get("contact_external_id")?,
                    name: row.try_get("contact_name")?,
                    metadata: parse_json_text(&metadata),
                    created_at: row.try_get("contact_created_at")?,
                };
                Ok(ConversationWithContact {
                    conversation: parse_conversation_row(row)?,
                    contact,
                })
            })
            .collect()
    }

    async fn set_bot_enabled(&self, id: &str, enabled: bool) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET bot_enabled = $1 WHERE id = $2 \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(enabled)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("conversation", id))?;
        parse_conversation_row(&row)
    }

    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET status = $1 \
             WHERE id = $2 AND (status <> 'closed' OR $1 = 'closed') \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => parse_conversation_row(&row),
            None => {
                // Distinguish a missing row from a closed one.
                self.get_conversation(id).await?;
                Err(StoreError::InvalidTransition { id: id.to_string() })
            }
        }
    }

    async fn touch_last_message(&self, id: &str, at: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET last_message_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("conversation", id));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageLog for PgStore {
    async fn append(
        &self,
        conversation_id: &str,
        content: &str,
        role: MessageRole,
        platform_message_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises appends per conversation so seq follows
        // created_at order.
        let locked = sqlx::query("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::not_found("conversation", conversation_id));
        }

        let created_at = now_iso();
        let metadata = metadata.map(|m| json_text(&m)).unwrap_or_else(|| "{}".to_string());
        let inserted = sqlx::query(&format!(
            "INSERT INTO messages \
             (id, conversation_id, content, role, platform_message_id, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (conversation_id, platform_message_id) \
             WHERE platform_message_id IS NOT NULL DO NOTHING \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(conversation_id)
        .bind(content)
        .bind(role.as_str())
        .bind(platform_message_id)
        .bind(metadata)
        .bind(&created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            let existing = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = $1 AND platform_message_id = $2"
            ))
            .bind(conversation_id)
            .bind(platform_message_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(AppendOutcome::Duplicate(parse_message_row(&existing)?));
        };

        sqlx::query("UPDATE conversations SET last_message_at = $1 WHERE id = $2")
            .bind(&created_at)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(AppendOutcome::Created(parse_message_row(&row)?))
    }

    async fn list_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
                 ORDER BY seq DESC LIMIT $2 \
             ) recent ORDER BY seq ASC"
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY seq ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }
}
