//! SQLite-backed conversation store.
//!
//! Schema lives in `migrations/` and is applied by `PRAGMA user_version`.
//! All writes that must happen at most once are single conditional UPDATEs
//! (plus their bookkeeping) inside one transaction, so concurrent passes -
//! in this process or another one sharing the database file - can never both
//! win the same transition.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{
    Conversation, DeliveryError, DeliveryOutcome, DeliveryState, MediaAttachment, Message,
    MessageRef, MessageRole, PendingMessage, Provenance, Tenant, TenantCredentials,
};

use super::{ConversationStore, StoreError};

pub const SCHEMA_VERSION: i64 = 2;

const MESSAGE_COLUMNS: &str = "id, tenant_id, conversation_id, role, sender, body, provenance, \
     pending_media_path, has_media, media_json, delivery_state, gateway_message_id, \
     delivery_status, delivery_error_json, created_at";

/// Conversation store over a single SQLite connection
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
}

impl SqliteConversationStore {
    /// Open (or create) a database file and apply migrations
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        let conn = self.lock()?;

        if current < 1 {
            conn.execute_batch(include_str!("../../migrations/0001_conversations.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        if current < 2 {
            conn.execute_batch(include_str!("../../migrations/0002_pending_index.sql"))?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    /// Insert or replace a tenant and its credentials
    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let creds = tenant.credentials.as_ref();
        conn.execute(
            "
            INSERT INTO tenants (id, name, account_id, auth_secret, sender_address)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                account_id = excluded.account_id,
                auth_secret = excluded.auth_secret,
                sender_address = excluded.sender_address
            ",
            params![
                tenant.id,
                tenant.name,
                creds.map(|c| c.account_id.as_str()),
                creds.map(|c| c.auth_secret.as_str()),
                creds.map(|c| c.sender_address.as_str()),
            ],
        )?;
        Ok(())
    }

    /// Insert or update a conversation's recipient address
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO conversations (tenant_id, id, recipient_address, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(tenant_id, id) DO UPDATE SET
                recipient_address = excluded.recipient_address
            ",
            params![
                conversation.tenant_id,
                conversation.id,
                conversation.recipient_address,
                timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, account_id, auth_secret, sender_address FROM tenants ORDER BY id",
        )?;
        let tenants = stmt
            .query_map([], read_tenant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    async fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, account_id, auth_secret, sender_address FROM tenants WHERE id = ?1",
                params![tenant_id],
                read_tenant,
            )
            .optional()?)
    }

    async fn list_conversations(&self, tenant_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, id, recipient_address FROM conversations
             WHERE tenant_id = ?1 ORDER BY created_at, id",
        )?;
        let conversations = stmt
            .query_map(params![tenant_id], read_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    async fn conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT tenant_id, id, recipient_address FROM conversations
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, conversation_id],
                read_conversation,
            )
            .optional()?)
    }

    async fn pending_messages(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<PendingMessage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT tenant_id, conversation_id, id, pending_media_path, pending_attempts,
                   COALESCE(pending_since, created_at)
            FROM messages
            WHERE tenant_id = ?1 AND conversation_id = ?2
              AND pending_media_path IS NOT NULL AND media_json IS NULL
            ORDER BY created_at
            ",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, conversation_id], read_pending)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(PendingRow::into_pending).collect()
    }

    async fn pending_index(&self) -> Result<Vec<PendingMessage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT p.tenant_id, p.conversation_id, p.message_id, p.raw_path,
                   m.pending_attempts, p.enqueued_at
            FROM pending_media p
            JOIN messages m ON m.id = p.message_id
            ORDER BY p.enqueued_at
            ",
        )?;
        let rows = stmt
            .query_map([], read_pending)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(PendingRow::into_pending).collect()
    }

    async fn awaiting_delivery(&self) -> Result<Vec<MessageRef>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, conversation_id, id FROM messages
             WHERE delivery_state = 'awaiting' ORDER BY updated_at",
        )?;
        let refs = stmt
            .query_map([], |row| {
                Ok(MessageRef {
                    tenant_id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    message_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    async fn message(&self, message: &MessageRef) -> Result<Option<Message>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages WHERE id = ?1 AND tenant_id = ?2 AND conversation_id = ?3",
                    MESSAGE_COLUMNS
                ),
                params![message.message_id, message.tenant_id, message.conversation_id],
                read_message,
            )
            .optional()?;
        row.map(MessageRow::into_message).transpose()
    }

    async fn list_messages(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE tenant_id = ?1 AND conversation_id = ?2
             ORDER BY created_at, rowid",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![tenant_id, conversation_id], read_message)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_message_row(&tx, message)?;
        tx.commit()?;
        Ok(())
    }

    async fn record_pending_attempt(
        &self,
        message: &MessageRef,
    ) -> Result<Option<u32>, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "
            UPDATE messages
            SET pending_attempts = pending_attempts + 1, updated_at = ?1
            WHERE id = ?2 AND tenant_id = ?3
              AND pending_media_path IS NOT NULL AND media_json IS NULL
            ",
            params![timestamp(Utc::now()), message.message_id, message.tenant_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let attempts: i64 = conn.query_row(
            "SELECT pending_attempts FROM messages WHERE id = ?1",
            params![message.message_id],
            |row| row.get(0),
        )?;
        Ok(Some(attempts.max(0) as u32))
    }

    async fn resolve_media(
        &self,
        message: &MessageRef,
        attachment: &MediaAttachment,
        deliver: bool,
    ) -> Result<bool, StoreError> {
        let media_json = serde_json::to_string(&vec![attachment.clone()])?;
        let state = if deliver {
            DeliveryState::Awaiting
        } else {
            DeliveryState::None
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "
            UPDATE messages
            SET media_json = ?1, has_media = 1, pending_media_path = NULL,
                delivery_state = ?2, updated_at = ?3
            WHERE id = ?4 AND tenant_id = ?5 AND conversation_id = ?6
              AND pending_media_path IS NOT NULL AND media_json IS NULL
            ",
            params![
                media_json,
                state.as_str(),
                timestamp(Utc::now()),
                message.message_id,
                message.tenant_id,
                message.conversation_id,
            ],
        )?;

        if changed == 1 {
            tx.execute(
                "DELETE FROM pending_media WHERE message_id = ?1",
                params![message.message_id],
            )?;
        }

        tx.commit()?;
        Ok(changed == 1)
    }

    async fn fail_pending(&self, message: &MessageRef, reason: &str) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "
            UPDATE messages
            SET pending_media_path = NULL, delivery_state = 'transcode_failed', updated_at = ?1
            WHERE id = ?2 AND tenant_id = ?3 AND conversation_id = ?4
              AND pending_media_path IS NOT NULL AND media_json IS NULL
            ",
            params![
                timestamp(Utc::now()),
                message.message_id,
                message.tenant_id,
                message.conversation_id,
            ],
        )?;

        if changed == 1 {
            tx.execute(
                "DELETE FROM pending_media WHERE message_id = ?1",
                params![message.message_id],
            )?;
            let notice = Message::system(&message.tenant_id, &message.conversation_id, reason);
            insert_message_row(&tx, &notice)?;
        }

        tx.commit()?;
        Ok(changed == 1)
    }

    async fn claim_delivery(&self, message: &MessageRef, claim_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let now = timestamp(Utc::now());
        let changed = conn.execute(
            "
            UPDATE messages
            SET delivery_state = 'claimed', claim_id = ?1, claimed_at = ?2, updated_at = ?2
            WHERE id = ?3 AND tenant_id = ?4 AND conversation_id = ?5
              AND delivery_state = 'awaiting'
            ",
            params![
                claim_id,
                now,
                message.message_id,
                message.tenant_id,
                message.conversation_id,
            ],
        )?;
        Ok(changed == 1)
    }

    async fn complete_delivery(
        &self,
        message: &MessageRef,
        claim_id: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<(), StoreError> {
        let (gateway_id, status, error_json) = match outcome {
            DeliveryOutcome::Delivered { gateway_message_id } => {
                (Some(gateway_message_id.as_str()), None, None)
            }
            DeliveryOutcome::Failed(error) => {
                (None, Some("failed"), Some(serde_json::to_string(error)?))
            }
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "
            UPDATE messages
            SET delivery_state = ?1, gateway_message_id = ?2, delivery_status = ?3,
                delivery_error_json = ?4, updated_at = ?5
            WHERE id = ?6 AND tenant_id = ?7 AND delivery_state = 'claimed' AND claim_id = ?8
            ",
            params![
                outcome.state().as_str(),
                gateway_id,
                status,
                error_json,
                timestamp(Utc::now()),
                message.message_id,
                message.tenant_id,
                claim_id,
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "claim {} on message {}",
                claim_id, message
            )));
        }

        let record = Message::system(
            &message.tenant_id,
            &message.conversation_id,
            outcome.record_body(),
        );
        insert_message_row(&tx, &record)?;

        tx.commit()?;
        Ok(())
    }

    async fn append_system_message(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        body: &str,
    ) -> Result<Message, StoreError> {
        let message = Message::system(tenant_id, conversation_id, body);
        let conn = self.lock()?;
        insert_message_row(&conn, &message)?;
        Ok(message)
    }

    async fn apply_delivery_status(
        &self,
        gateway_message_id: &str,
        status: &str,
        error: Option<&DeliveryError>,
    ) -> Result<bool, StoreError> {
        let error_json = error.map(serde_json::to_string).transpose()?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "
            UPDATE messages
            SET delivery_status = ?1,
                delivery_error_json = COALESCE(?2, delivery_error_json),
                updated_at = ?3
            WHERE gateway_message_id = ?4
            ",
            params![status, error_json, timestamp(Utc::now()), gateway_message_id],
        )?;
        Ok(changed > 0)
    }
}

fn insert_message_row(conn: &Connection, message: &Message) -> Result<(), StoreError> {
    let media_json = message.media.as_ref().map(serde_json::to_string).transpose()?;
    let error_json = message
        .delivery_error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let created_at = timestamp(message.created_at);
    let placeholder = message.is_pending();

    conn.execute(
        "
        INSERT INTO messages (
            id, tenant_id, conversation_id, role, sender, body, provenance,
            pending_media_path, pending_since, has_media, media_json, delivery_state,
            gateway_message_id, delivery_status, delivery_error_json, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
        ",
        params![
            message.id,
            message.tenant_id,
            message.conversation_id,
            message.role.as_str(),
            message.sender,
            message.body,
            message.provenance.as_str(),
            message.pending_media_path,
            placeholder.then(|| created_at.clone()),
            message.has_media,
            media_json,
            message.delivery_state.as_str(),
            message.gateway_message_id,
            message.delivery_status,
            error_json,
            created_at,
        ],
    )?;

    if let (true, Some(raw_path)) = (placeholder, message.pending_media_path.as_deref()) {
        conn.execute(
            "
            INSERT INTO pending_media (message_id, tenant_id, conversation_id, raw_path, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                message.id,
                message.tenant_id,
                message.conversation_id,
                raw_path,
                created_at,
            ],
        )?;
    }

    Ok(())
}

/// RFC 3339 with fixed precision so text order matches time order
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", value, e)))
}

fn read_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let account_id: Option<String> = row.get(2)?;
    let auth_secret: Option<String> = row.get(3)?;
    let sender_address: Option<String> = row.get(4)?;

    let credentials = match (account_id, auth_secret, sender_address) {
        (Some(account_id), Some(auth_secret), Some(sender_address)) => Some(TenantCredentials {
            account_id,
            auth_secret,
            sender_address,
        }),
        _ => None,
    };

    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        credentials,
    })
}

fn read_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        tenant_id: row.get(0)?,
        id: row.get(1)?,
        recipient_address: row.get(2)?,
    })
}

struct PendingRow {
    message: MessageRef,
    raw_path: String,
    attempts: i64,
    since: String,
}

impl PendingRow {
    fn into_pending(self) -> Result<PendingMessage, StoreError> {
        Ok(PendingMessage {
            message: self.message,
            pending_media_path: self.raw_path,
            attempts: self.attempts.max(0) as u32,
            pending_since: parse_timestamp(&self.since)?,
        })
    }
}

fn read_pending(row: &Row<'_>) -> rusqlite::Result<PendingRow> {
    Ok(PendingRow {
        message: MessageRef {
            tenant_id: row.get(0)?,
            conversation_id: row.get(1)?,
            message_id: row.get(2)?,
        },
        raw_path: row.get(3)?,
        attempts: row.get(4)?,
        since: row.get(5)?,
    })
}

/// Raw column values; decoded outside the rusqlite callback so decode errors
/// surface as `StoreError::Corrupt`
struct MessageRow {
    id: String,
    tenant_id: String,
    conversation_id: String,
    role: String,
    sender: String,
    body: Option<String>,
    provenance: String,
    pending_media_path: Option<String>,
    has_media: bool,
    media_json: Option<String>,
    delivery_state: String,
    gateway_message_id: Option<String>,
    delivery_status: Option<String>,
    delivery_error_json: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message, StoreError> {
        let media: Option<Vec<MediaAttachment>> = self
            .media_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let delivery_error: Option<DeliveryError> = self
            .delivery_error_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Message {
            role: MessageRole::parse(&self.role)
                .ok_or_else(|| StoreError::Corrupt(format!("message role '{}'", self.role)))?,
            provenance: Provenance::parse(&self.provenance).ok_or_else(|| {
                StoreError::Corrupt(format!("message provenance '{}'", self.provenance))
            })?,
            delivery_state: DeliveryState::parse(&self.delivery_state).ok_or_else(|| {
                StoreError::Corrupt(format!("delivery state '{}'", self.delivery_state))
            })?,
            created_at: parse_timestamp(&self.created_at)?,
            id: self.id,
            tenant_id: self.tenant_id,
            conversation_id: self.conversation_id,
            sender: self.sender,
            body: self.body,
            pending_media_path: self.pending_media_path,
            has_media: self.has_media,
            media,
            gateway_message_id: self.gateway_message_id,
            delivery_status: self.delivery_status,
            delivery_error,
        })
    }
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        conversation_id: row.get(2)?,
        role: row.get(3)?,
        sender: row.get(4)?,
        body: row.get(5)?,
        provenance: row.get(6)?,
        pending_media_path: row.get(7)?,
        has_media: row.get(8)?,
        media_json: row.get(9)?,
        delivery_state: row.get(10)?,
        gateway_message_id: row.get(11)?,
        delivery_status: row.get(12)?,
        delivery_error_json: row.get(13)?,
        created_at: row.get(14)?,
    })
}
