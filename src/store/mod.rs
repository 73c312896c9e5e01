//! Conversation store.
//!
//! The tenant-partitioned document store holding tenants, conversations and
//! messages. The pipeline only performs the reads and conditional writes
//! declared on [`ConversationStore`]; every state change that must happen at
//! most once (resolving a placeholder, claiming a delivery) is a
//! compare-and-swap that reports whether this caller won.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    Conversation, DeliveryError, DeliveryOutcome, MediaAttachment, Message, MessageRef,
    PendingMessage, Tenant,
};

pub use sqlite::SqliteConversationStore;

/// Errors from the conversation store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// What the reconciliation pipeline needs from the conversation store
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError>;

    async fn list_conversations(&self, tenant_id: &str) -> Result<Vec<Conversation>, StoreError>;

    async fn conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Messages in one conversation with a pending pointer and no media (full-scan path)
    async fn pending_messages(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<PendingMessage>, StoreError>;

    /// All unresolved placeholders, read from the pending index
    async fn pending_index(&self) -> Result<Vec<PendingMessage>, StoreError>;

    /// Resolved messages whose delivery has not been claimed yet
    async fn awaiting_delivery(&self) -> Result<Vec<MessageRef>, StoreError>;

    async fn message(&self, message: &MessageRef) -> Result<Option<Message>, StoreError>;

    async fn list_messages(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError>;

    /// Insert a message; placeholders are added to the pending index in the same write
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Count one pass that found no artifact; returns the new attempt count,
    /// or `None` if the message is no longer pending
    async fn record_pending_attempt(&self, message: &MessageRef)
        -> Result<Option<u32>, StoreError>;

    /// Attach media, set `has_media`, clear the pointer - only if the pointer
    /// is still set and media is absent. `deliver` moves the message to
    /// `awaiting`. Returns `false` if another writer got there first.
    async fn resolve_media(
        &self,
        message: &MessageRef,
        attachment: &MediaAttachment,
        deliver: bool,
    ) -> Result<bool, StoreError>;

    /// Give up on a pending pointer: mark `transcode_failed`, drop it from the
    /// index and log `reason` as a system message. Returns `false` if the
    /// message was no longer pending.
    async fn fail_pending(&self, message: &MessageRef, reason: &str) -> Result<bool, StoreError>;

    /// Compare-and-swap `awaiting → claimed`; only the winner may deliver
    async fn claim_delivery(&self, message: &MessageRef, claim_id: &str) -> Result<bool, StoreError>;

    /// Record the outcome of a claimed delivery and append its attempt record
    async fn complete_delivery(
        &self,
        message: &MessageRef,
        claim_id: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<(), StoreError>;

    /// Append a system message to a conversation
    async fn append_system_message(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        body: &str,
    ) -> Result<Message, StoreError>;

    /// Record an asynchronous gateway status callback; `false` if no message
    /// carries `gateway_message_id`
    async fn apply_delivery_status(
        &self,
        gateway_message_id: &str,
        status: &str,
        error: Option<&DeliveryError>,
    ) -> Result<bool, StoreError>;
}
