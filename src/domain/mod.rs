//! Domain types for the voice-note pipeline.
//!
//! This module contains the core data structures:
//! - Media: raw uploads, converted artifacts, storage notifications
//! - Message: conversation messages and the placeholder/delivery lifecycle
//! - Tenant: tenants, gateway credentials, conversations
//! - Pending: the reconciler's view of a message awaiting its artifact

pub mod media;
pub mod message;
pub mod pending;
pub mod tenant;

// Re-export commonly used types
pub use media::{ConvertedMediaObject, MediaAttachment, RawMediaObject, StorageEvent};
pub use message::{
    DeliveryError, DeliveryOutcome, DeliveryState, Message, MessageRef, MessageRole, Provenance,
    SYSTEM_SENDER,
};
pub use pending::PendingMessage;
pub use tenant::{Conversation, Tenant, TenantCredentials};
