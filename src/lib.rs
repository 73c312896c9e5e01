//! voxrelay - voice-note pipeline for multi-tenant customer messaging
//!
//! Agents record voice notes in the browser; the raw upload is transcoded to
//! a channel-compatible format in the background, attached to its
//! placeholder message by a periodic reconciler, and delivered to the
//! customer through a messaging gateway.
//!
//! # Architecture
//!
//! ```text
//! upload ─► Dispatcher ─► Transcoder ─► converted artifact
//!                                            │
//!            Scheduler tick ─► Reconciler ◄──┘ (existence = ready)
//!                                 │
//!                                 ├─ attach media (CAS on the pending pointer)
//!                                 └─ claim (CAS) ─► DeliveryAdapter ─► gateway
//! ```
//!
//! # Modules
//!
//! - `storage`: path mapper, signed URLs, object storage backend
//! - `transcode`: dispatcher, ffmpeg transcoder, bucket watcher
//! - `store`: conversation store trait and SQLite implementation
//! - `delivery`: gateway client and delivery adapter
//! - `reconcile`: reconciliation pass and scheduler
//! - `domain`: tenants, conversations, messages, media
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Convert an upload the way the storage trigger would
//! voxrelay dispatch acme/voice-notes/note1.webm --content-type audio/webm
//!
//! # Run one reconciliation pass
//! voxrelay reconcile --once
//! ```

pub mod cli;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod reconcile;
pub mod storage;
pub mod store;
pub mod transcode;

// Re-export main types at crate root for convenience
pub use delivery::{DeliveryAdapter, MessagingGateway, TwilioGateway};
pub use domain::{
    Conversation, DeliveryOutcome, DeliveryState, MediaAttachment, Message, MessageRef,
    PendingMessage, StorageEvent, Tenant, TenantCredentials,
};
pub use reconcile::{PassReport, Reconciler, RunGuard, ScanMode, Scheduler, TickOutcome};
pub use storage::{LocalObjectStore, ObjectStore, PathMapper, UrlSigner};
pub use store::{ConversationStore, SqliteConversationStore};
pub use transcode::{DispatchOutcome, Dispatcher, FfmpegTranscoder, StorageWatcher, Transcoder};
