//! Media objects flowing through the voice-note pipeline.
//!
//! Raw uploads are written by the upload path and never touched here.
//! Converted objects are derived from them and signal "transcoding complete"
//! simply by existing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{PathError, VoiceNotePath};

/// A raw audio upload as stored by the (external) upload path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMediaObject {
    pub tenant_id: String,
    pub conversation_id: String,

    /// Storage path, e.g. `acme/voice-notes/note1.webm`
    pub path: String,

    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl RawMediaObject {
    /// A raw upload at `path`, which must sit directly under `tenant_id`'s
    /// voice-note namespace
    pub fn new(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        path: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Result<Self, PathError> {
        let tenant_id = tenant_id.into();
        let path = path.into();

        let rejected = match VoiceNotePath::parse(&path) {
            Some(VoiceNotePath::Raw { tenant, .. }) if tenant == tenant_id => None,
            Some(VoiceNotePath::Converted { .. }) => Some(PathError::AlreadyConverted(path.clone())),
            _ => Some(PathError::OutsideNamespace(path.clone())),
        };
        if let Some(e) = rejected {
            return Err(e);
        }

        Ok(Self {
            tenant_id,
            conversation_id: conversation_id.into(),
            path,
            content_type: content_type.into(),
            created_at: Utc::now(),
        })
    }
}

/// The canonical-format artifact derived from a raw upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedMediaObject {
    /// Path of the raw object this was produced from
    pub source_path: String,

    /// Path mapper output for `source_path`
    pub path: String,

    pub content_type: String,
}

/// Notification that a storage object was finalized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    /// Bucket the object lives in
    pub bucket: String,

    /// Object path inside the bucket (absent on malformed notifications)
    pub path: Option<String>,

    /// Content type recorded on the object, if any
    pub content_type: Option<String>,
}

impl StorageEvent {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: Some(path.into()),
            content_type: Some(content_type.into()),
        }
    }
}

/// A media reference attached to a message once its artifact is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    /// Time-limited access URL
    pub url: String,

    pub content_type: String,

    /// Position within the message's media list
    pub index: u32,

    /// Storage path the URL was signed for (lets a later pass re-sign it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}
