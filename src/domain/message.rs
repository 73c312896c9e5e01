//! Conversation messages and the voice-note placeholder lifecycle.
//!
//! A voice note starts life as a placeholder: a message whose
//! `pending_media_path` points at a raw upload. The reconciler resolves it
//! exactly once (media attached, pointer cleared) and then, if the tenant can
//! deliver, moves it through the delivery states below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::media::{MediaAttachment, RawMediaObject};

/// Sender name used on pipeline-authored system messages
pub const SYSTEM_SENDER: &str = "System";

/// A message inside a tenant conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: String,

    pub role: MessageRole,

    /// Display name or address of the author
    pub sender: String,

    pub body: Option<String>,

    /// Who authored the body (never sent to the external channel)
    #[serde(default)]
    pub provenance: Provenance,

    /// Raw upload still waiting for its converted artifact
    pub pending_media_path: Option<String>,

    pub has_media: bool,

    pub media: Option<Vec<MediaAttachment>>,

    #[serde(default)]
    pub delivery_state: DeliveryState,

    /// Id assigned by the messaging gateway on a successful send
    pub gateway_message_id: Option<String>,

    /// Latest status reported back by the gateway
    pub delivery_status: Option<String>,

    pub delivery_error: Option<DeliveryError>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a plain message with no media
    pub fn new(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: MessageRole,
        sender: impl Into<String>,
        body: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            conversation_id: conversation_id.into(),
            role,
            sender: sender.into(),
            body,
            provenance: Provenance::default(),
            pending_media_path: None,
            has_media: false,
            media: None,
            delivery_state: DeliveryState::None,
            gateway_message_id: None,
            delivery_status: None,
            delivery_error: None,
            created_at: Utc::now(),
        }
    }

    /// Create a voice-note placeholder waiting on `raw_path`
    pub fn voice_note_placeholder(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: MessageRole,
        sender: impl Into<String>,
        raw_path: impl Into<String>,
        body: Option<String>,
    ) -> Self {
        let mut message = Self::new(tenant_id, conversation_id, role, sender, body);
        message.pending_media_path = Some(raw_path.into());
        message
    }

    /// Placeholder for a validated raw upload in the upload's conversation
    pub fn for_voice_note(
        raw: &RawMediaObject,
        role: MessageRole,
        sender: impl Into<String>,
        body: Option<String>,
    ) -> Self {
        Self::voice_note_placeholder(
            raw.tenant_id.clone(),
            raw.conversation_id.clone(),
            role,
            sender,
            raw.path.clone(),
            body,
        )
    }

    /// Create a system message (pipeline outcomes, notices)
    pub fn system(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(
            tenant_id,
            conversation_id,
            MessageRole::System,
            SYSTEM_SENDER,
            Some(body.into()),
        )
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            tenant_id: self.tenant_id.clone(),
            conversation_id: self.conversation_id.clone(),
            message_id: self.id.clone(),
        }
    }

    /// Still waiting for its converted artifact
    pub fn is_pending(&self) -> bool {
        self.pending_media_path.is_some() && self.media.is_none()
    }
}

/// Fully qualified address of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub tenant_id: String,
    pub conversation_id: String,
    pub message_id: String,
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.conversation_id, self.message_id)
    }
}

/// Author role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// End customer on the external channel
    Customer,

    /// Human agent or automation replying on behalf of the tenant
    Agent,

    /// Pipeline-authored notice
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(Self::Customer),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Who produced a message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Human,

    /// Written by the automation assistant
    Automation,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Automation => "automation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "automation" => Some(Self::Automation),
            _ => None,
        }
    }
}

/// Delivery lifecycle of a resolved voice note
///
/// `Awaiting → Claimed` is a compare-and-swap in the store; only the worker
/// that wins it may call the gateway. `Delivered`, `Failed` and
/// `TranscodeFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// No delivery applies
    #[default]
    None,

    /// Media attached, delivery wanted, nobody has claimed it yet
    Awaiting,

    /// A worker owns the (non-idempotent) gateway call
    Claimed,

    Delivered,

    /// Gateway rejected the send or the call errored
    Failed,

    /// The converted artifact never appeared within the retry ceiling
    TranscodeFailed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Awaiting => "awaiting",
            Self::Claimed => "claimed",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::TranscodeFailed => "transcode_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "awaiting" => Some(Self::Awaiting),
            "claimed" => Some(Self::Claimed),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "transcode_failed" => Some(Self::TranscodeFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::TranscodeFailed)
    }
}

/// Error reported by the gateway for a send or a status callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryError {
    pub code: Option<String>,
    pub message: String,
}

/// Outcome of one delivery attempt, recorded once per claimed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { gateway_message_id: String },
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    pub fn state(&self) -> DeliveryState {
        match self {
            Self::Delivered { .. } => DeliveryState::Delivered,
            Self::Failed(_) => DeliveryState::Failed,
        }
    }

    /// Body of the system message logging this attempt
    pub fn record_body(&self) -> String {
        match self {
            Self::Delivered { .. } => {
                "Voice note delivered to the customer after conversion.".to_string()
            }
            Self::Failed(error) => match &error.code {
                Some(code) => format!(
                    "Voice note could not be delivered (error {}): {}",
                    code, error.message
                ),
                None => format!("Voice note could not be delivered: {}", error.message),
            },
        }
    }
}
