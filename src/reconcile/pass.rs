//! One reconciliation pass.
//!
//! A pass finds placeholders whose converted artifact now exists, attaches
//! the artifact exactly once, and hands the message to the delivery adapter
//! if this pass wins the delivery claim. Every per-message failure is logged
//! and counted; it never aborts the pass.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::delivery::{DeliveryAdapter, DeliveryRequest};
use crate::domain::{
    DeliveryOutcome, MediaAttachment, Message, MessageRef, PendingMessage, TenantCredentials,
};
use crate::storage::{ObjectStore, ObjectStoreError, PathMapper};
use crate::store::{ConversationStore, StoreError};
use crate::transcode::TranscodeTarget;

/// Errors while reconciling a single message (or discovering the work list)
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Object storage error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Message not found: {0}")]
    MissingMessage(String),

    #[error("Message has no media to deliver: {0}")]
    MissingMedia(String),
}

/// How a pass discovers pending placeholders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Enumerate every tenant, conversation and message
    Full,

    /// Read the pending index written at placeholder creation
    #[default]
    Index,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Index => "index",
        }
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "index" => Ok(Self::Index),
            other => Err(format!("unknown scan mode '{}' (expected full or index)", other)),
        }
    }
}

/// Tunables for a pass
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub scan_mode: ScanMode,

    /// Passes without an artifact before a placeholder is given up
    pub max_attempts: u32,

    /// Age after which a placeholder is given up regardless of attempts
    pub max_age: Duration,

    /// Lifetime of the signed artifact URL
    pub url_ttl: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::Index,
            max_attempts: 30,
            max_age: Duration::hours(6),
            url_ttl: Duration::days(7),
        }
    }
}

/// What happened to one message in a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Artifact not there yet; retried next pass
    NotReady { attempts: u32 },

    /// Retry ceiling reached; marked `transcode_failed`
    Expired,

    /// Pointer can never map to a converted artifact; marked `transcode_failed`
    Rejected,

    /// Another writer resolved (or failed) the placeholder first
    AlreadyResolved,

    /// Media attached; no delivery applies
    Attached,

    /// Delivery wanted but no usable credentials or recipient
    Undeliverable,

    /// Another pass holds the delivery claim
    ClaimLost,

    /// This pass delivered (or failed to deliver) the message
    Delivered(DeliveryOutcome),
}

impl Resolution {
    /// Whether the placeholder was resolved by this call
    pub fn attached_media(&self) -> bool {
        matches!(
            self,
            Self::Attached | Self::Undeliverable | Self::ClaimLost | Self::Delivered(_)
        )
    }
}

/// Counters for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Pending placeholders discovered
    pub scanned: usize,
    pub not_ready: usize,
    pub expired: usize,
    pub rejected: usize,

    /// Placeholders this pass attached media to
    pub resolved: usize,
    pub already_resolved: usize,
    pub delivered: usize,
    pub delivery_failed: usize,
    pub claim_lost: usize,
    pub undeliverable: usize,

    /// Messages left `awaiting` by an earlier pass and picked up here
    pub recovered: usize,

    pub errors: usize,
}

impl PassReport {
    fn record(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::NotReady { .. } => self.not_ready += 1,
            Resolution::Expired => self.expired += 1,
            Resolution::Rejected => self.rejected += 1,
            Resolution::AlreadyResolved => self.already_resolved += 1,
            Resolution::Attached => {}
            Resolution::Undeliverable => self.undeliverable += 1,
            Resolution::ClaimLost => self.claim_lost += 1,
            Resolution::Delivered(DeliveryOutcome::Delivered { .. }) => self.delivered += 1,
            Resolution::Delivered(DeliveryOutcome::Failed(_)) => self.delivery_failed += 1,
        }
    }

    /// Total gateway calls made by this pass
    pub fn delivery_attempts(&self) -> usize {
        self.delivered + self.delivery_failed
    }
}

pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    objects: Arc<dyn ObjectStore>,
    adapter: DeliveryAdapter,
    target: TranscodeTarget,
    mapper: PathMapper,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        objects: Arc<dyn ObjectStore>,
        adapter: DeliveryAdapter,
        settings: ReconcileSettings,
    ) -> Self {
        let target = TranscodeTarget::canonical();
        let mapper = PathMapper::new(target.extension.clone());
        Self {
            store,
            objects,
            adapter,
            target,
            mapper,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Run one pass at the current time
    pub async fn run_pass(&self) -> Result<PassReport, ReconcileError> {
        self.run_pass_at(Utc::now()).await
    }

    /// Run one pass, judging placeholder age against `now`.
    ///
    /// Only discovery failures (before any message is touched) are returned.
    #[instrument(skip(self, now), fields(scan_mode = self.settings.scan_mode.as_str()))]
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<PassReport, ReconcileError> {
        let claim_id = format!("pass-{}", Uuid::new_v4());
        let mut report = PassReport::default();

        let awaiting = self.store.awaiting_delivery().await?;
        let pending = self.discover().await?;
        report.scanned = pending.len();

        for message in &awaiting {
            match self.deliver_resolved(message, &claim_id, None).await {
                Ok(resolution) => {
                    if matches!(resolution, Resolution::Delivered(_)) {
                        report.recovered += 1;
                    }
                    report.record(&resolution);
                }
                Err(e) => {
                    error!(message = %message, error = %e, "Failed to recover awaiting delivery");
                    report.errors += 1;
                }
            }
        }

        for item in &pending {
            match self.process(item, &claim_id, now).await {
                Ok(resolution) => {
                    if resolution.attached_media() {
                        report.resolved += 1;
                    }
                    report.record(&resolution);
                }
                Err(e) => {
                    error!(
                        message = %item.message,
                        path = %item.pending_media_path,
                        error = %e,
                        "Failed to reconcile voice note"
                    );
                    report.errors += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            resolved = report.resolved,
            delivered = report.delivered,
            delivery_failed = report.delivery_failed,
            not_ready = report.not_ready,
            expired = report.expired,
            rejected = report.rejected,
            recovered = report.recovered,
            errors = report.errors,
            "Reconciliation pass complete"
        );

        Ok(report)
    }

    /// Pending placeholders, by index or by full enumeration
    async fn discover(&self) -> Result<Vec<PendingMessage>, ReconcileError> {
        match self.settings.scan_mode {
            ScanMode::Index => Ok(self.store.pending_index().await?),
            ScanMode::Full => {
                let mut pending = Vec::new();
                for tenant in self.store.list_tenants().await? {
                    for conversation in self.store.list_conversations(&tenant.id).await? {
                        pending.extend(
                            self.store
                                .pending_messages(&tenant.id, &conversation.id)
                                .await?,
                        );
                    }
                }
                pending.sort_by(|a, b| a.pending_since.cmp(&b.pending_since));
                Ok(pending)
            }
        }
    }

    async fn process(
        &self,
        item: &PendingMessage,
        claim_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution, ReconcileError> {
        let converted_path = match self.mapper.converted_path(&item.pending_media_path) {
            Ok(path) => path,
            Err(e) => {
                let reason = format!("Voice note could not be converted: {}.", e);
                if self.store.fail_pending(&item.message, &reason).await? {
                    warn!(message = %item.message, error = %e, "Rejecting voice note pointer");
                    return Ok(Resolution::Rejected);
                }
                return Ok(Resolution::AlreadyResolved);
            }
        };

        if !self.objects.exists(&converted_path).await? {
            let Some(attempts) = self.store.record_pending_attempt(&item.message).await? else {
                debug!(message = %item.message, "Voice note resolved since discovery");
                return Ok(Resolution::AlreadyResolved);
            };

            if item.exceeds_ceiling(
                attempts,
                self.settings.max_attempts,
                self.settings.max_age,
                now,
            ) {
                let reason = format!(
                    "Voice note could not be converted: no converted audio after {} attempts.",
                    attempts
                );
                if self.store.fail_pending(&item.message, &reason).await? {
                    warn!(
                        message = %item.message,
                        path = %item.pending_media_path,
                        attempts,
                        "Giving up on voice note"
                    );
                    return Ok(Resolution::Expired);
                }
                return Ok(Resolution::AlreadyResolved);
            }

            debug!(message = %item.message, attempts, "Converted voice note not ready");
            return Ok(Resolution::NotReady { attempts });
        }

        let target = self.delivery_target(&item.message).await?;
        let signed = self
            .objects
            .signed_url(&converted_path, self.settings.url_ttl)
            .await?;

        let attachment = MediaAttachment {
            url: signed.url.clone(),
            content_type: self.target.content_type.clone(),
            index: 0,
            path: Some(converted_path.clone()),
        };

        if !self
            .store
            .resolve_media(&item.message, &attachment, target.is_some())
            .await?
        {
            debug!(message = %item.message, "Voice note already resolved");
            return Ok(Resolution::AlreadyResolved);
        }

        info!(message = %item.message, media = %converted_path, "Attached converted voice note");

        if target.is_none() {
            return Ok(Resolution::Attached);
        }

        self.deliver_resolved(&item.message, claim_id, Some(signed.url))
            .await
    }

    /// Claim and deliver a message in `awaiting`. `media_url` is the URL just
    /// signed for it; otherwise the stored attachment is re-signed.
    async fn deliver_resolved(
        &self,
        message_ref: &MessageRef,
        claim_id: &str,
        media_url: Option<String>,
    ) -> Result<Resolution, ReconcileError> {
        let message = self
            .store
            .message(message_ref)
            .await?
            .ok_or_else(|| ReconcileError::MissingMessage(message_ref.to_string()))?;

        if message.delivery_state.is_terminal() {
            debug!(message = %message_ref, state = message.delivery_state.as_str(), "Already delivered");
            return Ok(Resolution::AlreadyResolved);
        }

        let Some((credentials, recipient)) = self.delivery_target(message_ref).await? else {
            warn!(message = %message_ref, "Delivery credentials or recipient missing, leaving awaiting");
            return Ok(Resolution::Undeliverable);
        };

        let media_url = match media_url {
            Some(url) => url,
            None => self.current_media_url(&message).await?,
        };

        if !self.store.claim_delivery(message_ref, claim_id).await? {
            debug!(message = %message_ref, "Delivery claimed by another pass");
            return Ok(Resolution::ClaimLost);
        }

        let request = DeliveryRequest {
            message: message_ref,
            credentials: &credentials,
            recipient: &recipient,
            media_url: &media_url,
            body: message.body.as_deref(),
        };

        let outcome = self.adapter.deliver(&request, claim_id).await?;
        Ok(Resolution::Delivered(outcome))
    }

    async fn delivery_target(
        &self,
        message: &MessageRef,
    ) -> Result<Option<(TenantCredentials, String)>, ReconcileError> {
        let Some(tenant) = self.store.tenant(&message.tenant_id).await? else {
            return Ok(None);
        };
        let Some(credentials) = tenant.delivery_credentials().cloned() else {
            return Ok(None);
        };
        let conversation = self
            .store
            .conversation(&message.tenant_id, &message.conversation_id)
            .await?;

        Ok(conversation
            .as_ref()
            .and_then(|c| c.recipient())
            .map(|recipient| (credentials, recipient.to_string())))
    }

    /// URL for the first attachment, re-signed when its object path is known
    async fn current_media_url(&self, message: &Message) -> Result<String, ReconcileError> {
        let attachment = message
            .media
            .as_ref()
            .and_then(|media| media.first())
            .ok_or_else(|| ReconcileError::MissingMedia(message.message_ref().to_string()))?;

        match &attachment.path {
            Some(path) => Ok(self
                .objects
                .signed_url(path, self.settings.url_ttl)
                .await?
                .url),
            None => Ok(attachment.url.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_mode_parse() {
        assert_eq!("full".parse::<ScanMode>(), Ok(ScanMode::Full));
        assert_eq!(" Index ".parse::<ScanMode>(), Ok(ScanMode::Index));
        assert!("sometimes".parse::<ScanMode>().is_err());
        assert_eq!(ScanMode::default(), ScanMode::Index);
    }

    #[test]
    fn test_report_counts_outcomes() {
        let mut report = PassReport::default();
        report.record(&Resolution::NotReady { attempts: 1 });
        report.record(&Resolution::Delivered(DeliveryOutcome::Delivered {
            gateway_message_id: "SM1".to_string(),
        }));
        report.record(&Resolution::Delivered(DeliveryOutcome::Failed(
            crate::domain::DeliveryError {
                code: None,
                message: "boom".to_string(),
            },
        )));
        report.record(&Resolution::ClaimLost);
        report.record(&Resolution::Rejected);

        assert_eq!(report.not_ready, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.expired, 0);
        assert_eq!(report.delivery_attempts(), 2);
        assert_eq!(report.claim_lost, 1);
    }
}
