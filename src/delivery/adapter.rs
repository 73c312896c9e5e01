//! Delivery adapter: sends a resolved voice note to the customer and records
//! the outcome in the conversation.
//!
//! Failures are terminal. The adapter never re-raises a gateway error and
//! never re-queues; it writes one attempt record and moves on.

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::{DeliveryOutcome, MessageRef, TenantCredentials};
use crate::store::{ConversationStore, StoreError};

use super::gateway::{MessagingGateway, OutboundMessage};

/// Legacy inline provenance tag written by older automation writers
pub const AUTOMATION_TAG: &str = "[AI]";

/// Channel scheme prefixed onto addresses (WhatsApp over the gateway)
pub const DEFAULT_CHANNEL_PREFIX: &str = "whatsapp:";

/// Everything needed to deliver one claimed message
#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    pub message: &'a MessageRef,
    pub credentials: &'a TenantCredentials,
    pub recipient: &'a str,
    pub media_url: &'a str,
    pub body: Option<&'a str>,
}

pub struct DeliveryAdapter {
    gateway: Arc<dyn MessagingGateway>,
    store: Arc<dyn ConversationStore>,
    channel_prefix: String,
}

impl DeliveryAdapter {
    pub fn new(gateway: Arc<dyn MessagingGateway>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            gateway,
            store,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Call the gateway once and classify the result. Records nothing.
    pub async fn send(
        &self,
        credentials: &TenantCredentials,
        recipient: &str,
        media_url: &str,
        body: Option<&str>,
    ) -> DeliveryOutcome {
        let outbound = OutboundMessage {
            to: normalize_channel_address(recipient, &self.channel_prefix),
            from: normalize_channel_address(&credentials.sender_address, &self.channel_prefix),
            media_urls: vec![media_url.to_string()],
            body: body.and_then(strip_provenance_markup),
        };

        match self.gateway.send(credentials, &outbound).await {
            Ok(receipt) => DeliveryOutcome::Delivered {
                gateway_message_id: receipt.message_id,
            },
            Err(e) => DeliveryOutcome::Failed(e.to_delivery_error()),
        }
    }

    /// Deliver a message this caller has claimed and record the outcome.
    ///
    /// Only store failures are returned; gateway failures become a
    /// `Failed` outcome with its attempt record.
    pub async fn deliver(
        &self,
        request: &DeliveryRequest<'_>,
        claim_id: &str,
    ) -> Result<DeliveryOutcome, StoreError> {
        let outcome = self
            .send(
                request.credentials,
                request.recipient,
                request.media_url,
                request.body,
            )
            .await;

        match &outcome {
            DeliveryOutcome::Delivered { gateway_message_id } => info!(
                message = %request.message,
                gateway = self.gateway.name(),
                gateway_message_id = %gateway_message_id,
                "Voice note delivered"
            ),
            DeliveryOutcome::Failed(error) => warn!(
                message = %request.message,
                gateway = self.gateway.name(),
                code = error.code.as_deref().unwrap_or("-"),
                "Voice note delivery failed: {}",
                error.message
            ),
        }

        self.store
            .complete_delivery(request.message, claim_id, &outcome)
            .await?;

        Ok(outcome)
    }
}

/// Outbound text for a stored body: drops the legacy inline provenance tag
/// and surrounding whitespace. Empty results mean "no text".
pub fn strip_provenance_markup(body: &str) -> Option<String> {
    let trimmed = body.trim();
    let stripped = trimmed
        .strip_prefix(AUTOMATION_TAG)
        .unwrap_or(trimmed)
        .trim();

    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Add the channel scheme to a bare address
pub fn normalize_channel_address(address: &str, prefix: &str) -> String {
    let address = address.trim();
    if prefix.is_empty() || address.starts_with(prefix) {
        address.to_string()
    } else {
        format!("{}{}", prefix, address)
    }
}
