//! Tenants, their gateway credentials, and conversations.

use serde::{Deserialize, Serialize};

/// An isolated organization owning conversations and delivery credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,

    /// Messaging gateway credentials (absent when delivery is not configured)
    pub credentials: Option<TenantCredentials>,
}

/// Per-tenant messaging gateway credentials (read-only to the pipeline)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantCredentials {
    pub account_id: String,
    pub auth_secret: String,

    /// Address messages are sent from
    pub sender_address: String,
}

impl TenantCredentials {
    /// All three fields must be present for the gateway to accept a call
    pub fn is_complete(&self) -> bool {
        !self.account_id.trim().is_empty()
            && !self.auth_secret.trim().is_empty()
            && !self.sender_address.trim().is_empty()
    }
}

// Keep the secret out of logs
impl std::fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("account_id", &self.account_id)
            .field("auth_secret", &"<redacted>")
            .field("sender_address", &self.sender_address)
            .finish()
    }
}

impl Tenant {
    /// Credentials usable for delivery, if any
    pub fn delivery_credentials(&self) -> Option<&TenantCredentials> {
        self.credentials.as_ref().filter(|c| c.is_complete())
    }
}

/// A message thread with one external counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub tenant_id: String,
    pub id: String,

    /// Customer address on the external channel, when known
    pub recipient_address: Option<String>,
}

impl Conversation {
    pub fn recipient(&self) -> Option<&str> {
        self.recipient_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(secret: &str) -> TenantCredentials {
        TenantCredentials {
            account_id: "AC123".to_string(),
            auth_secret: secret.to_string(),
            sender_address: "+15550001111".to_string(),
        }
    }

    #[test]
    fn test_incomplete_credentials_are_not_usable() {
        let tenant = Tenant {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            credentials: Some(creds("  ")),
        };
        assert!(tenant.delivery_credentials().is_none());

        let tenant = Tenant {
            credentials: Some(creds("s3cret")),
            ..tenant
        };
        assert!(tenant.delivery_credentials().is_some());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", creds("s3cret"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("AC123"));
    }

    #[test]
    fn test_blank_recipient_is_unknown() {
        let conversation = Conversation {
            tenant_id: "acme".to_string(),
            id: "t1".to_string(),
            recipient_address: Some("   ".to_string()),
        };
        assert_eq!(conversation.recipient(), None);
    }
}
