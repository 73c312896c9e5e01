//! Messaging gateway client.
//!
//! Sends one outbound media message through a Twilio-style REST API:
//! form-encoded POST to `{api_base}/2010-04-01/Accounts/{account}/Messages.json`
//! with HTTP Basic auth. The call is not idempotent; callers must hold a
//! delivery claim before invoking it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{DeliveryError, TenantCredentials};

pub const DEFAULT_API_BASE: &str = "https://api.twilio.com";
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the messaging gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway rejected message (HTTP {status}): {message}")]
    Rejected {
        code: Option<String>,
        message: String,
        status: u16,
    },

    #[error("Unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Gateway error code, when the gateway supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Error as recorded on the message and in the attempt record
    pub fn to_delivery_error(&self) -> DeliveryError {
        match self {
            Self::Rejected { code, message, .. } => DeliveryError {
                code: code.clone(),
                message: message.clone(),
            },
            other => DeliveryError {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

/// One outbound channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub from: String,
    pub media_urls: Vec<String>,
    pub body: Option<String>,
}

/// Accepted send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub message_id: String,

    /// Initial status reported by the gateway (e.g. `queued`)
    pub status: Option<String>,
}

/// Outbound messaging channel
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        credentials: &TenantCredentials,
        message: &OutboundMessage,
    ) -> Result<GatewayReceipt, GatewayError>;
}

/// Twilio-compatible REST gateway
pub struct TwilioGateway {
    api_base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

impl TwilioGateway {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn messages_url(&self, account_id: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, account_id
        )
    }
}

/// Form fields for one send; `MediaUrl` repeats per attachment
fn form_fields(message: &OutboundMessage) -> Vec<(&'static str, String)> {
    let mut fields = vec![("To", message.to.clone()), ("From", message.from.clone())];
    fields.extend(message.media_urls.iter().map(|url| ("MediaUrl", url.clone())));
    if let Some(body) = &message.body {
        fields.push(("Body", body.clone()));
    }
    fields
}

/// Build a `Rejected` error from a non-success response body
fn rejection(status: u16, body: &str) -> GatewayError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => GatewayError::Rejected {
            code: parsed.code.map(|c| match c {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            message: parsed
                .message
                .unwrap_or_else(|| format!("HTTP {}", status)),
            status,
        },
        Err(_) => GatewayError::Rejected {
            code: None,
            message: if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                body.trim().chars().take(500).collect()
            },
            status,
        },
    }
}

#[async_trait]
impl MessagingGateway for TwilioGateway {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send(
        &self,
        credentials: &TenantCredentials,
        message: &OutboundMessage,
    ) -> Result<GatewayReceipt, GatewayError> {
        let response = self
            .client
            .post(self.messages_url(&credentials.account_id))
            .basic_auth(&credentials.account_id, Some(&credentials.auth_secret))
            .form(&form_fields(message))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(rejection(status.as_u16(), &body));
        }

        let resource: MessageResource =
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(GatewayReceipt {
            message_id: resource.sid,
            status: resource.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_url() {
        let gateway = TwilioGateway::new("https://api.example.test/", DEFAULT_GATEWAY_TIMEOUT).unwrap();
        assert_eq!(
            gateway.messages_url("AC123"),
            "https://api.example.test/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn test_form_fields_repeat_media_and_skip_empty_body() {
        let message = OutboundMessage {
            to: "whatsapp:+15551234567".to_string(),
            from: "whatsapp:+15550000000".to_string(),
            media_urls: vec!["https://m/1.ogg".to_string()],
            body: None,
        };

        let fields = form_fields(&message);
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(&("MediaUrl", "https://m/1.ogg".to_string())));
        assert!(!fields.iter().any(|(k, _)| *k == "Body"));
    }

    #[test]
    fn test_rejection_parses_numeric_code() {
        let err = rejection(
            400,
            r#"{"code": 63016, "message": "Outside the allowed window", "status": 400}"#,
        );
        assert_eq!(err.code(), Some("63016"));

        let recorded = err.to_delivery_error();
        assert_eq!(recorded.message, "Outside the allowed window");
    }

    #[test]
    fn test_rejection_without_json_body() {
        let err = rejection(502, "");
        assert_eq!(err.code(), None);
        assert!(err.to_string().contains("HTTP 502"));
    }
}
