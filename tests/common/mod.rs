//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use voxrelay::delivery::{
    DeliveryAdapter, GatewayError, GatewayReceipt, MessagingGateway, OutboundMessage,
};
use voxrelay::domain::{
    Conversation, Message, MessageRole, RawMediaObject, Tenant, TenantCredentials,
};
use voxrelay::reconcile::{ReconcileSettings, Reconciler};
use voxrelay::storage::{LocalObjectStore, PathMapper, UrlSigner};
use voxrelay::store::{ConversationStore, SqliteConversationStore};
use voxrelay::transcode::{TranscodeError, TranscodeTarget, Transcoder};

pub const TENANT: &str = "acme";
pub const CONVERSATION: &str = "t1";
pub const RECIPIENT: &str = "+15551234567";

/// Gateway double counting every send
#[derive(Default)]
pub struct MockGateway {
    calls: AtomicUsize,
    sent: Mutex<Vec<OutboundMessage>>,
    rejection: Option<(Option<String>, String)>,
    delay: Option<Duration>,
}

impl MockGateway {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn rejecting(code: &str, message: &str) -> Self {
        Self {
            rejection: Some((Some(code.to_string()), message.to_string())),
            ..Self::default()
        }
    }

    /// Hold each send open so overlapping passes interleave
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        _credentials: &TenantCredentials,
        message: &OutboundMessage,
    ) -> Result<GatewayReceipt, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(message.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.rejection {
            Some((code, message)) => Err(GatewayError::Rejected {
                code: code.clone(),
                message: message.clone(),
                status: 400,
            }),
            None => Ok(GatewayReceipt {
                message_id: format!("SM{:04}", n),
                status: Some("queued".to_string()),
            }),
        }
    }
}

/// Writes `OggS` + input bytes; counts invocations
#[derive(Default)]
pub struct PrefixTranscoder {
    calls: AtomicUsize,
}

impl PrefixTranscoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for PrefixTranscoder {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        _target: &TranscodeTarget,
    ) -> Result<(), TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut bytes = b"OggS".to_vec();
        bytes.extend(tokio::fs::read(input).await?);
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }
}

/// Always fails like a crashing encoder (after leaving a partial output)
pub struct FailingTranscoder;

#[async_trait]
impl Transcoder for FailingTranscoder {
    fn name(&self) -> &str {
        "failing"
    }

    async fn transcode(
        &self,
        _input: &Path,
        output: &Path,
        _target: &TranscodeTarget,
    ) -> Result<(), TranscodeError> {
        tokio::fs::write(output, b"partial").await?;
        Err(TranscodeError::Failed {
            exit_code: 1,
            stderr: "Invalid data found when processing input".to_string(),
        })
    }
}

pub fn signer() -> UrlSigner {
    UrlSigner::new("https://media.example.test/v", "test-secret").unwrap()
}

pub async fn open_bucket(temp: &TempDir) -> Arc<LocalObjectStore> {
    let signer = signer();
    Arc::new(
        LocalObjectStore::open("voice-media", temp.path().join("bucket"), signer)
            .await
            .unwrap(),
    )
}

/// Store + bucket + gateway wired the way the CLI wires them
pub struct Harness {
    pub store: Arc<SqliteConversationStore>,
    pub objects: Arc<LocalObjectStore>,
    pub gateway: Arc<MockGateway>,
    pub temp: TempDir,
}

impl Harness {
    pub async fn new(gateway: MockGateway) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteConversationStore::open(temp.path().join("voxrelay.db")).unwrap());
        let objects = open_bucket(&temp).await;

        Self {
            store,
            objects,
            gateway: Arc::new(gateway),
            temp,
        }
    }

    pub fn seed_tenant(&self, id: &str, with_credentials: bool) {
        let credentials = with_credentials.then(|| TenantCredentials {
            account_id: "AC0001".to_string(),
            auth_secret: "secret".to_string(),
            sender_address: "+15550000000".to_string(),
        });
        self.store
            .upsert_tenant(&Tenant {
                id: id.to_string(),
                name: id.to_uppercase(),
                credentials,
            })
            .unwrap();
    }

    pub fn seed_conversation(&self, tenant: &str, id: &str, recipient: Option<&str>) {
        self.store
            .upsert_conversation(&Conversation {
                tenant_id: tenant.to_string(),
                id: id.to_string(),
                recipient_address: recipient.map(str::to_string),
            })
            .unwrap();
    }

    /// Tenant with credentials and one conversation with a recipient
    pub fn seed_deliverable(&self) {
        self.seed_tenant(TENANT, true);
        self.seed_conversation(TENANT, CONVERSATION, Some(RECIPIENT));
    }

    pub async fn placeholder(&self, raw_path: &str, body: Option<&str>) -> Message {
        let raw = RawMediaObject::new(TENANT, CONVERSATION, raw_path, "audio/webm").unwrap();
        let message = Message::for_voice_note(&raw, MessageRole::Agent, "agent", body.map(str::to_string));
        self.store.insert_message(&message).await.unwrap();
        message
    }

    /// Simulate the transcoder having produced the artifact for `raw_path`
    pub async fn put_converted(&self, raw_path: &str) {
        let converted = PathMapper::default().converted_path(raw_path).unwrap();
        self.objects
            .put_bytes(&converted, b"OggS-converted", "audio/ogg")
            .await
            .unwrap();
    }

    pub fn adapter(&self) -> DeliveryAdapter {
        DeliveryAdapter::new(self.gateway.clone(), self.store.clone())
    }

    pub fn reconciler(&self, settings: ReconcileSettings) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.objects.clone(),
            self.adapter(),
            settings,
        )
    }

    pub async fn reload(&self, message: &Message) -> Message {
        self.store
            .message(&message.message_ref())
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn system_messages(&self) -> Vec<Message> {
        self.store
            .list_messages(TENANT, CONVERSATION)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.role == MessageRole::System)
            .collect()
    }
}
