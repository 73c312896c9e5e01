//! Command-line interface for voxrelay.
//!
//! Provides commands for dispatching and watching uploads, running the
//! reconciler, seeding tenants/conversations/placeholders, and recording
//! gateway status callbacks.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, ResolvedConfig};
use crate::delivery::{DeliveryAdapter, TwilioGateway};
use crate::domain::{
    Conversation, DeliveryError, Message, MessageRole, Provenance, RawMediaObject, StorageEvent,
    Tenant, TenantCredentials,
};
use crate::reconcile::{Reconciler, RunGuard, ScanMode, Scheduler, TickOutcome};
use crate::storage::{content_type_for_path, LocalObjectStore, ObjectStore, UrlSigner};
use crate::store::{ConversationStore, SqliteConversationStore};
use crate::transcode::{DispatchOutcome, Dispatcher, FfmpegTranscoder, StorageWatcher};

/// voxrelay - voice-note transcoding and delivery pipeline
#[derive(Parser, Debug)]
#[command(name = "voxrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Handle one finalized upload (as a storage trigger would)
    Dispatch {
        /// Object path inside the bucket
        path: String,

        /// Content type (read from object metadata if not provided)
        #[arg(short, long)]
        content_type: Option<String>,
    },

    /// Watch the bucket and dispatch new uploads
    Watch {
        /// Dispatch every existing object once and exit
        #[arg(long)]
        once: bool,
    },

    /// Attach converted voice notes and deliver them
    Reconcile {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,

        /// Override the configured scan mode (full, index)
        #[arg(long)]
        scan_mode: Option<ScanMode>,

        /// Override the configured interval (seconds)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Create a voice-note placeholder message waiting on a raw upload
    Placeholder {
        tenant: String,
        conversation: String,

        /// Raw upload path, e.g. acme/voice-notes/note1.webm
        raw_path: String,

        /// Optional caption sent with the voice note
        #[arg(short, long)]
        body: Option<String>,

        #[arg(short, long, default_value = "agent")]
        sender: String,

        /// Mark the message as written by automation
        #[arg(long)]
        automation: bool,
    },

    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Manage conversations
    Conversation {
        #[command(subcommand)]
        command: ConversationCommands,
    },

    /// Record a delivery status reported by the gateway
    StatusCallback {
        /// Gateway message id (MessageSid)
        message_sid: String,

        /// Reported status (queued, sent, delivered, undelivered, failed, ...)
        status: String,

        #[arg(long)]
        error_code: Option<String>,

        #[arg(long)]
        error_message: Option<String>,
    },

    /// List placeholders still waiting for converted audio
    Pending,

    /// Check a signed media URL issued by this deployment
    VerifyUrl { url: String },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum TenantCommands {
    /// Add or update a tenant
    Add {
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// Gateway account id
        #[arg(long)]
        account_id: Option<String>,

        /// Gateway auth secret (or use VOXRELAY_AUTH_SECRET env)
        #[arg(long, env = "VOXRELAY_AUTH_SECRET", hide_env_values = true)]
        auth_secret: Option<String>,

        /// Address messages are sent from
        #[arg(long)]
        sender_address: Option<String>,
    },

    /// List tenants
    List,
}

#[derive(Subcommand, Debug)]
pub enum ConversationCommands {
    /// Add or update a conversation
    Add {
        tenant: String,
        id: String,

        /// Customer address on the external channel
        #[arg(long)]
        recipient: Option<String>,
    },

    /// Show a conversation's messages
    Show { tenant: String, id: String },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Dispatch { path, content_type } => {
                dispatch_one(cfg, &path, content_type).await
            }
            Commands::Watch { once } => watch(cfg, once).await,
            Commands::Reconcile {
                once,
                scan_mode,
                interval,
            } => reconcile(cfg, once, scan_mode, interval).await,
            Commands::Placeholder {
                tenant,
                conversation,
                raw_path,
                body,
                sender,
                automation,
            } => {
                create_placeholder(cfg, &tenant, &conversation, &raw_path, body, &sender, automation)
                    .await
            }
            Commands::Tenant { command } => execute_tenant(cfg, command).await,
            Commands::Conversation { command } => execute_conversation(cfg, command).await,
            Commands::StatusCallback {
                message_sid,
                status,
                error_code,
                error_message,
            } => status_callback(cfg, &message_sid, &status, error_code, error_message).await,
            Commands::Pending => list_pending(cfg).await,
            Commands::VerifyUrl { url } => verify_url(cfg, &url),
            Commands::Config => show_config(cfg),
        }
    }
}

fn open_store(cfg: &ResolvedConfig) -> Result<Arc<SqliteConversationStore>> {
    if let Some(parent) = cfg.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteConversationStore::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
    Ok(Arc::new(store))
}

fn build_signer(cfg: &ResolvedConfig) -> Result<UrlSigner> {
    UrlSigner::new(&cfg.signing.base_url, cfg.signing_secret()?)
        .context("Invalid signing base URL")
}

async fn open_objects(cfg: &ResolvedConfig) -> Result<Arc<LocalObjectStore>> {
    let signer = build_signer(cfg)?;
    let objects = LocalObjectStore::open(&cfg.bucket_name, &cfg.bucket_root, signer)
        .await
        .with_context(|| format!("Failed to open bucket: {}", cfg.bucket_root.display()))?;
    Ok(Arc::new(objects))
}

fn build_dispatcher(cfg: &ResolvedConfig, objects: Arc<LocalObjectStore>) -> Dispatcher {
    let transcoder = FfmpegTranscoder::with_binary_path(&cfg.transcode.ffmpeg_path)
        .with_timeout(cfg.transcode_timeout());
    Dispatcher::new(objects, Arc::new(transcoder)).with_scratch_root(cfg.scratch_dir())
}

async fn build_reconciler(cfg: &ResolvedConfig, scan_mode: Option<ScanMode>) -> Result<Reconciler> {
    let store: Arc<dyn ConversationStore> = open_store(cfg)?;
    let objects: Arc<dyn ObjectStore> = open_objects(cfg).await?;

    let gateway = TwilioGateway::new(&cfg.gateway.api_base, cfg.gateway_timeout())
        .context("Failed to build gateway client")?;
    let adapter = DeliveryAdapter::new(Arc::new(gateway), store.clone())
        .with_channel_prefix(&cfg.gateway.channel_prefix);

    let mut settings = cfg.reconcile_settings();
    if let Some(mode) = scan_mode {
        settings.scan_mode = mode;
    }

    Ok(Reconciler::new(store, objects, adapter, settings))
}

fn describe(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Skipped(reason) => format!("skipped ({:?})", reason),
        DispatchOutcome::Copied(c) => format!("copied → {}", c.path),
        DispatchOutcome::Transcoded(c) => format!("transcoded → {}", c.path),
        DispatchOutcome::Failed(e) => format!("failed: {}", e),
    }
}

async fn dispatch_one(cfg: &ResolvedConfig, path: &str, content_type: Option<String>) -> Result<()> {
    let objects = open_objects(cfg).await?;

    let content_type = match content_type {
        Some(ct) => ct,
        None => objects
            .metadata(path)
            .await
            .with_context(|| format!("Failed to read metadata for {}", path))?
            .content_type,
    };

    let dispatcher = build_dispatcher(cfg, objects.clone());
    let event = StorageEvent::new(objects.bucket(), path, content_type);
    let outcome = dispatcher.dispatch(&event).await;

    println!("{}: {}", path, describe(&outcome));

    if let DispatchOutcome::Failed(_) = outcome {
        std::process::exit(1);
    }
    Ok(())
}

async fn watch(cfg: &ResolvedConfig, once: bool) -> Result<()> {
    let objects = open_objects(cfg).await?;
    let dispatcher = Arc::new(build_dispatcher(cfg, objects.clone()));
    let watcher = Arc::new(StorageWatcher::new(objects, dispatcher));

    if once {
        println!("Scanning once: {}", cfg.bucket_root.display());
        let result = watcher.scan_once().await?;
        println!(
            "Dispatched {} objects: {} converted, {} skipped, {} failed",
            result.dispatched, result.converted, result.skipped, result.failed
        );
        return Ok(());
    }

    println!("Watching: {}", cfg.bucket_root.display());
    println!("Press Ctrl+C to stop");

    let (mut outcome_rx, handle) = watcher.watch().await?;

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(());
    });

    loop {
        tokio::select! {
            Some(outcome) = outcome_rx.recv() => {
                if !matches!(outcome, DispatchOutcome::Skipped(_)) {
                    println!("{}", describe(&outcome));
                }
            }
            _ = &mut stop_rx => {
                println!();
                println!("Stopping watcher...");
                handle.stop().await?;
                break;
            }
        }
    }

    Ok(())
}

async fn reconcile(
    cfg: &ResolvedConfig,
    once: bool,
    scan_mode: Option<ScanMode>,
    interval: Option<u64>,
) -> Result<()> {
    let reconciler = Arc::new(build_reconciler(cfg, scan_mode).await?);
    let interval = interval
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| cfg.reconcile_interval());
    let scheduler = Scheduler::new(reconciler, RunGuard::in_home(&cfg.home)).with_interval(interval);

    if once {
        match scheduler.tick().await? {
            TickOutcome::Ran(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            TickOutcome::Skipped => {
                println!("Another reconciliation pass is running; skipped");
            }
        }
        return Ok(());
    }

    println!(
        "Reconciling every {}s (Ctrl+C to stop)",
        scheduler.interval().as_secs()
    );
    let handle = Arc::new(scheduler).spawn();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    println!();
    println!("Stopping scheduler...");
    handle.stop().await
}

async fn create_placeholder(
    cfg: &ResolvedConfig,
    tenant: &str,
    conversation: &str,
    raw_path: &str,
    body: Option<String>,
    sender: &str,
    automation: bool,
) -> Result<()> {
    // Reject paths the reconciler could never map
    let raw = RawMediaObject::new(tenant, conversation, raw_path, content_type_for_path(raw_path))
        .with_context(|| format!("Not a raw voice-note path for {}: {}", tenant, raw_path))?;

    let store = open_store(cfg)?;
    store
        .conversation(tenant, conversation)
        .await?
        .with_context(|| format!("Unknown conversation {}/{}", tenant, conversation))?;

    let provenance = if automation {
        Provenance::Automation
    } else {
        Provenance::Human
    };
    let message = Message::for_voice_note(&raw, MessageRole::Agent, sender, body)
        .with_provenance(provenance);

    store.insert_message(&message).await?;
    println!("{}", message.id);
    Ok(())
}

async fn execute_tenant(cfg: &ResolvedConfig, command: TenantCommands) -> Result<()> {
    let store = open_store(cfg)?;

    match command {
        TenantCommands::Add {
            id,
            name,
            account_id,
            auth_secret,
            sender_address,
        } => {
            let credentials = match (account_id, auth_secret, sender_address) {
                (Some(account_id), Some(auth_secret), Some(sender_address)) => {
                    Some(TenantCredentials {
                        account_id,
                        auth_secret,
                        sender_address,
                    })
                }
                (None, None, None) => None,
                _ => anyhow::bail!(
                    "--account-id, --auth-secret and --sender-address must be given together"
                ),
            };

            let tenant = Tenant {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                credentials,
            };
            store.upsert_tenant(&tenant)?;
            println!(
                "Tenant {} saved ({})",
                tenant.id,
                if tenant.delivery_credentials().is_some() {
                    "delivery enabled"
                } else {
                    "no delivery credentials"
                }
            );
        }
        TenantCommands::List => {
            let tenants = store.list_tenants().await?;
            if tenants.is_empty() {
                println!("No tenants");
                return Ok(());
            }

            println!("{:<20} {:<30} {:<10}", "ID", "NAME", "DELIVERY");
            println!("{}", "-".repeat(62));
            for tenant in tenants {
                let delivery = if tenant.delivery_credentials().is_some() {
                    "yes"
                } else {
                    "no"
                };
                println!("{:<20} {:<30} {:<10}", tenant.id, tenant.name, delivery);
            }
        }
    }

    Ok(())
}

async fn execute_conversation(cfg: &ResolvedConfig, command: ConversationCommands) -> Result<()> {
    let store = open_store(cfg)?;

    match command {
        ConversationCommands::Add {
            tenant,
            id,
            recipient,
        } => {
            store
                .tenant(&tenant)
                .await?
                .with_context(|| format!("Unknown tenant: {}", tenant))?;
            store.upsert_conversation(&Conversation {
                tenant_id: tenant.clone(),
                id: id.clone(),
                recipient_address: recipient,
            })?;
            println!("Conversation {}/{} saved", tenant, id);
        }
        ConversationCommands::Show { tenant, id } => {
            let messages = store.list_messages(&tenant, &id).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
    }

    Ok(())
}

async fn status_callback(
    cfg: &ResolvedConfig,
    message_sid: &str,
    status: &str,
    error_code: Option<String>,
    error_message: Option<String>,
) -> Result<()> {
    let error = match (error_code, error_message) {
        (None, None) => None,
        (code, message) => Some(DeliveryError {
            message: message.unwrap_or_else(|| "Unknown error".to_string()),
            code,
        }),
    };

    let store = open_store(cfg)?;
    if store
        .apply_delivery_status(message_sid, status, error.as_ref())
        .await?
    {
        println!("{} → {}", message_sid, status);
    } else {
        tracing::warn!(message_sid, status, "Status callback for unknown message");
        println!("No message with gateway id {}", message_sid);
    }
    Ok(())
}

async fn list_pending(cfg: &ResolvedConfig) -> Result<()> {
    let store = open_store(cfg)?;
    let pending = store.pending_index().await?;

    if pending.is_empty() {
        println!("No pending voice notes");
        return Ok(());
    }

    println!("{:<50} {:<8} {:<25} {}", "MESSAGE", "TRIES", "SINCE", "RAW PATH");
    println!("{}", "-".repeat(110));
    for item in pending {
        println!(
            "{:<50} {:<8} {:<25} {}",
            item.message.to_string(),
            item.attempts,
            item.pending_since.format("%Y-%m-%d %H:%M:%S"),
            item.pending_media_path
        );
    }
    Ok(())
}

fn verify_url(cfg: &ResolvedConfig, url: &str) -> Result<()> {
    let expires_at = build_signer(cfg)?
        .verify(url)
        .with_context(|| format!("Rejected media URL: {}", url))?;
    println!("Valid until {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("voxrelay configuration");
    println!("======================");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Bucket:    {} ({})", cfg.bucket_root.display(), cfg.bucket_name);
    println!("  Database:  {}", cfg.database.display());
    println!("  Lock file: {}", RunGuard::in_home(&cfg.home).lock_path().display());
    println!();
    println!("Transcode:");
    println!("  ffmpeg:    {}", cfg.transcode.ffmpeg_path);
    println!("  Timeout:   {}s", cfg.transcode.timeout_seconds);
    println!();
    println!("Reconcile:");
    println!("  Interval:     {}s", cfg.reconcile.interval_seconds);
    println!("  Scan mode:    {}", cfg.reconcile.scan_mode.as_str());
    println!("  Max attempts: {}", cfg.reconcile.max_attempts);
    println!("  Max age:      {}s", cfg.reconcile.max_age_seconds);
    println!("  URL TTL:      {}s", cfg.reconcile.url_ttl_seconds);
    println!();
    println!("Gateway:");
    println!("  API base:  {}", cfg.gateway.api_base);
    println!("  Channel:   {}", cfg.gateway.channel_prefix);
    println!();
    println!("Signing:");
    println!("  Base URL:  {}", cfg.signing.base_url);
    println!(
        "  Secret:    {}",
        if cfg.signing.secret.is_some() {
            "(configured)"
        } else {
            "(generated under home)"
        }
    );

    Ok(())
}
