//! Transcode-on-upload dispatcher.
//!
//! Invoked once per finalized storage object. Cheap guards filter out
//! everything that is not a raw voice note; canonical uploads are copied,
//! everything else goes through the transcoder via a scratch directory.
//!
//! The dispatcher never retries. A failed transcode simply leaves no
//! converted artifact, and the reconciler keeps looking for it until its
//! retry ceiling is reached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument};

use crate::domain::{ConvertedMediaObject, StorageEvent};
use crate::storage::{ObjectStore, ObjectStoreError, PathMapper, VoiceNotePath};

use super::transcoder::{base_content_type, TranscodeTarget, Transcoder};

/// Why an event was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingPath,
    NotAudio,
    OutsideVoiceNotes,

    /// The object is itself a converted artifact (writing one re-triggers us)
    AlreadyConverted,

    /// A converted artifact for this `(tenant, stem)` already exists; the
    /// first one written is kept
    ArtifactExists,
}

/// Result of handling one storage event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),

    /// Already canonical; copied verbatim
    Copied(ConvertedMediaObject),

    /// Re-encoded by the transcoder
    Transcoded(ConvertedMediaObject),

    /// Caught failure; no artifact was produced
    Failed(String),
}

impl DispatchOutcome {
    /// Whether a converted artifact exists because of this dispatch
    pub fn produced_artifact(&self) -> bool {
        matches!(self, Self::Copied(_) | Self::Transcoded(_))
    }
}

/// Routes finalized uploads to copy or transcode
pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    mapper: PathMapper,
    target: TranscodeTarget,

    /// Parent for per-invocation scratch dirs (system temp dir when `None`)
    scratch_root: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ObjectStore>, transcoder: Arc<dyn Transcoder>) -> Self {
        let target = TranscodeTarget::canonical();
        Self {
            store,
            transcoder,
            mapper: PathMapper::new(target.extension.clone()),
            target,
            scratch_root: None,
        }
    }

    pub fn with_target(mut self, target: TranscodeTarget) -> Self {
        self.mapper = PathMapper::new(target.extension.clone());
        self.target = target;
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(scratch_root.into());
        self
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Guard sequence; `Err` means exit with no side effect
    fn check_guards<'a>(&self, event: &'a StorageEvent) -> Result<(&'a str, String), SkipReason> {
        let path = match event.path.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => return Err(SkipReason::MissingPath),
        };

        let content_type = base_content_type(event.content_type.as_deref().unwrap_or_default());
        if !content_type.starts_with("audio/") {
            return Err(SkipReason::NotAudio);
        }

        match VoiceNotePath::parse(path) {
            None => Err(SkipReason::OutsideVoiceNotes),
            Some(p) if p.is_converted() => Err(SkipReason::AlreadyConverted),
            Some(_) => Ok((path, content_type)),
        }
    }

    /// Handle one finalized object. Never returns an error: failures are
    /// logged and reported as [`DispatchOutcome::Failed`].
    #[instrument(skip(self, event), fields(bucket = %event.bucket, path = ?event.path))]
    pub async fn dispatch(&self, event: &StorageEvent) -> DispatchOutcome {
        let (path, content_type) = match self.check_guards(event) {
            Ok(v) => v,
            Err(reason) => {
                debug!(?reason, "Ignoring storage event");
                return DispatchOutcome::Skipped(reason);
            }
        };

        let converted_path = match self.mapper.converted_path(path) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Path mapper rejected voice note");
                return DispatchOutcome::Failed(e.to_string());
            }
        };

        let converted = ConvertedMediaObject {
            source_path: path.to_string(),
            path: converted_path,
            content_type: self.target.content_type.clone(),
        };

        match self.store.exists(&converted.path).await {
            Ok(false) => {}
            Ok(true) => return self.keep_existing(&converted),
            Err(e) => {
                error!(error = %e, "Failed to check for converted voice note");
                return DispatchOutcome::Failed(e.to_string());
            }
        }

        if self.target.is_canonical(&content_type) {
            return match self.store.copy(path, &converted.path).await {
                Ok(bytes) => {
                    info!(to = %converted.path, bytes, "Voice note already canonical, copied");
                    DispatchOutcome::Copied(converted)
                }
                Err(ObjectStoreError::AlreadyExists(_)) => self.keep_existing(&converted),
                Err(e) => {
                    error!(error = %e, "Failed to copy canonical voice note");
                    DispatchOutcome::Failed(e.to_string())
                }
            };
        }

        match self.transcode_into(path, &converted).await {
            Ok(true) => DispatchOutcome::Transcoded(converted),
            Ok(false) => self.keep_existing(&converted),
            Err(e) => {
                error!(error = %e, "Error converting voice note");
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    fn keep_existing(&self, converted: &ConvertedMediaObject) -> DispatchOutcome {
        info!(
            to = %converted.path,
            from = %converted.source_path,
            "Converted voice note already exists, keeping it"
        );
        DispatchOutcome::Skipped(SkipReason::ArtifactExists)
    }

    /// Download → transcode → upload. Returns `false` if another writer
    /// published the artifact first. The scratch directory is removed when
    /// `scratch` drops, on success and on every error path.
    async fn transcode_into(
        &self,
        path: &str,
        converted: &ConvertedMediaObject,
    ) -> anyhow::Result<bool> {
        let scratch = match &self.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                tempfile::Builder::new().prefix("voxrelay-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("voxrelay-").tempdir()?,
        };

        let file_name = path.rsplit('/').next().unwrap_or("input");
        let input = scratch.path().join(format!("in-{}", file_name));
        let output = scratch
            .path()
            .join(format!("out.{}", self.target.extension));

        let started = Instant::now();
        let downloaded = self.store.download(path, &input).await?;
        debug!(bytes = downloaded, scratch = %scratch.path().display(), "Downloaded raw voice note");

        self.transcoder
            .transcode(&input, &output, &self.target)
            .await?;

        let uploaded = match self
            .store
            .upload(&output, &converted.path, &self.target.content_type)
            .await
        {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::AlreadyExists(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        info!(
            to = %converted.path,
            transcoder = self.transcoder.name(),
            bytes = uploaded,
            duration_ms = started.elapsed().as_millis() as u64,
            "Voice note converted"
        );

        Ok(true)
    }
}
