//! Object storage backend.
//!
//! The pipeline only needs a handful of operations from storage: existence
//! checks, download/upload through scratch files, server-side copy, and
//! signed URLs. `LocalObjectStore` keeps a bucket on the local filesystem with
//! content-type metadata in a hidden sidecar tree.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;

use super::paths::extension_of;
use super::signing::{SignedUrl, UrlSigner};

/// Hidden directory (under the bucket root) holding metadata sidecars
pub const METADATA_DIR: &str = ".meta";

/// Errors from the storage backend
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Metadata recorded alongside an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub content_type: String,
    pub size: u64,
}

/// Storage operations used by the dispatcher and the reconciler
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name (for logs and storage events)
    fn bucket(&self) -> &str;

    async fn exists(&self, path: &str) -> Result<bool, ObjectStoreError>;

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, ObjectStoreError>;

    /// Copy an object to a local file, returning bytes written
    async fn download(&self, path: &str, dest: &Path) -> Result<u64, ObjectStoreError>;

    /// Store a local file as a new object with explicit content type.
    /// Never replaces an existing object: fails with `AlreadyExists`.
    async fn upload(
        &self,
        src: &Path,
        path: &str,
        content_type: &str,
    ) -> Result<u64, ObjectStoreError>;

    /// Server-side copy, preserving content type; same no-clobber rule as `upload`
    async fn copy(&self, from: &str, to: &str) -> Result<u64, ObjectStoreError>;

    /// Time-limited access URL for an object
    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, ObjectStoreError>;
}

/// Filesystem-backed bucket
pub struct LocalObjectStore {
    bucket: String,
    root: PathBuf,
    signer: UrlSigner,
}

impl LocalObjectStore {
    /// Open (creating if needed) a bucket rooted at `root`
    pub async fn open(
        bucket: impl Into<String>,
        root: impl Into<PathBuf>,
        signer: UrlSigner,
    ) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(METADATA_DIR)).await?;

        Ok(Self {
            bucket: bucket.into(),
            root,
            signer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of an object
    pub fn object_path(&self, path: &str) -> Result<PathBuf, ObjectStoreError> {
        Ok(self.root.join(validate_key(path)?))
    }

    fn metadata_path(&self, path: &str) -> Result<PathBuf, ObjectStoreError> {
        let key = validate_key(path)?;
        Ok(self
            .root
            .join(METADATA_DIR)
            .join(format!("{}.json", key.display())))
    }

    /// Object key for a filesystem location inside the bucket
    pub fn key_for(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str()?;
                    if part.starts_with('.') {
                        return None;
                    }
                    parts.push(part);
                }
                _ => return None,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    async fn write_metadata(&self, path: &str, meta: &ObjectMetadata) -> Result<(), ObjectStoreError> {
        let meta_path = self.metadata_path(path)?;
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&meta_path, serde_json::to_vec(meta)?).await?;
        Ok(())
    }

    /// Write bytes directly, replacing any existing object (raw uploads, tests)
    pub async fn put_bytes(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<u64, ObjectStoreError> {
        let dest = self.object_path(path)?;
        let staging = staging_file(&dest).await?;
        // Metadata first so a watcher never sees an object without it
        self.write_metadata(
            path,
            &ObjectMetadata {
                content_type: content_type.to_string(),
                size: bytes.len() as u64,
            },
        )
        .await?;
        fs::write(staging.path(), bytes).await?;
        staging.persist(&dest).map_err(|e| e.error)?;
        Ok(bytes.len() as u64)
    }

    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let src = self.object_path(path)?;
        match fs::read(&src).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, path: &str) -> Result<bool, ObjectStoreError> {
        let file = self.object_path(path)?;
        match fs::metadata(&file).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, ObjectStoreError> {
        let file = self.object_path(path)?;
        let size = match fs::metadata(&file).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let meta_path = self.metadata_path(path)?;
        match fs::read(&meta_path).await {
            Ok(bytes) => {
                let mut meta: ObjectMetadata = serde_json::from_slice(&bytes)?;
                meta.size = size;
                Ok(meta)
            }
            // Objects dropped in without a sidecar get a type from their extension
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObjectMetadata {
                content_type: content_type_for_path(path).to_string(),
                size,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, path: &str, dest: &Path) -> Result<u64, ObjectStoreError> {
        let src = self.object_path(path)?;
        match fs::copy(&src, dest).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        src: &Path,
        path: &str,
        content_type: &str,
    ) -> Result<u64, ObjectStoreError> {
        let dest = self.object_path(path)?;
        if fs::try_exists(&dest).await? {
            return Err(ObjectStoreError::AlreadyExists(path.to_string()));
        }

        let staging = staging_file(&dest).await?;
        let size = fs::copy(src, staging.path()).await?;

        // Link into place only if nothing is there; the loser's staging file
        // is removed on drop
        match staging.persist_noclobber(&dest) {
            Ok(_) => {}
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ObjectStoreError::AlreadyExists(path.to_string()))
            }
            Err(e) => return Err(e.error.into()),
        }

        self.write_metadata(
            path,
            &ObjectMetadata {
                content_type: content_type.to_string(),
                size,
            },
        )
        .await?;

        Ok(size)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<u64, ObjectStoreError> {
        let meta = self.metadata(from).await?;
        let src = self.object_path(from)?;
        self.upload(&src, to, &meta.content_type).await
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, ObjectStoreError> {
        validate_key(path)?;
        Ok(self.signer.sign(path, ttl))
    }
}

/// Reject keys that could escape the bucket or collide with sidecars
fn validate_key(path: &str) -> Result<PathBuf, ObjectStoreError> {
    let mut key = PathBuf::new();
    for part in path.split('/') {
        if part.is_empty() || part == "." || part == ".." || part == METADATA_DIR {
            return Err(ObjectStoreError::InvalidPath(path.to_string()));
        }
        key.push(part);
    }
    if key.as_os_str().is_empty() {
        return Err(ObjectStoreError::InvalidPath(path.to_string()));
    }
    Ok(key)
}

/// Hidden sibling, unique per writer, so objects appear atomically
async fn staging_file(dest: &Path) -> Result<NamedTempFile, ObjectStoreError> {
    let parent = dest
        .parent()
        .ok_or_else(|| ObjectStoreError::InvalidPath(dest.display().to_string()))?;
    fs::create_dir_all(parent).await?;
    Ok(tempfile::Builder::new()
        .prefix(".")
        .suffix(".partial")
        .tempfile_in(parent)?)
}

/// Best-effort content type from a path's extension
pub fn content_type_for_path(path: &str) -> &'static str {
    match extension_of(path).as_deref() {
        Some("ogg") | Some("opus") | Some("oga") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("aac") => "audio/aac",
        Some("amr") => "audio/amr",
        Some("3gp") => "audio/3gpp",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (LocalObjectStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let signer = UrlSigner::new("https://media.test/", "secret").unwrap();
        let store = LocalObjectStore::open("test-bucket", temp.path(), signer)
            .await
            .unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_put_and_read_back() {
        let (store, _temp) = create_test_store().await;

        store
            .put_bytes("acme/voice-notes/n.webm", b"webm-bytes", "audio/webm")
            .await
            .unwrap();

        assert!(store.exists("acme/voice-notes/n.webm").await.unwrap());
        assert!(!store.exists("acme/voice-notes/other.webm").await.unwrap());

        let meta = store.metadata("acme/voice-notes/n.webm").await.unwrap();
        assert_eq!(meta.content_type, "audio/webm");
        assert_eq!(meta.size, 10);
    }

    #[tokio::test]
    async fn test_copy_preserves_bytes_and_type() {
        let (store, _temp) = create_test_store().await;

        store
            .put_bytes("acme/voice-notes/n.ogg", b"OggS-data", "audio/ogg")
            .await
            .unwrap();
        store
            .copy("acme/voice-notes/n.ogg", "acme/voice-notes/converted/n.ogg")
            .await
            .unwrap();

        let copied = store
            .get_bytes("acme/voice-notes/converted/n.ogg")
            .await
            .unwrap();
        assert_eq!(copied, b"OggS-data");
        let meta = store
            .metadata("acme/voice-notes/converted/n.ogg")
            .await
            .unwrap();
        assert_eq!(meta.content_type, "audio/ogg");
    }

    #[tokio::test]
    async fn test_upload_never_replaces_an_object() {
        let (store, temp) = create_test_store().await;
        let first = temp.path().join("first.ogg");
        let second = temp.path().join("second.ogg");
        std::fs::write(&first, b"FIRST").unwrap();
        std::fs::write(&second, b"SECOND").unwrap();

        let dest = "acme/voice-notes/converted/note.ogg";
        store.upload(&first, dest, "audio/ogg").await.unwrap();
        assert!(matches!(
            store.upload(&second, dest, "audio/ogg").await,
            Err(ObjectStoreError::AlreadyExists(_))
        ));
        assert_eq!(store.get_bytes(dest).await.unwrap(), b"FIRST");

        // No staging files left behind
        let names: Vec<_> = std::fs::read_dir(temp.path().join("acme/voice-notes/converted"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["note.ogg".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_have_one_winner() {
        let (store, temp) = create_test_store().await;
        let store = std::sync::Arc::new(store);
        let dest = "acme/voice-notes/converted/race.ogg";

        let mut tasks = Vec::new();
        for i in 0..8 {
            let src = temp.path().join(format!("src-{}.ogg", i));
            std::fs::write(&src, format!("writer {}", i).repeat(1000)).unwrap();
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.upload(&src, dest, "audio/ogg").await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(ObjectStoreError::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(winners, 1);

        // Content is exactly one writer's bytes
        let content = String::from_utf8(store.get_bytes(dest).await.unwrap()).unwrap();
        let writer = &content[..8];
        assert_eq!(content, writer.repeat(1000));
    }

    #[tokio::test]
    async fn test_missing_sidecar_falls_back_to_extension() {
        let (store, temp) = create_test_store().await;

        let dir = temp.path().join("acme/voice-notes");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("dropped.m4a"), b"m4a").unwrap();

        let meta = store.metadata("acme/voice-notes/dropped.m4a").await.unwrap();
        assert_eq!(meta.content_type, "audio/mp4");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (store, _temp) = create_test_store().await;

        assert!(matches!(
            store.exists("../outside").await,
            Err(ObjectStoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.exists(".meta/acme").await,
            Err(ObjectStoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_key_for_skips_hidden_files() {
        let (store, temp) = create_test_store().await;

        assert_eq!(
            store.key_for(&temp.path().join("acme/voice-notes/n.webm")),
            Some("acme/voice-notes/n.webm".to_string())
        );
        assert_eq!(
            store.key_for(&temp.path().join("acme/voice-notes/.n.webm.partial")),
            None
        );
        assert_eq!(store.key_for(&temp.path().join(".meta/acme/x.json")), None);
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let (store, temp) = create_test_store().await;
        let dest = temp.path().join("scratch.bin");

        assert!(matches!(
            store.download("acme/voice-notes/none.webm", &dest).await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }
}
