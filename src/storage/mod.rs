//! Storage layout and backend.
//!
//! - `paths`: the path mapper (raw upload ↔ converted artifact)
//! - `signing`: time-limited artifact URLs
//! - `object_store`: the storage backend trait and a filesystem bucket

pub mod object_store;
pub mod paths;
pub mod signing;

pub use object_store::{
    content_type_for_path, LocalObjectStore, ObjectMetadata, ObjectStore, ObjectStoreError,
};
pub use paths::{PathError, PathMapper, RawKey, VoiceNotePath};
pub use signing::{SignedUrl, SigningError, UrlSigner};
