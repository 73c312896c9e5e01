//! Transcode-on-upload pipeline.
//!
//! ```text
//! bucket (new object) → StorageWatcher → Dispatcher → Transcoder (ffmpeg)
//!                                            ↓
//!                       {tenant}/voice-notes/converted/{stem}.ogg
//! ```
//!
//! 1. **Watcher**: emits one storage event per finalized object
//! 2. **Dispatcher**: guards, then copy (already canonical) or transcode
//! 3. **Transcoder**: ffmpeg subprocess with a fixed OGG/Opus target

pub mod dispatcher;
pub mod transcoder;
pub mod watcher;

pub use dispatcher::{DispatchOutcome, Dispatcher, SkipReason};
pub use transcoder::{FfmpegTranscoder, TranscodeError, TranscodeTarget, Transcoder};
pub use watcher::{ScanResult, StorageWatcher, WatchHandle, WatcherConfig};
