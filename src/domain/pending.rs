//! Pending voice notes as seen by the reconciler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::message::MessageRef;

/// A message whose pending pointer has not been resolved yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub message: MessageRef,

    /// Raw upload the message is waiting on
    pub pending_media_path: String,

    /// Reconciliation passes that found no artifact so far
    pub attempts: u32,

    /// When the pointer was set
    pub pending_since: DateTime<Utc>,
}

impl PendingMessage {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.pending_since
    }

    /// Whether one more missed attempt would cross the retry ceiling
    pub fn exceeds_ceiling(
        &self,
        attempts_after_miss: u32,
        max_attempts: u32,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        attempts_after_miss >= max_attempts || self.age(now) >= max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(since: DateTime<Utc>) -> PendingMessage {
        PendingMessage {
            message: MessageRef {
                tenant_id: "acme".to_string(),
                conversation_id: "t1".to_string(),
                message_id: "m1".to_string(),
            },
            pending_media_path: "acme/voice-notes/note1.webm".to_string(),
            attempts: 0,
            pending_since: since,
        }
    }

    #[test]
    fn test_ceiling_by_attempts() {
        let now = Utc::now();
        let p = pending(now);
        assert!(!p.exceeds_ceiling(2, 3, Duration::hours(1), now));
        assert!(p.exceeds_ceiling(3, 3, Duration::hours(1), now));
    }

    #[test]
    fn test_ceiling_by_age() {
        let now = Utc::now();
        let p = pending(now - Duration::hours(2));
        assert!(p.exceeds_ceiling(1, 100, Duration::hours(1), now));
    }
}
