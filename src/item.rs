//! The unit of storage: a key, a value, and an optional expiration deadline.

use bytes::Bytes;
use std::time::{Duration, SystemTime};

/// A single database record. Items are immutable once stored; updates
/// replace the whole item so that every index referencing it stays
/// consistent with the primary tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The key, unique within the primary tree.
    pub key: Bytes,
    /// The value bytes.
    pub value: Bytes,
    /// Absolute expiration instant. `None` means the item never expires.
    pub deadline: Option<SystemTime>,
}

impl Item {
    /// Create an item without an expiration deadline.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            deadline: None,
        }
    }

    /// Create an item with an absolute expiration deadline.
    pub fn with_deadline(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        deadline: SystemTime,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            deadline: Some(deadline),
        }
    }

    /// Check whether the item is expired at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Remaining time until expiration at `now`. `None` when no deadline is
    /// set; `Some(ZERO)` once the deadline has passed.
    pub fn remaining_ttl_at(&self, now: SystemTime) -> Option<Duration> {
        match self.deadline {
            Some(deadline) => {
                if now < deadline {
                    deadline.duration_since(now).ok()
                } else {
                    Some(Duration::ZERO)
                }
            }
            None => None,
        }
    }
}
