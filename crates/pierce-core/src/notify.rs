//! Push-notification classification and queueing.
//!
//! The push reader parses every incoming frame, classifies it by its
//! `dataType` string and appends it here; the caller flow waits for specific
//! kinds while leaving everything else queued for later waits. Entries carry
//! a monotonically increasing sequence number so each waiter can rescan only
//! what it has not examined yet, and waits stay bounded by one monotonic
//! deadline across wake-ups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout};

use crate::error::{PunchError, PunchResult};

/// Kind of a push notification, derived from its `dataType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Anything we do not recognize; still queued, never matchable
    Unknown,
    /// `psn:sessionManager:sys:remotePlaySession:created`
    SessionCreated,
    /// `psn:sessionManager:sys:rps:members:created`
    MemberCreated,
    /// `psn:sessionManager:sys:rps:members:deleted`
    MemberDeleted,
    /// `psn:sessionManager:sys:rps:customData1:updated`
    CustomData1Updated,
    /// `psn:sessionManager:sys:rps:sessionMessage:created`
    SessionMessageCreated,
}

impl NotificationKind {
    /// Classifies a parsed notification by its `dataType` string.
    pub fn classify(json: &serde_json::Value) -> Self {
        let Some(data_type) = json.get("dataType").and_then(|v| v.as_str()) else {
            tracing::warn!("notification without a dataType string field");
            return NotificationKind::Unknown;
        };
        match data_type {
            "psn:sessionManager:sys:remotePlaySession:created" => NotificationKind::SessionCreated,
            "psn:sessionManager:sys:rps:members:created" => NotificationKind::MemberCreated,
            "psn:sessionManager:sys:rps:members:deleted" => NotificationKind::MemberDeleted,
            "psn:sessionManager:sys:rps:customData1:updated" => {
                NotificationKind::CustomData1Updated
            }
            "psn:sessionManager:sys:rps:sessionMessage:created" => {
                NotificationKind::SessionMessageCreated
            }
            other => {
                tracing::warn!("unknown notification type \"{other}\"");
                NotificationKind::Unknown
            }
        }
    }

    const fn bit(self) -> u16 {
        match self {
            NotificationKind::Unknown => 0,
            NotificationKind::SessionCreated => 1 << 0,
            NotificationKind::MemberCreated => 1 << 1,
            NotificationKind::MemberDeleted => 1 << 2,
            NotificationKind::CustomData1Updated => 1 << 3,
            NotificationKind::SessionMessageCreated => 1 << 4,
        }
    }
}

/// A set of notification kinds to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSet(u16);

impl KindSet {
    /// True when `kind` is a member. `Unknown` is a member of no set.
    pub fn contains(self, kind: NotificationKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl From<NotificationKind> for KindSet {
    fn from(kind: NotificationKind) -> Self {
        KindSet(kind.bit())
    }
}

impl std::ops::BitOr for NotificationKind {
    type Output = KindSet;

    fn bitor(self, rhs: NotificationKind) -> KindSet {
        KindSet(self.bit() | rhs.bit())
    }
}

impl std::ops::BitOr<NotificationKind> for KindSet {
    type Output = KindSet;

    fn bitor(self, rhs: NotificationKind) -> KindSet {
        KindSet(self.0 | rhs.bit())
    }
}

/// One queued push notification.
#[derive(Debug)]
pub struct Notification {
    /// Position in arrival order, starting at 1
    pub seq: u64,
    /// Classified kind
    pub kind: NotificationKind,
    /// Parsed JSON root
    pub json: serde_json::Value,
    /// The raw frame as received
    pub raw: String,
}

/// Arrival-ordered queue shared between the push reader and the caller flow.
pub struct NotificationQueue {
    entries: Mutex<VecDeque<Arc<Notification>>>,
    next_seq: AtomicU64,
    appended: Notify,
}

impl NotificationQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            appended: Notify::new(),
        }
    }

    /// Appends a notification and wakes every waiter.
    pub fn push(&self, kind: NotificationKind, json: serde_json::Value, raw: String) -> Arc<Notification> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let notification = Arc::new(Notification { seq, kind, json, raw });
        self.entries
            .lock()
            .expect("notification queue poisoned")
            .push_back(notification.clone());
        self.appended.notify_waiters();
        notification
    }

    /// Waits for the oldest not-yet-examined notification whose kind is in
    /// `kinds`.
    ///
    /// Entries queued before the call are examined by the first scan; entries
    /// examined once (matching or not) are skipped on rescans. The budget
    /// bounds the total elapsed time across wake-ups, not each wake.
    pub async fn wait(
        &self,
        kinds: impl Into<KindSet>,
        budget: Duration,
    ) -> PunchResult<Arc<Notification>> {
        let kinds = kinds.into();
        let deadline = Instant::now() + budget;
        let mut last_seen = 0u64;

        loop {
            // Register for wake-ups before scanning so an append between the
            // scan and the await is not lost.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let entries = self.entries.lock().expect("notification queue poisoned");
                for entry in entries.iter() {
                    if entry.seq <= last_seen {
                        continue;
                    }
                    last_seen = entry.seq;
                    if kinds.contains(entry.kind) {
                        tracing::debug!("wait: found notification {:?} (seq {})", entry.kind, entry.seq);
                        return Ok(entry.clone());
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PunchError::Timeout);
            }
            if timeout(remaining, appended).await.is_err() {
                tracing::error!("wait: timed out waiting for notifications");
                return Err(PunchError::Timeout);
            }
        }
    }

    /// Unlinks a notification. Returns false when it was already gone.
    pub fn clear(&self, notification: &Notification) -> bool {
        let mut entries = self.entries.lock().expect("notification queue poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.seq != notification.seq);
        entries.len() != before
    }

    /// Drops every queued entry.
    pub fn drain(&self) {
        self.entries
            .lock()
            .expect("notification queue poisoned")
            .clear();
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("notification queue poisoned")
            .len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}
