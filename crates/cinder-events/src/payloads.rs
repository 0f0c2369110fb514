//! Event payloads, categories, and envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;

use crate::hash::InfoHash;

/// Identifier assigned to each published event.
pub type EventId = u64;

/// Default capacity of the broadcast tap.
pub const DEFAULT_TAP_CAPACITY: usize = 256;

/// Stream wrapper handed to async tap subscribers.
pub type EventStream = BroadcastStream<EventEnvelope>;

/// Registration categories. Listeners subscribe to exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Engine session came up.
    SessionStarted,
    /// Engine session went down.
    SessionStopped,
    /// Session-level failure.
    SessionError,
    /// Port mapping failure.
    NatError,
    /// IP filter rules were parsed.
    IpFilterParsed,
    /// A task was added.
    TaskAdded,
    /// A persisted task was loaded back into the engine.
    TaskLoaded,
    /// A task finished downloading.
    TaskFinished,
    /// A task started moving its storage.
    TaskMoving,
    /// A task storage move completed.
    TaskMoved,
    /// Metadata became available for a task or magnet fetch.
    MetadataLoaded,
    /// A persisted task failed to restore.
    RestoreError,
}

impl EventCategory {
    /// Every category, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::SessionStarted,
        Self::SessionStopped,
        Self::SessionError,
        Self::NatError,
        Self::IpFilterParsed,
        Self::TaskAdded,
        Self::TaskLoaded,
        Self::TaskFinished,
        Self::TaskMoving,
        Self::TaskMoved,
        Self::MetadataLoaded,
        Self::RestoreError,
    ];

    /// Machine-friendly category name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionStopped => "session_stopped",
            Self::SessionError => "session_error",
            Self::NatError => "nat_error",
            Self::IpFilterParsed => "ip_filter_parsed",
            Self::TaskAdded => "task_added",
            Self::TaskLoaded => "task_loaded",
            Self::TaskFinished => "task_finished",
            Self::TaskMoving => "task_moving",
            Self::TaskMoved => "task_moved",
            Self::MetadataLoaded => "metadata_loaded",
            Self::RestoreError => "restore_error",
        }
    }
}

/// Typed engine events surfaced through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionStarted,
    SessionStopped,
    SessionError {
        message: String,
    },
    NatError {
        message: String,
    },
    IpFilterParsed {
        rule_count: usize,
    },
    TaskAdded {
        id: InfoHash,
    },
    TaskLoaded {
        id: InfoHash,
    },
    TaskFinished {
        id: InfoHash,
    },
    TaskMoving {
        id: InfoHash,
    },
    TaskMoved {
        id: InfoHash,
        success: bool,
    },
    /// Metadata for an existing task was resolved, or failed to resolve.
    MetadataLoaded {
        id: InfoHash,
        error: Option<String>,
    },
    /// Raw metadata delivered for a magnet fetch. `payload` is `None` when the
    /// engine gave up without data.
    MagnetMetadata {
        hash: InfoHash,
        payload: Option<Vec<u8>>,
    },
    RestoreError {
        id: InfoHash,
    },
}

impl Event {
    /// Category the event is delivered under.
    #[must_use]
    pub const fn category(&self) -> EventCategory {
        match self {
            Self::SessionStarted => EventCategory::SessionStarted,
            Self::SessionStopped => EventCategory::SessionStopped,
            Self::SessionError { .. } => EventCategory::SessionError,
            Self::NatError { .. } => EventCategory::NatError,
            Self::IpFilterParsed { .. } => EventCategory::IpFilterParsed,
            Self::TaskAdded { .. } => EventCategory::TaskAdded,
            Self::TaskLoaded { .. } => EventCategory::TaskLoaded,
            Self::TaskFinished { .. } => EventCategory::TaskFinished,
            Self::TaskMoving { .. } => EventCategory::TaskMoving,
            Self::TaskMoved { .. } => EventCategory::TaskMoved,
            Self::MetadataLoaded { .. } | Self::MagnetMetadata { .. } => {
                EventCategory::MetadataLoaded
            }
            Self::RestoreError { .. } => EventCategory::RestoreError,
        }
    }

    /// Machine-friendly discriminator for log consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MagnetMetadata { .. } => "magnet_metadata",
            other => other.category().as_str(),
        }
    }

    /// Task identifier carried by task-scoped events.
    #[must_use]
    pub const fn task_id(&self) -> Option<&InfoHash> {
        match self {
            Self::TaskAdded { id }
            | Self::TaskLoaded { id }
            | Self::TaskFinished { id }
            | Self::TaskMoving { id }
            | Self::TaskMoved { id, .. }
            | Self::MetadataLoaded { id, .. }
            | Self::RestoreError { id } => Some(id),
            Self::MagnetMetadata { hash, .. } => Some(hash),
            Self::SessionStarted
            | Self::SessionStopped
            | Self::SessionError { .. }
            | Self::NatError { .. }
            | Self::IpFilterParsed { .. } => None,
        }
    }
}

/// Metadata wrapper around events delivered to the async tap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> InfoHash {
        InfoHash::parse(&"ab".repeat(20)).expect("valid hash")
    }

    #[test]
    fn magnet_metadata_shares_metadata_category() {
        let event = Event::MagnetMetadata {
            hash: sample_hash(),
            payload: None,
        };
        assert_eq!(event.category(), EventCategory::MetadataLoaded);
        assert_eq!(event.kind(), "magnet_metadata");
        assert_eq!(event.task_id(), Some(&sample_hash()));
    }

    #[test]
    fn session_events_have_no_task_id() {
        assert!(Event::SessionStarted.task_id().is_none());
        assert_eq!(Event::SessionStarted.kind(), "session_started");
        assert_eq!(
            Event::IpFilterParsed { rule_count: 3 }.category(),
            EventCategory::IpFilterParsed
        );
    }

    #[test]
    fn categories_are_unique() {
        let names: std::collections::BTreeSet<_> =
            EventCategory::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names.len(), EventCategory::ALL.len());
    }
}
