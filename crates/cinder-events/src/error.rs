//! Listener failure records.

use std::any::Any;
use std::fmt::{self, Display, Formatter};

use crate::payloads::EventCategory;

/// A listener callback panicked while handling an event.
///
/// Failures are isolated per callback: they are logged by the bus and counted
/// in the publish report, never propagated to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    /// Registration that failed.
    pub listener: u64,
    /// Category the event was delivered under.
    pub category: EventCategory,
    /// Panic payload rendered as text when it was a string.
    pub message: String,
}

impl ListenerFailure {
    pub(crate) fn from_panic(
        listener: u64,
        category: EventCategory,
        payload: &(dyn Any + Send),
    ) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|text| (*text).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self {
            listener,
            category,
            message,
        }
    }
}

impl Display for ListenerFailure {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("event listener failed")
    }
}

impl std::error::Error for ListenerFailure {}
