#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! Listener bus for engine-level events.
//!
//! Engine callbacks are republished here and fanned out to independent
//! listeners grouped by [`EventCategory`]. Delivery is synchronous, in
//! registration order, against a snapshot of the registrations taken when the
//! round starts. A panicking listener is isolated and logged; its siblings
//! still receive the event.
//!
//! Async consumers that only need to observe traffic can attach a broadcast
//! tap through [`ListenerBus::subscribe`].
//!
//! Layout: `payloads.rs` (event enum, categories, envelopes), `hash.rs`
//! (content hash identifiers), `bus.rs` (registry and dispatch), `error.rs`
//! (listener failure records).

pub mod bus;
pub mod error;
pub mod hash;
pub mod payloads;

pub use bus::{ListenerBus, ListenerHandle, PublishReport};
pub use error::ListenerFailure;
pub use hash::{InfoHash, InvalidInfoHash};
pub use payloads::{Event, EventCategory, EventEnvelope, EventId, EventStream};
