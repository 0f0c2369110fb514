#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! Session orchestration over a black-box transfer engine.
//!
//! The [`SessionController`] owns the engine lifecycle and funnels every
//! mutating call through a sequential [`TaskDispatcher`]. Engine callbacks
//! arrive on the listener bus; magnet resolution is deduplicated per hash by
//! the [`MagnetCoordinator`], and descriptor files dropped into a watched
//! directory are ingested by the [`DirectoryWatcher`]. The [`policy`] module
//! decides when environmental conditions call for pausing transfers.
//!
//! Layout: `controller/` (lifecycle, commands, queries, bus callbacks),
//! `dispatcher.rs`, `magnet.rs`, `watcher.rs`, `policy.rs`, `needs_start.rs`,
//! `completion.rs`, `error.rs`.

pub mod completion;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod magnet;
pub mod needs_start;
pub mod policy;
pub mod watcher;

pub use completion::DownloadsCompleted;
pub use controller::{
    ControllerOptions, DEFAULT_SHUTDOWN_TIMEOUT, LifecycleState, SessionController, SessionDeps,
};
pub use dispatcher::{ShutdownReport, TaskDispatcher, UnitTicket};
pub use error::{SessionError, SessionResult};
pub use magnet::{FetchError, FetchOutcome, MagnetCoordinator, PendingMetadata};
pub use needs_start::{DEFAULT_NEEDS_START_INTERVAL, NeedsStartObserver};
pub use policy::{DEFAULT_LOW_BATTERY_LEVEL, should_pause};
pub use watcher::{DirectoryWatcher, IngestTarget, TORRENT_SUFFIX, WatchOptions};
