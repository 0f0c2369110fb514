#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! Loopback transfer engine.
//!
//! Implements the engine contract entirely in process: no peers, no wire
//! protocol. It backs offline runs of the daemon and every session test.

/// JSON descriptor codec.
pub mod descriptor;
/// Engine implementation and test hooks.
pub mod engine;
/// Live task handles.
pub mod task;

pub use engine::LoopbackEngine;
pub use task::LoopbackTask;
