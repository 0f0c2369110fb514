#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! Cinder daemon bootstrap wiring.
//!
//! Layout: `bootstrap.rs` (service wiring and shutdown), `streaming.rs`
//! (HTTP file streaming endpoint), `error.rs` (application errors).

/// Application bootstrap and environment loading.
pub mod bootstrap;
/// Application error taxonomy.
pub mod error;
/// HTTP streaming endpoint.
pub mod streaming;

pub use bootstrap::run_app;
pub use error::{AppError, AppResult};
pub use streaming::HttpStreamingEndpoint;
