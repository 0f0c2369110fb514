#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

//! Persistence for task records.
//!
//! [`RuntimeStore`] implements the `TorrentRepository` contract over a JSON
//! document (or purely in memory for tests and offline runs).

pub mod error;
pub mod store;

pub use error::{RuntimeError, RuntimeResult};
pub use store::{RuntimeStore, STORE_FILE_NAME};
