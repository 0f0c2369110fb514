#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! Shared test helpers used across integration suites.
//! Layout: fixtures.rs (hashes, descriptors, add requests), mocks.rs (fake
//! collaborators), assert.rs (polling assertions).

pub mod assert;
pub mod fixtures;
pub mod mocks;
