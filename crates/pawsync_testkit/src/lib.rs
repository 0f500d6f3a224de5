//! # PawSync Testkit
//!
//! Test utilities for PawSync.
//!
//! This crate provides:
//! - Temporary stores and fully wired test engines on a manual clock
//! - Sample payloads for every entity type
//! - Property-based generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pawsync_testkit::prelude::*;
//!
//! #[test]
//! fn enqueue_is_visible() {
//!     with_test_engine(|engine| {
//!         engine.queue.enqueue(Mutation::create("rex", payloads::dog("Rex"))).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
