//! ACE-Step 1.5 Studio Library
//!
//! Headless core of the ACE-Step 1.5 front-end: layout and settings, the
//! preset manager, job building for the CLI and API workflows, and the
//! persisted generation queue.

pub mod engine;
pub mod error;
pub mod launcher;
pub mod queue;
pub mod storage;
pub mod system;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
