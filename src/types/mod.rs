//! Shared type definitions
//!
//! Task kinds, generation requests, queue jobs and placeholder lyrics used
//! across the crate.

pub mod job;
pub mod lyrics;
pub mod request;
pub mod task;
