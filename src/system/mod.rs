//! System utilities
//!
//! Checkpoint discovery, output folder housekeeping and GPU detection.

pub mod gpu;
pub mod models;
pub mod outputs;
