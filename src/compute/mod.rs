//! Compute module - GPU execution.

pub mod gpu;
