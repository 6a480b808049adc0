//! Schema module - Render configuration and kernel parameter declarations.

mod config;
mod params;

pub use config::*;
pub use params::*;
