//! Image module - host bitmaps, PNG files and display sinks.

mod bitmap;
mod png;
mod sink;

pub use bitmap::*;
pub use self::png::ExportError;
pub use sink::*;
