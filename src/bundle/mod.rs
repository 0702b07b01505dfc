//! Application bundle handling.
//!
//! Supports flat (iOS) bundles and `Contents/` (macOS) bundles.

mod info;
mod locator;

pub use info::*;
pub use locator::*;
