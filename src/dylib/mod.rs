//! Dylib reference classification and extraction.

mod classifier;
mod extractor;
pub mod resolve;

pub use classifier::*;
pub use extractor::*;
