//! Mach-O file format handling.
//!
//! Covers thin images and fat containers far enough to enumerate the
//! dynamic libraries an executable links against.

mod constants;
mod context;
mod fat;
mod parser;
mod structs;

pub use constants::*;
pub use context::*;
pub use fat::*;
pub use parser::*;
pub use structs::*;
