//! Common utilities and helpers for the sandplane crates.

mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use path::*;
