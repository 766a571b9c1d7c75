//! `sandutils` is a library containing shared runtime utilities for the sandplane project.

#![warn(missing_docs)]

pub mod error;
pub mod log;
pub mod path;
pub mod runtime;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use log::*;
pub use path::*;
pub use runtime::*;
