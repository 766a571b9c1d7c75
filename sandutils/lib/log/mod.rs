//! `sandutils::log` is a module containing logging utilities for the sandplane project.

mod rotating;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use rotating::*;
