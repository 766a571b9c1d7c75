//! `sandutils::runtime` is a module containing process runtime utilities for the sandplane project.

mod metrics;
mod monitor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use metrics::*;
pub use monitor::*;
