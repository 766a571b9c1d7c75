//! The sandbox lifecycle pipeline.
//!
//! Creation walks down the stack — quota reservation, slot reservation,
//! network construction, VM restore, cache registration — and teardown walks
//! back up. Every failure point unwinds the stages below it, so a client
//! never observes a half-created sandbox.

mod orchestrator;
mod teardown;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use orchestrator::*;
pub use teardown::*;
pub use types::*;
