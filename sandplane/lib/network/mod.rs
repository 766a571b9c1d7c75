//! Network namespace construction and teardown for sandbox microVMs.
//!
//! Every sandbox gets a named network namespace wired to the host through a
//! veth pair, with a tap device inside the namespace for the VM itself and
//! NAT rules translating between the fixed in-namespace address and the
//! host-visible per-slot address. Namespace manipulation mutates per-thread
//! kernel state, so all of it is funneled through one dedicated worker
//! thread; see [`NetnsWorker`].

mod builder;
mod hosts;
mod netlink;
mod worker;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use hosts::*;
pub use worker::*;
