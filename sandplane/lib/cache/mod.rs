//! The in-memory registry of live sandboxes with TTL-based eviction.
//!
//! The cache is the single source of truth for which sandboxes this node
//! considers alive. Entries expire when their renewable deadline passes or
//! their absolute lifetime cap is hit; expiry and explicit deletion both feed
//! an eviction channel drained by a dispatcher that owns the teardown
//! pipeline, so the cache itself never blocks on slow I/O.

mod cache;
mod evict;
mod session;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cache::*;
pub use evict::*;
pub use session::*;
