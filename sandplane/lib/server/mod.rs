//! REST API server for the sandbox lifecycle.
//!
//! The surface is intentionally small: create, list, delete, refresh. Request
//! parsing and auth beyond this live in the fleet's API front-end; this
//! server is what the front-end forwards to on a worker node.

mod handlers;
mod routes;
mod state;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use routes::*;
pub use state::*;
pub use types::*;

use crate::SandplaneResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ServerState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> SandplaneResult<()> {
    let router = create_router(state);

    tracing::info!(addr = %listener.local_addr()?, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
