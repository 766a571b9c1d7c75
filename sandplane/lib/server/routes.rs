//! Route definitions for the HTTP server.
//!
//! This module sets up the routing for the REST API endpoints.

use axum::{
    routing::{get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a new router with all API endpoints configured
///
/// ## Arguments
/// * `state` - The shared server state
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/sandboxes",
            post(handlers::create_handler).get(handlers::list_handler),
        )
        .route(
            "/sandboxes/{sandbox_id}",
            get(handlers::get_handler).delete(handlers::delete_handler),
        )
        .route(
            "/sandboxes/{sandbox_id}/refresh",
            post(handlers::refresh_handler),
        )
        .with_state(state)
}
