//! HTTP surfaces
//!
//! Two routers on two ports: the admin API on the primary port and the
//! KoSync-protocol surface on its own port so only the sync endpoints are
//! ever internet-exposed.

pub mod admin;
pub mod kosync;

use axum::Router;

use crate::state::AppState;

/// Admin + status API for the primary port
pub fn admin_router(state: AppState) -> Router {
    admin::routes().with_state(state)
}

/// KoSync-compatible surface for the sync port
pub fn kosync_router(state: AppState) -> Router {
    kosync::routes().with_state(state)
}
