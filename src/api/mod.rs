/// API routes and handlers
pub mod admin;
pub mod bot;
pub mod middleware;
pub mod plans;
pub mod user;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(plans::routes())
        .merge(user::routes())
        .merge(bot::routes())
        .merge(admin::routes())
}
