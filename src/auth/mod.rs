use crate::state::AppState;
use axum::Router;

mod claims;
pub mod clock;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod issuer;
pub mod jwt;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod services;
mod validation;
pub mod verification;

#[cfg(test)]
pub(crate) mod memory;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}
