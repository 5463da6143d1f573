//! The HTTP surface: route table, request-context extraction, and the error
//! taxonomy mapping. Nothing below this module knows about HTTP status
//! codes or JSON shapes — this is the one place that translates between the
//! two.

pub mod error;
pub mod extract;
mod handlers;
mod middleware;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::oauth::OAuthClient;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub oauth: OAuthClient,
    pub sessions: SessionStore,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/oauth/exchange", post(handlers::oauth_exchange))
        .route("/oauth/refresh", post(handlers::oauth_refresh))
        .route("/accounts", get(handlers::list_accounts))
        .route("/auth/account", post(handlers::auth_account))
        .route("/symbols", get(handlers::list_symbols))
        .route("/quote", get(handlers::get_quote))
        .route("/account", get(handlers::get_account))
        .route("/trade", post(handlers::place_trade))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_internal_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(axum::middleware::from_fn(middleware::observe))
        .with_state(state)
}
