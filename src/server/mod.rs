pub mod middleware;
pub mod routes;

use axum::Router;

use crate::provider::GcpProvider;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<GcpProvider>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
