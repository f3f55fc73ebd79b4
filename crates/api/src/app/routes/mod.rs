use axum::Router;

pub mod batches;
pub mod flow;
pub mod system;

/// Router for the batch and flow-control endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/batches", batches::router())
        .nest("/flow", flow::router())
}
