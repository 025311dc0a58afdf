pub mod api;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::store::MergeStore;

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub fn router(store: MergeStore) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(api::router(store))
        .layer(TraceLayer::new_for_http())
}
