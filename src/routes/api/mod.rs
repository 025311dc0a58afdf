pub mod listings;

use axum::Router;
use axum::routing::get;

use crate::store::MergeStore;

pub fn router(store: MergeStore) -> Router {
    let api = Router::new()
        .route("/listings", get(listings::list))
        .with_state(store);

    Router::new().nest("/api/v1", api)
}
