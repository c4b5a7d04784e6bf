pub mod handlers;

use crate::kv::KvStore;
use crate::state::AppState;
use crate::upstream::UpstreamProvider;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router<K: KvStore + 'static, P: UpstreamProvider + 'static>(
    state: AppState<K, P>,
) -> Router {
    Router::new()
        .route("/getLyrics", get(handlers::get_lyrics::<K, P>))
        .route("/{provider}/getLyrics", get(handlers::get_lyrics_for_provider::<K, P>))
        .route("/revalidate", get(handlers::revalidate::<K, P>))
        .route("/admin/stats", get(handlers::admin_stats::<K, P>))
        .route("/healthz", get(handlers::health_check::<K, P>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
