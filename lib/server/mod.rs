//! The HTTP side of restfs: per-user stores served over the wire protocol in
//! [`restfs_http::wire`].

mod error;
mod handlers;

pub use error::ServerError;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::sandbox::UserStore;

/// Every path under every verb goes to one dispatcher; the store decides what exists.
pub fn router(users: UserStore) -> Router {
    Router::new()
        .fallback(handlers::dispatch)
        .with_state(users)
        // Whole files travel in one PUT.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
}

/// Serve `users` on `listener` until the future is dropped or `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    users: UserStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "serving");
    axum::serve(listener, router(users))
        .with_graceful_shutdown(shutdown)
        .await
}
