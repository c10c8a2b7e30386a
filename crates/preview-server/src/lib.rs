pub mod auth;
pub mod error;
pub mod lifecycle;
pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // Tasks
        .route(
            "/api/tasks",
            post(routes::tasks::create_task).get(routes::tasks::list_tasks),
        )
        .route(
            "/api/tasks/{task_id}",
            get(routes::tasks::get_task).delete(routes::tasks::delete_task),
        )
        // Container
        .route(
            "/api/tasks/{task_id}/container",
            post(routes::containers::provision_container)
                .get(routes::containers::container_status)
                .delete(routes::containers::stop_container),
        )
        .route(
            "/api/tasks/{task_id}/container/logs",
            get(routes::containers::container_logs),
        )
        // QR code
        .route(
            "/api/tasks/{task_id}/qr-code",
            post(routes::qr_code::generate).get(routes::qr_code::get_cached),
        )
        .route_layer(middleware::from_fn_with_state(
            app_state.sessions.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::health::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the preview server, stopping on Ctrl-C.
pub async fn serve(app_state: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(app_state, listener, shutdown_signal()).await
}

/// Start the preview server on a pre-bound listener.
///
/// Reconciles against the provider once, then runs the lifecycle loop next
/// to the HTTP server. Both stop when `shutdown` resolves.
pub async fn serve_on<F>(
    app_state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let actual_port = listener.local_addr()?.port();

    match app_state.lifecycle.reconcile().await {
        Ok(report) => report.log(),
        Err(e) => tracing::error!(error = %e, "startup reconciliation failed"),
    }

    let loop_stop = Arc::new(Notify::new());
    let lifecycle_loop = tokio::spawn(app_state.lifecycle.clone().run(loop_stop.clone()));

    let app = build_router(app_state);
    tracing::info!("preview server listening on http://localhost:{actual_port}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    loop_stop.notify_one();
    if let Err(e) = lifecycle_loop.await {
        tracing::error!(error = %e, "lifecycle loop panicked");
    }
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
