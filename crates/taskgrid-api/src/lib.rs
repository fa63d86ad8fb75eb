//! taskgrid-api — REST API for TaskGrid.
//!
//! Thin axum layer over [`Engine`]: every handler maps one engine
//! operation and renders the result in the `{success, data, error}`
//! envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/graphs` | Install a task graph |
//! | GET | `/api/v1/tasks?phase=` | List tasks, optionally by phase |
//! | GET | `/api/v1/tasks/{id}` | Get one task |
//! | POST | `/api/v1/tasks/{id}/cancel` | Cancel a task and its dependants |
//! | PUT | `/api/v1/tasks/{id}/mode` | Set a task's mode |
//! | POST | `/api/v1/tasks/{id}/callback` | Remote job reports a response |
//! | POST | `/api/v1/tasks/{id}/heartbeat` | Remote job liveness ping |
//! | POST | `/api/v1/correlations/{cid}/cancel` | Cancel all tasks of a correlation |
//! | GET | `/api/v1/admin/concurrency` | Admission usage and bound |
//! | PUT | `/api/v1/admin/concurrency` | Change the admission bound |
//! | GET | `/api/v1/admin/settings` | Read global settings |
//! | PUT | `/api/v1/admin/settings` | Replace global settings |
//! | POST | `/api/v1/admin/reset` | Drop all tasks and claims |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post, put};
use taskgrid_engine::Engine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Engine,
}

/// Build the complete API router.
pub fn build_router(engine: Engine) -> Router {
    let api_state = ApiState { engine };

    let api_routes = Router::new()
        .route("/graphs", post(handlers::install_graph))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/tasks/{id}/mode", put(handlers::set_mode))
        .route("/tasks/{id}/callback", post(handlers::callback))
        .route("/tasks/{id}/heartbeat", post(handlers::heartbeat))
        .route("/correlations/{cid}/cancel", post(handlers::cancel_correlation))
        .route(
            "/admin/concurrency",
            get(handlers::get_concurrency).put(handlers::set_concurrency),
        )
        .route(
            "/admin/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/admin/reset", post(handlers::reset))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
