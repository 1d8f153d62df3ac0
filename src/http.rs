use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};

use crate::appstate::AppState;
use crate::system::SessionError;

pub mod get;
pub mod messages;
pub mod post;

/// Set up the control surface routes
pub fn router(state: AppState) -> Router {
    Router::new()
        // GET endpoints
        .route("/heartbeat", get(get::get_heartbeat))
        .route("/status", get(get::get_status))
        .route("/data", get(get::get_data))
        .route("/log", get(get::get_log))
        .route("/frame", get(get::get_frame))
        // POST endpoints
        .route("/system/start", post(post::post_start))
        .route("/system/stop", post(post::post_stop))
        .route("/setpoint/voltage", post(post::post_voltage))
        .route("/setpoint/high-time", post(post::post_high_time))
        .route("/setpoint/polarity", post(post::post_polarity))
        // Give the routers access to the application state
        .with_state(state)
}

/// Map a lifecycle error onto the response status
pub fn status_code(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Configuration(_) => StatusCode::BAD_REQUEST,
        SessionError::AlreadyRunning => StatusCode::CONFLICT,
        SessionError::Hardware(_)
        | SessionError::DataLog(_)
        | SessionError::Camera(_)
        | SessionError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
