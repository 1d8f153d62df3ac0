use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use tracing::*;

use crate::appstate::{AppState, FrameInfo};
use crate::events::DataSample;
use crate::http::messages::HeartbeatMessage;
use crate::system::SystemStatus;

/// Return a heartbeat message
#[axum::debug_handler]
pub async fn get_heartbeat(_state: State<AppState>) -> Json<HeartbeatMessage> {
    Json(HeartbeatMessage::new())
}

/// Worker states, current setpoints and the last fatal error
#[axum::debug_handler]
pub async fn get_status(state: State<AppState>) -> Json<SystemStatus> {
    let mut manager = state.manager.lock().await;
    Json(manager.status().await)
}

/// Returns the latest display values from the acquisition loop
#[axum::debug_handler]
pub async fn get_data(state: State<AppState>) -> Result<Json<DataSample>, StatusCode> {
    if let Ok(guard) = state.latest_sample.lock() {
        return match *guard {
            Some(sample) => Ok(Json(sample)),
            // No tick has completed yet
            None => Err(StatusCode::NO_CONTENT),
        };
    }

    error!("unable to lock the latest sample during GET data, returning INTERNAL_SERVER_ERROR");
    Err(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Recent session log lines, oldest first
#[axum::debug_handler]
pub async fn get_log(state: State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    match state.log.lock() {
        Ok(log) => Ok(Json(log.iter().cloned().collect())),
        Err(_) => {
            error!("unable to lock the session log during GET log");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[axum::debug_handler]
pub async fn get_frame(state: State<AppState>) -> Result<Json<FrameInfo>, StatusCode> {
    match state.latest_frame.lock() {
        Ok(guard) => guard.map(Json).ok_or(StatusCode::NO_CONTENT),
        Err(_) => {
            error!("unable to lock the latest frame during GET frame");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
