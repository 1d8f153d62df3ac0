use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use tracing::*;

use crate::appstate::AppState;
use crate::control::polarity::PolarityMode;
use crate::http::messages::{HighTimeSetpoint, PolaritySetpoint, StartRequest, VoltageSetpoint};
use crate::http::status_code;
use crate::system::SessionError;

fn reject(action: &str, err: SessionError) -> (StatusCode, String) {
    let code = status_code(&err);
    warn!("{action} rejected with {code}: {err}");
    (code, err.to_string())
}

/// Start a session, optionally with the camera
#[axum::debug_handler]
pub async fn post_start(
    state: State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!(
        "POST start system (camera: {}, overrides: {:?})",
        request.camera, request.overrides
    );
    let mut manager = state.manager.lock().await;
    match manager.start_with(request.camera, &request.overrides).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(err) => {
            state.push_log(format!("Start failed: {err}"));
            Err(reject("start", err))
        }
    }
}

/// Stop the running session, a no-op without one
#[axum::debug_handler]
pub async fn post_stop(state: State<AppState>) -> StatusCode {
    info!("POST stop system");
    state.manager.lock().await.stop_system().await;
    StatusCode::OK
}

#[axum::debug_handler]
pub async fn post_voltage(
    state: State<AppState>,
    Json(setpoint): Json<VoltageSetpoint>,
) -> Result<StatusCode, (StatusCode, String)> {
    let manager = state.manager.lock().await;
    manager
        .set_voltage(setpoint.volts)
        .map(|()| StatusCode::OK)
        .map_err(|err| reject("voltage setpoint", err))
}

#[axum::debug_handler]
pub async fn post_high_time(
    state: State<AppState>,
    Json(setpoint): Json<HighTimeSetpoint>,
) -> Result<StatusCode, (StatusCode, String)> {
    let manager = state.manager.lock().await;
    manager
        .set_high_time(setpoint.seconds)
        .map(|()| StatusCode::OK)
        .map_err(|err| reject("high time setpoint", err))
}

/// Unrecognized modes are accepted with a warning
#[axum::debug_handler]
pub async fn post_polarity(
    state: State<AppState>,
    Json(setpoint): Json<PolaritySetpoint>,
) -> StatusCode {
    let mode = PolarityMode::parse(&setpoint.mode);
    if !mode.is_recognized() {
        state.push_log(format!(
            "Unrecognized polarity mode {:?}, the low phase will hold 0 V",
            setpoint.mode
        ));
    }
    state.manager.lock().await.set_polarity_mode(mode);
    StatusCode::OK
}
