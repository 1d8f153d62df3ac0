use std::sync::Arc;

use anyhow::Context;
use espray_control::appstate::AppState;
use espray_control::camera::CameraProvider;
use espray_control::channel::VOLTAGE_CONTROL;
use espray_control::config::{ChannelLayout, SessionConfig};
use espray_control::events::{self, EVENT_CHANNEL_CAPACITY};
use espray_control::forwarding_task::forward_events;
use espray_control::hardware::DaqBackend;
use espray_control::http;
use espray_control::system::SessionManager;
use tokio::task;
use tracing::*;
use tracing_subscriber::FmtSubscriber;

/// Pick the hardware backends compiled into this binary
#[cfg_attr(any(feature = "nidaq", not(feature = "sim")), allow(unused_variables))]
fn backends(layout: &ChannelLayout) -> (Arc<dyn DaqBackend>, Option<Arc<dyn CameraProvider>>) {
    #[cfg(feature = "nidaq")]
    let daq: Arc<dyn DaqBackend> = Arc::new(espray_control::hardware::nidaq::Nidaq);
    #[cfg(all(feature = "sim", not(feature = "nidaq")))]
    let daq: Arc<dyn DaqBackend> = Arc::new(espray_control::hardware::sim::Sim::following(
        layout.outputs.index_of(VOLTAGE_CONTROL),
    ));
    #[cfg(not(any(feature = "sim", feature = "nidaq")))]
    let daq: Arc<dyn DaqBackend> =
        Arc::new(espray_control::hardware::loopback::LoopbackBackend::new());

    #[cfg(feature = "sim")]
    let camera: Option<Arc<dyn CameraProvider>> =
        Some(Arc::new(espray_control::camera::sim::SimCameraProvider));
    #[cfg(not(feature = "sim"))]
    let camera: Option<Arc<dyn CameraProvider>> = None;

    (daq, camera)
}

/// Application & Tokio executor entrypoint
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SessionConfig::load().context("unable to load configuration")?;

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber failed")?;

    // Workers publish to the observer channel, the forwarding task folds it into the http state
    let (events, receiver) = events::channel(EVENT_CHANNEL_CAPACITY);
    let layout = config.validate().context("invalid configuration")?;
    let (daq, camera) = backends(&layout);
    info!("using {daq:?} with camera {camera:?}");

    let manager = SessionManager::new(config.clone(), daq, camera, events);
    let state = AppState::new(manager);
    task::spawn(forward_events(receiver, state.clone()));

    let app = http::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("unable to bind {}", config.http.bind))?;
    info!("Listening on http://{}", config.http.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("unable to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("http server failed")?;

    info!("shutting down");
    let stuck = state
        .manager
        .lock()
        .await
        .shutdown(config.http.shutdown_grace)
        .await;
    if !stuck.is_empty() {
        warn!("exiting with {stuck:?} still running");
    }
    Ok(())
}
