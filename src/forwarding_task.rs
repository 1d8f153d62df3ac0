use tokio::sync::mpsc::Receiver;
use tracing::*;

use crate::appstate::AppState;
use crate::events::SessionEvent;

/// Drain observer events from the workers into the shared http state.
/// Returns once every sender is gone.
pub async fn forward_events(mut receiver: Receiver<SessionEvent>, state: AppState) {
    while let Some(event) = receiver.recv().await {
        state.apply(event);
    }
    debug!("observer channel closed, event forwarding finished");
}
