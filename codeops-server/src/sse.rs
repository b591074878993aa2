//! Server-Sent Events stream and snapshot watcher.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use codeops::observability::Snapshot;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn snapshot_event(snapshot: &Snapshot) -> Option<Event> {
    match serde_json::to_string(snapshot) {
        Ok(json) => Some(Event::default().event("snapshot").data(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize snapshot");
            None
        }
    }
}

/// GET /events: the current snapshot, then one `snapshot` event per change.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.snapshot_tx.subscribe();
    let initial = state.runtime.observability().snapshot();

    let stream = async_stream::stream! {
        if let Some(event) = snapshot_event(&initial) {
            yield Ok(event);
        }

        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if let Some(event) = snapshot_event(&snapshot) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some snapshots dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Poll the tracker in a background task and broadcast changed snapshots.
pub fn start_snapshot_watcher(state: AppState) {
    tokio::spawn(async move {
        let mut last: Option<Snapshot> = None;
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let current = state.runtime.observability().snapshot();
            if publish_if_changed(&state, &mut last, current) {
                debug!("snapshot changed");
            }
        }
    });
}

/// Send `current` if it differs from `last`. Returns whether it was sent.
fn publish_if_changed(state: &AppState, last: &mut Option<Snapshot>, current: Snapshot) -> bool {
    if last.as_ref() == Some(&current) {
        return false;
    }
    // No subscribers is fine; the snapshot is still remembered.
    let _ = state.snapshot_tx.send(current.clone());
    *last = Some(current);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::test_state;

    #[test]
    fn only_changes_are_published() {
        let state = test_state();
        let mut rx = state.snapshot_tx.subscribe();
        let mut last = None;

        let idle = state.runtime.observability().snapshot();
        assert!(publish_if_changed(&state, &mut last, idle.clone()));
        assert!(!publish_if_changed(&state, &mut last, idle));

        state.runtime.observability().start_run();
        let running = state.runtime.observability().snapshot();
        assert!(publish_if_changed(&state, &mut last, running));

        assert_eq!(rx.try_recv().expect("first").status.as_str(), "idle");
        assert_eq!(rx.try_recv().expect("second").status.as_str(), "running");
        assert!(rx.try_recv().is_err());
    }
}
