//! Deferred stop watchdog.
//!
//! Every recording gets a watchdog that fires `stop()` when its schedule
//! window closes, bounded by the hard recording ceiling. The watchdog is a
//! cancellable deferred task: it dies silently when the recording's token
//! is cancelled first, so normal completion never races a stale timer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::manager::{RecorderManager, StopReason};
use crate::domain::RecordingKey;

/// Schedule a stop for `key` after `delay`, unless the recording ends first.
pub fn spawn_deferred_stop(
    manager: Arc<RecorderManager>,
    key: RecordingKey,
    token: CancellationToken,
    delay: Duration,
    reason: StopReason,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                info!(key = %key, ?delay, %reason, "Watchdog firing stop");
                manager.stop(&key, reason);
            }
        }
    })
}
