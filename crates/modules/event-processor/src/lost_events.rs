use std::sync::Arc;

use ktrace_core::stats::Stats;
use tokio::{sync::mpsc, task::JoinHandle};

/// Accumulate the lost events reported by the kernel buffers into `stats`.
///
/// The task runs for the whole tracing session and stops only when every
/// sender has been dropped.
pub fn start_lost_events_drain(
    mut rx_lost: mpsc::UnboundedReceiver<u64>,
    stats: Arc<Stats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(lost) = rx_lost.recv().await {
            log::warn!("lost {lost} events");
            stats.add_lost_events(lost);
        }
        log::debug!("lost events channel closed");
    })
}
