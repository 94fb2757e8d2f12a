//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::connection::EventConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
    /// Writing a ping failed or did not finish within one interval.
    SendFailed,
}

/// Ping a connection until it goes quiet or `cancel` fires.
///
/// Every `interval` tick the alive flag is checked and reset, then a ping is
/// written, bounded by `interval`. After `timeout / interval` consecutive
/// silent ticks (at least one) the connection is reported dead.
pub async fn run_heartbeat(
    connection: Arc<EventConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = max_missed(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    trace!(conn_id = %connection.id, missed, max_missed, "missed heartbeat");
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                // A client that stopped reading can stall the write forever.
                match time::timeout(interval, connection.send_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return HeartbeatResult::SendFailed,
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let ratio = timeout.as_millis() / interval.as_millis().max(1);
    u32::try_from(ratio).unwrap_or(u32::MAX).max(1)
}
