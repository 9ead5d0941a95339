// Fixed-interval poller gated on push-channel readiness.
//
// Collaborators that poll their own endpoints (long-running imports, for
// example) share the push channel's connection signal: ticks fire only while
// the channel is connected and pause while it is connecting or failed.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::channel::{stop_requested, ConnectionState};

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Run `tick` every `interval` while connected, until `shutdown` flips to true.
///
/// Returns the number of ticks executed.
pub async fn poll_while_connected<F, Fut>(
    mut connection: watch::Receiver<ConnectionState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            connected = wait_connected(&mut connection) => {
                if !connected {
                    break;
                }
            }
        }
        debug!(interval_ms = interval.as_millis() as u64, "poller resumed");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => return ticks,
                changed = connection.changed() => {
                    if changed.is_err() {
                        return ticks;
                    }
                    if *connection.borrow_and_update() != ConnectionState::Connected {
                        debug!("poller paused");
                        break;
                    }
                }
                _ = timer.tick() => {
                    tick().await;
                    ticks += 1;
                }
            }
        }
    }

    ticks
}

/// Resolves with `false` if the connection sender is gone.
async fn wait_connected(connection: &mut watch::Receiver<ConnectionState>) -> bool {
    connection.wait_for(|state| *state == ConnectionState::Connected).await.is_ok()
}
