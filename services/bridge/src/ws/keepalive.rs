//! Keepalive and pong watchdog for one session.

use super::session::{EndReason, SessionShared, SessionState};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

/// Writes a keepalive every interval until the session quits, then sends the
/// close frame. A session with no pong for `max_missed_pongs` whole intervals is
/// ended on that tick. With `max_missed_pongs == 0` the watchdog is off.
pub(crate) async fn keepalive_loop(shared: Arc<SessionShared>) {
    let period = shared.bridge.settings.keepalive_interval;
    let max_missed = shared.bridge.settings.max_missed_pongs;
    let window = period * max_missed;

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                if let Err(e) = shared.link.close().await {
                    debug!(error = %e, "Close frame not delivered");
                }
                shared.advance(SessionState::Closed);
                break;
            }
            _ = ticker.tick() => {
                if max_missed > 0 && shared.since_last_pong() >= window {
                    warn!(silent_for = ?shared.since_last_pong(), "No pong from chat server");
                    shared.end(EndReason::PeerSilent);
                    continue;
                }
                if let Err(e) = shared.link.keepalive().await {
                    shared.write_failed(e);
                    break;
                }
                debug!("Sent keepalive");
            }
        }
    }
}
