//! Epoch timer.
//!
//! Each engine runs one timer task that pushes a tick into a bounded queue
//! every epoch.  The coordinator consumes the ticks; on each one it checks
//! every connection for silence and resends whatever is outstanding.  There is
//! no per-message retransmit timer and no RTT estimate.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Spawn the tick task.  It ends on its own once the receiving side of
/// `ticks` is dropped.
pub fn spawn_epoch_timer(period: Duration, ticks: mpsc::Sender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if ticks.send(()).await.is_err() {
                break;
            }
        }
    })
}
