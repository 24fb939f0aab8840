//! Life flags shared between a controller and the task it runs.

use std::time::Duration;

use tokio::sync::watch;

/// Create a life flag that starts active
pub fn life_flag() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(true)
}

pub fn is_alive(life: &watch::Receiver<bool>) -> bool {
    *life.borrow()
}

/// Sleep for `duration` unless the flag turns false first.
///
/// Returns whether the flag is still true afterwards. A dropped sender
/// counts as stopped.
pub async fn sleep_while_alive(life: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if !is_alive(life) {
        return false;
    }
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return is_alive(life);
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return is_alive(life),
            changed = life.changed() => {
                if changed.is_err() || !is_alive(life) {
                    return false;
                }
            }
        }
    }
}
