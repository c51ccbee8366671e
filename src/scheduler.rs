use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{EngineError, EngineResult};
use crate::key::StateKey;
use crate::message::{Message, QueueItem};

/// Name of the engine-inserted final leaf that `stop()` transitions to.
pub const STOPPED_STATE_NAME: &str = "<!Stopped!>";

pub fn stopped_state_key() -> StateKey {
    StateKey::new(STOPPED_STATE_NAME)
}

/// A process-wide sentinel compared by identity (`Arc::ptr_eq`), never by
/// structural equality, matching the "unique sentinel object" contract of
/// §6.4.
struct StopSentinel;

fn stop_message_cell() -> &'static Message {
    static CELL: OnceLock<Message> = OnceLock::new();
    CELL.get_or_init(|| Message::new(StopSentinel))
}

pub fn stop_message() -> Message {
    stop_message_cell().clone()
}

pub fn is_stop_message(msg: &Message) -> bool {
    msg.ptr_eq(stop_message_cell())
}

/// Cancellation handle for a timer registered through `ctx.schedule`.
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn dispose(self) {
        self.abort.abort();
    }
}

/// Per-node registry of timers, so a state's exit can cancel everything it
/// scheduled (§4.9).
#[derive(Default)]
pub(crate) struct TimerRegistry {
    by_owner: std::collections::HashMap<StateKey, Vec<AbortHandle>>,
}

impl TimerRegistry {
    pub fn register(&mut self, owner: StateKey, abort: AbortHandle) {
        self.by_owner.entry(owner).or_default().push(abort);
    }

    pub fn cancel_all(&mut self, owner: &StateKey) {
        if let Some(handles) = self.by_owner.remove(owner) {
            for h in handles {
                h.abort();
            }
        }
    }

    pub fn cancel_everything(&mut self) {
        for (_, handles) in self.by_owner.drain() {
            for h in handles {
                h.abort();
            }
        }
    }
}

/// Schedules `produce` to enqueue a message onto `queue_tx` after `duration`,
/// optionally repeating. Intervals under `min_interval` are rejected (§9.4).
pub(crate) fn schedule_timer(
    owner: StateKey,
    queue_tx: mpsc::Sender<QueueItem>,
    produce: std::sync::Arc<dyn Fn() -> Message + Send + Sync>,
    duration: Duration,
    periodic: bool,
    min_interval: Duration,
    registry: &mut TimerRegistry,
) -> EngineResult<TimerHandle> {
    if periodic && duration < min_interval {
        return Err(EngineError::InvalidTimerInterval(format!(
            "periodic interval {:?} is below the minimum of {:?}",
            duration, min_interval
        )));
    }

    let task = tokio::spawn(async move {
        if periodic {
            let mut ticker = tokio::time::interval(duration);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let item = QueueItem {
                    msg: produce(),
                    reply: None,
                };
                if queue_tx.send(item).await.is_err() {
                    break;
                }
            }
        } else {
            tokio::time::sleep(duration).await;
            let item = QueueItem {
                msg: produce(),
                reply: None,
            };
            let _ = queue_tx.send(item).await;
        }
    });

    let handle = TimerHandle {
        abort: task.abort_handle(),
    };
    registry.register(owner, task.abort_handle());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_message_is_identity_comparable() {
        let a = stop_message();
        let b = stop_message();
        assert!(is_stop_message(&a));
        assert!(is_stop_message(&b));
        assert!(!is_stop_message(&Message::new(42u32)));
    }
}
