//! Room timers.
//!
//! Every timer is registered under `(room code, TimerKey)`. Scheduling a key
//! that is already registered replaces (and aborts) the previous timer, and a
//! timer fires by sending a command into the room's own queue, so a timer that
//! outlives its room just fails to send.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    RoundTick,
    StartFallback,
    HostGrace,
    PlayerGrace(String),
    PeerValidation,
    TournamentNextRound,
}

struct ScheduledTimer {
    id: u64,
    handle: AbortHandle,
}

#[derive(Default)]
pub struct Scheduler {
    timers: DashMap<(String, TimerKey), ScheduledTimer>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sends `cmd` into `tx` once `delay` has elapsed.
    pub fn schedule_once<C: Send + 'static>(
        self: &Arc<Self>,
        room: &str,
        key: TimerKey,
        delay: Duration,
        tx: mpsc::Sender<C>,
        cmd: C,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let slot = (room.to_string(), key.clone());

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = weak.upgrade() {
                scheduler.timers.remove_if(&slot, |_, t| t.id == id);
            }
            let _ = tx.send(cmd).await;
        });

        self.register(room, key, id, task.abort_handle());
    }

    /// Sends `make()` into `tx` every `period`, starting one period from now,
    /// until cancelled or the receiver is gone.
    pub fn schedule_interval<C, F>(
        self: &Arc<Self>,
        room: &str,
        key: TimerKey,
        period: Duration,
        tx: mpsc::Sender<C>,
        make: F,
    ) where
        C: Send + 'static,
        F: Fn() -> C + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if tx.send(make()).await.is_err() {
                    break;
                }
            }
        });

        self.register(room, key, id, task.abort_handle());
    }

    fn register(&self, room: &str, key: TimerKey, id: u64, handle: AbortHandle) {
        if let Some(previous) = self
            .timers
            .insert((room.to_string(), key), ScheduledTimer { id, handle })
        {
            previous.handle.abort();
        }
    }

    /// Cancels one timer. Returns whether anything was registered under the key.
    pub fn cancel(&self, room: &str, key: &TimerKey) -> bool {
        match self.timers.remove(&(room.to_string(), key.clone())) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer belonging to `room`.
    pub fn cancel_room(&self, room: &str) {
        self.timers.retain(|(r, _), timer| {
            if r == room {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    pub fn is_scheduled(&self, room: &str, key: &TimerKey) -> bool {
        self.timers.contains_key(&(room.to_string(), key.clone()))
    }
}

/// Countdown broadcast throttle: the first second, every tenth second, each of
/// the last ten seconds, and zero.
pub fn should_broadcast(remaining: u32, total: u32) -> bool {
    remaining == total || remaining <= 10 || remaining % 10 == 0
}
