//! Connection timer manager
//!
//! A single cooperative timer service shared across all connections: a
//! mutex-guarded schedule and one driver task. Expiries are never invoked
//! on the driver: they are delivered as [`TimerId`] values over the
//! `mpsc` sender registered with each timer, so the owning connection
//! processes them on its own task, serialized with its other events.
//!
//! Each connection scopes its timers through a [`TimerHandle`], so
//! identically-named timers of different connections live side by side in
//! the shared schedule and stopping is always confined to one connection.
//!
//! Guarantees:
//! - expiries are delivered in deadline order, ties broken by registration
//!   order;
//! - a stopped timer never fires, and `stop` followed by `add_timer` for the
//!   same id arms a fresh timer;
//! - stopping an already-stopped timer is a no-op.
//!
//! The driver holds only a `Weak` reference and exits once the manager is
//! dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::trace;

use crate::error::TimerError;

/// Connection timers driven by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// First routing activation request grace period
    InitialInactivity,
    /// Idle period in the activated state
    GeneralInactivity,
    /// Alive check response wait
    AliveCheck,
    /// Downstream (vehicle bus) response wait
    DownstreamResponse,
    /// Application-defined timer
    UserDefined,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Channel end expiries are delivered on.
pub type ExpirySender = mpsc::UnboundedSender<TimerId>;

struct TimerEntry {
    owner: u64,
    id: TimerId,
    duration: Duration,
    deadline: Instant,
    seq: u64,
    periodic: bool,
    notify: ExpirySender,
}

/// Cooperative timer service shared across connections. All mutation of
/// the schedule happens under the mutex; connections operate through
/// scoped [`TimerHandle`]s.
pub struct TimerManager {
    schedule: Mutex<Vec<TimerEntry>>,
    changed: Notify,
    next_seq: AtomicU64,
    next_owner: AtomicU64,
}

/// Upper bound on any single driver sleep, so a dropped manager is noticed
/// promptly even when nothing is scheduled.
const IDLE_POLL: Duration = Duration::from_millis(500);

impl TimerManager {
    /// Create a manager and spawn its driver task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(Self {
            schedule: Mutex::new(Vec::new()),
            changed: Notify::new(),
            next_seq: AtomicU64::new(0),
            next_owner: AtomicU64::new(0),
        });
        tokio::spawn(Self::drive(Arc::downgrade(&manager)));
        manager
    }

    fn add_timer(
        &self,
        owner: u64,
        id: TimerId,
        duration: Duration,
        notify: ExpirySender,
        periodic: bool,
    ) -> Result<(), TimerError> {
        let mut schedule = self.schedule.lock();
        if schedule
            .iter()
            .any(|entry| entry.owner == owner && entry.id == id)
        {
            return Err(TimerError::AlreadyArmed(id));
        }
        trace!(owner, %id, ?duration, periodic, "Arming timer");
        schedule.push(TimerEntry {
            owner,
            id,
            duration,
            deadline: Instant::now() + duration,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            periodic,
            notify,
        });
        drop(schedule);
        self.changed.notify_one();
        Ok(())
    }

    fn restart_timer(&self, owner: u64, id: TimerId) -> Result<(), TimerError> {
        let mut schedule = self.schedule.lock();
        let entry = schedule
            .iter_mut()
            .find(|entry| entry.owner == owner && entry.id == id)
            .ok_or(TimerError::NotArmed(id))?;
        entry.deadline = Instant::now() + entry.duration;
        trace!(owner, %id, "Restarted timer");
        drop(schedule);
        self.changed.notify_one();
        Ok(())
    }

    fn stop(&self, owner: u64, id: TimerId) -> bool {
        let mut schedule = self.schedule.lock();
        let before = schedule.len();
        schedule.retain(|entry| entry.owner != owner || entry.id != id);
        schedule.len() != before
    }

    fn stop_owner(&self, owner: u64) {
        self.schedule.lock().retain(|entry| entry.owner != owner);
    }

    fn is_armed(&self, owner: u64, id: TimerId) -> bool {
        self.schedule
            .lock()
            .iter()
            .any(|entry| entry.owner == owner && entry.id == id)
    }

    /// Extract due entries in (deadline, registration) order and return the
    /// next wake-up deadline.
    fn collect_due(&self, now: Instant) -> (Vec<(Instant, u64, TimerId, ExpirySender)>, Option<Instant>) {
        let mut schedule = self.schedule.lock();
        let mut due = Vec::new();
        let mut i = 0;
        while i < schedule.len() {
            if schedule[i].deadline <= now {
                if schedule[i].periodic {
                    let entry = &mut schedule[i];
                    due.push((entry.deadline, entry.seq, entry.id, entry.notify.clone()));
                    entry.deadline += entry.duration;
                    i += 1;
                } else {
                    let entry = schedule.swap_remove(i);
                    due.push((entry.deadline, entry.seq, entry.id, entry.notify));
                }
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|(deadline, seq, ..)| (*deadline, *seq));
        let next = schedule.iter().map(|entry| entry.deadline).min();
        (due, next)
    }

    async fn drive(weak: Weak<Self>) {
        loop {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let now = Instant::now();
            let (due, next) = manager.collect_due(now);
            for (_, _, id, notify) in due {
                // Receiver gone means the owning connection already
                // stopped; nothing to deliver to.
                let _ = notify.send(id);
            }
            // Sleep is capped so the task notices a dropped manager even
            // with an empty schedule; arming a timer wakes it early.
            let deadline = next.unwrap_or(now + IDLE_POLL).min(now + IDLE_POLL);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = manager.changed.notified() => {}
            }
        }
    }
}

/// A connection's view of the shared [`TimerManager`].
///
/// Every operation is confined to the timers this handle armed; two
/// handles may arm the same [`TimerId`] without colliding.
pub struct TimerHandle {
    manager: Arc<TimerManager>,
    owner: u64,
}

impl TimerHandle {
    /// Scope a connection's timers within the shared manager's schedule.
    /// Operations on the returned handle never touch another connection's
    /// timers.
    pub fn register(manager: &Arc<TimerManager>) -> Self {
        Self {
            manager: Arc::clone(manager),
            owner: manager.next_owner.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Arm `id` to fire after `duration`, delivering the id on `notify`.
    /// Periodic timers re-arm themselves on each fire.
    pub fn add_timer(
        &self,
        id: TimerId,
        duration: Duration,
        notify: ExpirySender,
        periodic: bool,
    ) -> Result<(), TimerError> {
        self.manager.add_timer(self.owner, id, duration, notify, periodic)
    }

    /// Re-arm an existing timer with its original duration.
    pub fn restart_timer(&self, id: TimerId) -> Result<(), TimerError> {
        self.manager.restart_timer(self.owner, id)
    }

    /// Cancel `id`. Returns whether a timer was actually armed; stopping a
    /// missing timer is a no-op.
    pub fn stop(&self, id: TimerId) -> bool {
        self.manager.stop(self.owner, id)
    }

    /// Cancel every timer this handle armed. Other connections' timers are
    /// untouched.
    pub fn stop_all(&self) {
        self.manager.stop_owner(self.owner);
    }

    /// Whether this handle currently has `id` armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.manager.is_armed(self.owner, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{advance, timeout};

    // All tests run on paused time: `advance` moves the clock and lets the
    // driver task observe the deadline without real waiting.

    async fn expect_fire(rx: &mut mpsc::UnboundedReceiver<TimerId>) -> TimerId {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer did not fire")
            .expect("channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_duration() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        timers
            .add_timer(TimerId::InitialInactivity, Duration::from_millis(100), tx, false)
            .unwrap();

        advance(Duration::from_millis(99)).await;
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(2)).await;
        assert_eq!(expect_fire(&mut rx).await, TimerId::InitialInactivity);
        assert!(!timers.is_armed(TimerId::InitialInactivity));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        timers
            .add_timer(TimerId::AliveCheck, Duration::from_millis(100), tx, false)
            .unwrap();

        assert!(timers.stop(TimerId::AliveCheck));
        advance(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        // Stopping again is a no-op.
        assert!(!timers.stop(TimerId::AliveCheck));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_add_arms_a_fresh_timer() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        timers
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(50), tx.clone(), false)
            .unwrap();
        timers.stop(TimerId::GeneralInactivity);
        timers
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(200), tx, false)
            .unwrap();

        // The cancelled 50 ms deadline must not fire.
        advance(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(150)).await;
        assert_eq!(expect_fire(&mut rx).await, TimerId::GeneralInactivity);
    }

    #[tokio::test(start_paused = true)]
    async fn double_add_is_rejected() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, _rx) = unbounded_channel();
        timers
            .add_timer(TimerId::AliveCheck, Duration::from_millis(10), tx.clone(), false)
            .unwrap();
        assert_eq!(
            timers.add_timer(TimerId::AliveCheck, Duration::from_millis(10), tx, false),
            Err(TimerError::AlreadyArmed(TimerId::AliveCheck))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_id_on_two_handles_does_not_collide() {
        let manager = TimerManager::new();
        let first = TimerHandle::register(&manager);
        let second = TimerHandle::register(&manager);
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();

        first
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(100), tx1, false)
            .unwrap();
        second
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(200), tx2, false)
            .unwrap();

        advance(Duration::from_millis(250)).await;
        assert_eq!(expect_fire(&mut rx1).await, TimerId::GeneralInactivity);
        assert_eq!(expect_fire(&mut rx2).await, TimerId::GeneralInactivity);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_is_scoped_to_the_handle() {
        let manager = TimerManager::new();
        let first = TimerHandle::register(&manager);
        let second = TimerHandle::register(&manager);
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();

        first
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(100), tx1, false)
            .unwrap();
        second
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(100), tx2, false)
            .unwrap();

        // One connection closing must not cancel the other's timers.
        first.stop_all();
        assert!(!first.is_armed(TimerId::GeneralInactivity));
        assert!(second.is_armed(TimerId::GeneralInactivity));

        advance(Duration::from_millis(150)).await;
        assert!(rx1.try_recv().is_err());
        assert_eq!(expect_fire(&mut rx2).await, TimerId::GeneralInactivity);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_rearms_with_original_duration() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        timers
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(100), tx, false)
            .unwrap();

        advance(Duration::from_millis(80)).await;
        timers.restart_timer(TimerId::GeneralInactivity).unwrap();

        // Old deadline passes without a fire.
        advance(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(60)).await;
        assert_eq!(expect_fire(&mut rx).await, TimerId::GeneralInactivity);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_of_unarmed_timer_fails() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        assert_eq!(
            timers.restart_timer(TimerId::DownstreamResponse),
            Err(TimerError::NotArmed(TimerId::DownstreamResponse))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiries_are_ordered_by_deadline_then_registration() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        // Same deadline: registration order decides. Later deadline last.
        timers
            .add_timer(TimerId::GeneralInactivity, Duration::from_millis(100), tx.clone(), false)
            .unwrap();
        timers
            .add_timer(TimerId::AliveCheck, Duration::from_millis(100), tx.clone(), false)
            .unwrap();
        timers
            .add_timer(TimerId::UserDefined, Duration::from_millis(150), tx, false)
            .unwrap();

        advance(Duration::from_millis(200)).await;
        assert_eq!(expect_fire(&mut rx).await, TimerId::GeneralInactivity);
        assert_eq!(expect_fire(&mut rx).await, TimerId::AliveCheck);
        assert_eq!(expect_fire(&mut rx).await, TimerId::UserDefined);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_keeps_firing_until_stopped() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        timers
            .add_timer(TimerId::UserDefined, Duration::from_millis(100), tx, true)
            .unwrap();

        for _ in 0..3 {
            advance(Duration::from_millis(100)).await;
            assert_eq!(expect_fire(&mut rx).await, TimerId::UserDefined);
        }

        timers.stop(TimerId::UserDefined);
        advance(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_clears_the_handle_schedule() {
        let manager = TimerManager::new();
        let timers = TimerHandle::register(&manager);
        let (tx, mut rx) = unbounded_channel();
        timers
            .add_timer(TimerId::InitialInactivity, Duration::from_millis(10), tx.clone(), false)
            .unwrap();
        timers
            .add_timer(TimerId::UserDefined, Duration::from_millis(20), tx, false)
            .unwrap();

        timers.stop_all();
        assert!(!timers.is_armed(TimerId::InitialInactivity));
        assert!(!timers.is_armed(TimerId::UserDefined));

        advance(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
