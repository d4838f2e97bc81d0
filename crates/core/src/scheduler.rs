//! Admission control and bandwidth sharing across upload sessions
//!
//! At most `max_concurrent_sessions` sessions are admitted; the rest wait in a
//! FIFO queue. Admitted sessions share one token bucket. Tokens are handed
//! out in `quantum`-sized grants to whichever waiting session is at the head
//! of the rotation, which then moves to the back (deficit round robin).
//! With a throttle window set, the bucket is bypassed outside those hours.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::TransferConfig;
use crate::error::{Result, VaultError};
use crate::schedule::{ThrottleWindow, UtcOffset};
use crate::session::{SessionId, SessionStatus};

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "admission", rename_all = "kebab-case")]
pub enum Admission {
    Admitted,
    /// `position` requests are ahead of this one
    Queued { position: usize },
    /// The queue is full
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub active: usize,
    pub queued: usize,
    pub paused: usize,
}

struct TokenBucket {
    rate: u64,
    capacity: u64,
    tokens: u64,
    last: Instant,
}

impl TokenBucket {
    /// Starts full.
    fn new(rate: u64, quantum: u64) -> Self {
        let capacity = rate.max(quantum);
        Self {
            rate,
            capacity,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last);
        let earned = elapsed.as_nanos() * u128::from(self.rate) / NANOS_PER_SEC;
        if earned == 0 {
            return;
        }
        let earned = u64::try_from(earned).unwrap_or(u64::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
        if self.tokens == self.capacity {
            self.last = now;
        } else {
            // Only advance by the time actually converted into tokens.
            let spent = u128::from(earned) * NANOS_PER_SEC / u128::from(self.rate);
            self.last += Duration::from_nanos(u64::try_from(spent).unwrap_or(u64::MAX));
        }
    }

    fn wait_for(&self, needed: u64) -> Duration {
        let short = needed.saturating_sub(self.tokens);
        let nanos = (u128::from(short) * NANOS_PER_SEC).div_ceil(u128::from(self.rate));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

struct State {
    active: HashSet<SessionId>,
    paused: HashSet<SessionId>,
    queue: VecDeque<SessionId>,
    /// Sessions waiting for bandwidth, head first
    ring: VecDeque<SessionId>,
    bucket: Option<TokenBucket>,
}

struct ThrottleHours {
    window: ThrottleWindow,
    offset: UtcOffset,
    clock: Arc<dyn Clock>,
}

pub struct TransferScheduler {
    max_active: usize,
    max_queue: usize,
    quantum: u64,
    hours: Option<ThrottleHours>,
    state: Mutex<State>,
    notify: Notify,
}

enum Step {
    Done,
    Wait(Option<Duration>),
}

impl TransferScheduler {
    #[must_use]
    pub fn new(config: &TransferConfig) -> Self {
        let quantum = config.bandwidth_quantum.max(1);
        Self {
            max_active: config.max_concurrent_sessions.max(1),
            max_queue: config.max_queue_depth,
            quantum,
            hours: None,
            state: Mutex::new(State {
                active: HashSet::new(),
                paused: HashSet::new(),
                queue: VecDeque::new(),
                ring: VecDeque::new(),
                bucket: config
                    .bandwidth_limit
                    .bytes_per_sec()
                    .map(|rate| TokenBucket::new(rate, quantum)),
            }),
            notify: Notify::new(),
        }
    }

    /// Only limit bandwidth while the local time (`offset` from UTC, read
    /// off `clock`) falls inside `window`.
    #[must_use]
    pub fn with_window(
        mut self,
        window: ThrottleWindow,
        offset: UtcOffset,
        clock: Arc<dyn Clock>,
    ) -> Self {
        self.hours = Some(ThrottleHours {
            window,
            offset,
            clock,
        });
        self
    }

    fn throttling(&self) -> bool {
        self.hours.as_ref().is_none_or(|h| {
            h.window
                .contains(h.offset.minute_of_day(h.clock.now_millis()))
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for a transfer slot. Asking again reports the current standing.
    pub fn admit(&self, id: SessionId) -> Admission {
        let mut state = self.lock();

        if state.active.contains(&id) {
            return Admission::Admitted;
        }
        if let Some(position) = state.queue.iter().position(|q| *q == id) {
            return Admission::Queued { position };
        }
        if state.active.len() < self.max_active {
            state.active.insert(id);
            debug!(session = %id, active = state.active.len(), "session admitted");
            return Admission::Admitted;
        }
        if state.queue.len() >= self.max_queue {
            info!(session = %id, queued = state.queue.len(), "admission rejected, queue full");
            return Admission::Rejected;
        }

        let position = state.queue.len();
        state.queue.push_back(id);
        debug!(session = %id, position, "session queued");
        Admission::Queued { position }
    }

    #[must_use]
    pub fn is_admitted(&self, id: &SessionId) -> bool {
        self.lock().active.contains(id)
    }

    /// Resolve once `id` holds a slot.
    ///
    /// # Errors
    /// Returns [`VaultError::SessionNotFound`] if the session is neither
    /// admitted nor queued, e.g. because it was cancelled while waiting.
    pub async fn wait_admitted(&self, id: SessionId) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.active.contains(&id) {
                    return Ok(());
                }
                if !state.queue.contains(&id) {
                    return Err(VaultError::SessionNotFound(id));
                }
            }

            notified.await;
        }
    }

    /// Free the slot held by `id` and admit the head of the queue.
    ///
    /// Returns the promoted session, if any.
    pub fn release(&self, id: &SessionId) -> Option<SessionId> {
        let promoted = {
            let mut state = self.lock();
            state.queue.retain(|q| q != id);
            state.ring.retain(|r| r != id);
            state.paused.remove(id);
            let freed = state.active.remove(id);

            let mut promoted = None;
            if freed && state.active.len() < self.max_active {
                if let Some(next) = state.queue.pop_front() {
                    state.active.insert(next);
                    promoted = Some(next);
                }
            }
            promoted
        };

        if let Some(next) = promoted {
            info!(released = %id, promoted = %next, "queued session admitted");
        }
        self.notify.notify_waiters();
        promoted
    }

    /// Drop a request that has not been admitted yet. Returns whether it was queued.
    pub fn cancel_queued(&self, id: &SessionId) -> bool {
        let removed = {
            let mut state = self.lock();
            let before = state.queue.len();
            state.queue.retain(|q| q != id);
            state.queue.len() != before
        };
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    /// Paused sessions leave the bandwidth rotation until resumed.
    pub fn set_paused(&self, id: SessionId, paused: bool) {
        {
            let mut state = self.lock();
            if paused {
                state.paused.insert(id);
                state.ring.retain(|r| *r != id);
            } else {
                state.paused.remove(&id);
            }
        }
        self.notify.notify_waiters();
    }

    /// Wait until `bytes` of bandwidth have been granted to `id`.
    ///
    /// # Errors
    /// - [`VaultError::NotAdmitted`] if the session is still queued
    /// - [`VaultError::SessionNotAccepting`] if the session is paused
    /// - [`VaultError::SessionNotFound`] if the session holds no slot
    pub async fn acquire(&self, id: SessionId, bytes: u64) -> Result<()> {
        let mut remaining = bytes;
        let _ring = RingGuard {
            scheduler: self,
            id,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.lock();
                self.check_runnable(&state, id)?;
                self.step(&mut state, id, &mut remaining)
            };

            match step {
                Step::Done => return Ok(()),
                Step::Wait(None) => notified.await,
                Step::Wait(Some(delay)) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn check_runnable(&self, state: &State, id: SessionId) -> Result<()> {
        if state.paused.contains(&id) {
            return Err(VaultError::SessionNotAccepting {
                session: id,
                status: SessionStatus::Paused,
            });
        }
        if state.active.contains(&id) {
            return Ok(());
        }
        if state.queue.contains(&id) {
            return Err(VaultError::NotAdmitted(id));
        }
        Err(VaultError::SessionNotFound(id))
    }

    fn step(&self, state: &mut State, id: SessionId, remaining: &mut u64) -> Step {
        let State { bucket, ring, .. } = state;
        let Some(bucket) = bucket.as_mut() else {
            return Step::Done;
        };
        if *remaining == 0 || !self.throttling() {
            return Step::Done;
        }

        if !ring.contains(&id) {
            ring.push_back(id);
        }
        if ring.front() != Some(&id) {
            return Step::Wait(None);
        }

        bucket.refill(Instant::now());
        let grant = (*remaining).min(self.quantum);
        if bucket.tokens < grant {
            return Step::Wait(Some(bucket.wait_for(grant)));
        }

        bucket.tokens -= grant;
        *remaining -= grant;
        ring.pop_front();
        self.notify.notify_waiters();

        if *remaining == 0 {
            Step::Done
        } else {
            ring.push_back(id);
            Step::Wait(None)
        }
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        SchedulerStats {
            active: state.active.len(),
            queued: state.queue.len(),
            paused: state.paused.len(),
        }
    }
}

/// Takes a session out of the rotation when its `acquire` ends or is dropped.
struct RingGuard<'a> {
    scheduler: &'a TransferScheduler,
    id: SessionId,
}

impl Drop for RingGuard<'_> {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.scheduler.lock();
            let before = state.ring.len();
            state.ring.retain(|r| *r != self.id);
            state.ring.len() != before
        };
        if removed {
            self.scheduler.notify.notify_waiters();
        }
    }
}
