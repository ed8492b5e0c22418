//! Cooperative timers with identity-checked cancellation
//!
//! Timers fall into two categories with independent cancellation so a
//! presentation delay can never gate a correctness-critical transition:
//! [`TimerKind::Pacing`] covers reveal staggering and other UI feel,
//! [`TimerKind::Cadence`] covers simulated settlement latency and the
//! auto-play inter-cycle delay.
//!
//! A token is valid only while its entry is registered. Firing an
//! invalidated token yields nothing, which makes late callbacks no-ops even
//! across rapid re-arm of the same logical timer.

use std::time::Duration;
use tokio::time::Instant;

/// Timer category, cancelled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// UI feel. Safe to drop at any time.
    Pacing,
    /// Correctness-critical scheduling.
    Cadence,
}

/// Opaque identity of one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

struct TimerEntry<E> {
    token: TimerToken,
    kind: TimerKind,
    delay: Duration,
    deadline: Option<Instant>,
    event: E,
}

/// Registry of armed timers carrying their payload events.
///
/// The registry itself never sleeps; an async driver assigns deadlines and
/// decides when to fire, and tests fire tokens directly.
pub struct TimerRegistry<E> {
    next_id: u64,
    entries: Vec<TimerEntry<E>>,
}

impl<E> TimerRegistry<E> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    /// Arm a timer and return its token. Tokens are never reused.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration, event: E) -> TimerToken {
        let token = TimerToken(self.next_id);
        self.next_id += 1;
        self.entries.push(TimerEntry {
            token,
            kind,
            delay,
            deadline: None,
            event,
        });
        token
    }

    /// Cancel one timer. Returns whether it was still armed.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.token != token);
        self.entries.len() != before
    }

    /// Cancel every timer of a category. Returns how many were dropped.
    pub fn cancel_kind(&mut self, kind: TimerKind) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.kind != kind);
        before - self.entries.len()
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.entries.iter().any(|e| e.token == token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tokens of every armed timer, in arming order.
    pub fn tokens(&self) -> Vec<TimerToken> {
        self.entries.iter().map(|e| e.token).collect()
    }

    /// Consume a timer and return its payload. Identity check: a token that
    /// was cancelled or already fired yields `None`.
    pub fn fire(&mut self, token: TimerToken) -> Option<E> {
        let idx = self.entries.iter().position(|e| e.token == token)?;
        Some(self.entries.swap_remove(idx).event)
    }

    /// Assign concrete deadlines to entries armed since the last call.
    pub fn assign_deadlines(&mut self, now: Instant) {
        for entry in &mut self.entries {
            if entry.deadline.is_none() {
                entry.deadline = Some(now + entry.delay);
            }
        }
    }

    /// Earliest assigned deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|e| e.deadline).min()
    }

    /// Tokens whose deadline has passed.
    pub fn due(&self, now: Instant) -> Vec<TimerToken> {
        self.entries
            .iter()
            .filter(|e| e.deadline.is_some_and(|d| d <= now))
            .map(|e| e.token)
            .collect()
    }
}

impl<E> Default for TimerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
