// ABOUTME: Liveness deadlines for a running container: hard ceiling, idle close, and close grace.
// ABOUTME: Deadlines are plain Instants recomputed on each output record and checked on a tick.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub hard: Duration,
    pub idle: Duration,
    pub grace: Duration,
}

/// What a deadline check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Quiet since the last record; ask the session to close
    Idle,
    /// A requested close was not honored in time
    GraceElapsed,
    /// No output for the hard ceiling
    Hard,
}

impl Expiry {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::GraceElapsed => "close_grace",
            Self::Hard => "hard",
        }
    }

    /// True when the container must be stopped now
    pub fn is_forced(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Before the first output record only the hard deadline runs, measured from
/// process start. Each record re-arms the idle deadline and pushes the hard
/// deadline to `max(hard, idle + grace)` past the record, so a session that
/// keeps producing output is never killed by the original ceiling.
///
/// A record that arrives after a close request means the session is still
/// working through messages queued ahead of the close. From then on the close
/// grace no longer applies and only the re-armed hard deadline can force a stop.
#[derive(Debug, Clone)]
pub struct LivenessDeadlines {
    timeouts: Timeouts,
    hard_at: Instant,
    idle_at: Option<Instant>,
    close_requested_at: Option<Instant>,
    active_after_close: bool,
}

impl LivenessDeadlines {
    pub fn new(timeouts: Timeouts, started: Instant) -> Self {
        Self {
            timeouts,
            hard_at: started + timeouts.hard,
            idle_at: None,
            close_requested_at: None,
            active_after_close: false,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        if self.close_requested_at.is_some() {
            self.active_after_close = true;
        }
        self.idle_at = Some(now + self.timeouts.idle);
        self.hard_at = now + self.timeouts.hard.max(self.timeouts.idle + self.timeouts.grace);
    }

    pub fn mark_close_requested(&mut self, now: Instant) {
        self.close_requested_at.get_or_insert(now);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested_at.is_some()
    }

    pub fn check(&self, now: Instant) -> Option<Expiry> {
        if now >= self.hard_at {
            return Some(Expiry::Hard);
        }
        match self.close_requested_at {
            Some(_) if self.active_after_close => None,
            Some(at) if now >= at + self.timeouts.grace => Some(Expiry::GraceElapsed),
            Some(_) => None,
            None => self
                .idle_at
                .filter(|idle_at| now >= *idle_at)
                .map(|_| Expiry::Idle),
        }
    }

    pub fn hard_deadline(&self) -> Instant {
        self.hard_at
    }

    /// How often to check: a quarter of the shortest window, between 10ms and 1s
    pub fn tick_interval(&self) -> Duration {
        let shortest = self
            .timeouts
            .hard
            .min(self.timeouts.idle)
            .min(self.timeouts.grace.max(Duration::from_millis(1)));
        (shortest / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}
