use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutKind {
    Connect,
    Response,
    Deadline,
}

impl TimeoutKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Response => "response",
            Self::Deadline => "deadline",
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Connect and response limits apply to every attempt; the deadline spans the
/// whole logical call, redirects and retries included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeoutSettings {
    connect: Option<Duration>,
    response: Option<Duration>,
    deadline: Option<Duration>,
}

impl TimeoutSettings {
    pub const fn new() -> Self {
        Self {
            connect: None,
            response: None,
            deadline: None,
        }
    }

    pub fn connect(mut self, connect: Duration) -> Self {
        self.connect = Some(connect.max(Duration::from_millis(1)));
        self
    }

    pub fn response(mut self, response: Duration) -> Self {
        self.response = Some(response.max(Duration::from_millis(1)));
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline.max(Duration::from_millis(1)));
        self
    }

    pub const fn connect_timeout(&self) -> Option<Duration> {
        self.connect
    }

    pub const fn response_timeout(&self) -> Option<Duration> {
        self.response
    }

    pub const fn deadline_timeout(&self) -> Option<Duration> {
        self.deadline
    }

    /// Fields set on `self` win; unset ones fall back to `defaults`.
    pub fn or(self, defaults: TimeoutSettings) -> Self {
        Self {
            connect: self.connect.or(defaults.connect),
            response: self.response.or(defaults.response),
            deadline: self.deadline.or(defaults.deadline),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    started_at: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub(crate) fn start(budget: Option<Duration>) -> Self {
        Self {
            started_at: Instant::now(),
            budget,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn expires_at(&self) -> Option<Instant> {
        self.budget.map(|budget| self.started_at + budget)
    }

    pub(crate) fn is_unbounded(&self) -> bool {
        self.budget.is_none()
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        match self.budget {
            Some(budget) => self.elapsed() >= budget,
            None => false,
        }
    }

    /// `None` when sleeping for `delay` would run past the deadline.
    pub(crate) fn bounded_delay(&self, delay: Duration) -> Option<Duration> {
        let Some(budget) = self.budget else {
            return Some(delay);
        };
        let elapsed = self.elapsed();
        if elapsed >= budget {
            return None;
        }
        let remaining = budget - elapsed;
        if delay >= remaining {
            return None;
        }
        Some(delay)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimedOut {
    pub(crate) kind: TimeoutKind,
    pub(crate) elapsed: Duration,
}

/// Runs `future` until it completes, the phase limit passes, or the call
/// deadline passes, whichever happens first. When both timers would expire at
/// the same instant the phase wins the tag.
pub(crate) async fn race<F>(
    phase: TimeoutKind,
    phase_limit: Option<Duration>,
    deadline: &Deadline,
    future: F,
) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    let phase_started = Instant::now();
    let phase_expiry = phase_limit.map(|limit| phase_started + limit);
    let (expiry, kind) = match (phase_expiry, deadline.expires_at()) {
        (Some(phase_at), Some(deadline_at)) if deadline_at < phase_at => {
            (deadline_at, TimeoutKind::Deadline)
        }
        (Some(phase_at), _) => (phase_at, phase),
        (None, Some(deadline_at)) => (deadline_at, TimeoutKind::Deadline),
        (None, None) => return Ok(future.await),
    };

    match tokio::time::timeout_at(expiry, future).await {
        Ok(output) => Ok(output),
        Err(_) => {
            let elapsed = match kind {
                TimeoutKind::Deadline => deadline.elapsed(),
                _ => phase_started.elapsed(),
            };
            Err(TimedOut { kind, elapsed })
        }
    }
}
