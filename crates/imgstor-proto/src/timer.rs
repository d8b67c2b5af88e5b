//! Self-cancelling periodic poll timer.

use std::future::pending;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// A periodic timer that is either idle or armed for one deadline.
///
/// Daemons arm it when work is queued, await [`PollTimer::fired`] in their
/// select loop, then either [`rearm`](PollTimer::rearm) or
/// [`cancel`](PollTimer::cancel) once the queue drains.
#[derive(Debug, Clone)]
pub struct PollTimer {
    period: Duration,
    deadline: Option<Instant>,
}

impl PollTimer {
    /// Creates an idle timer.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    /// Poll period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Arms the timer one period from now unless it is already armed.
    pub fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.period);
        }
    }

    /// Arms the timer one period from now, replacing any deadline.
    pub fn rearm(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    /// Stops the timer.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True while a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Pending deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves at the deadline and leaves the timer idle. Never resolves
    /// while idle.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => pending::<()>().await,
        }
    }
}
