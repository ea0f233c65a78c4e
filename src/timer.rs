//! Mailbox poll timer with suspend/resume.
//!
//! The handler polls its mailbox every period. While it is blocked waiting
//! for a proposal answer the timer is suspended; the time left is kept and
//! used when the timer is resumed.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Periodic deadline for a single event loop.
#[derive(Debug)]
pub struct PollTimer {
    period: Duration,
    deadline: Option<Instant>,
    remaining: Option<Duration>,
}

impl PollTimer {
    /// Creates a timer armed for one full period.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: Some(Instant::now() + period),
            remaining: None,
        }
    }

    /// True while suspended.
    pub fn is_suspended(&self) -> bool {
        self.deadline.is_none()
    }

    /// Completes at the deadline; never completes while suspended.
    ///
    /// Cancel-safe, so it can sit in a `select!` arm.
    pub async fn tick(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Arms the timer for a full period from now.
    pub fn rearm(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
        self.remaining = None;
    }

    /// Stops the timer and records the time left.
    pub fn suspend(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            self.remaining = Some(deadline.saturating_duration_since(Instant::now()));
        }
    }

    /// Restarts the timer with the recorded time left, or a full period.
    pub fn resume(&mut self) {
        let wait = match self.remaining.take() {
            Some(left) if !left.is_zero() => left,
            _ => self.period,
        };
        self.deadline = Some(Instant::now() + wait);
    }

    /// Time left until the deadline, or the recorded remainder while suspended.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.remaining.unwrap_or(self.period),
        }
    }
}
