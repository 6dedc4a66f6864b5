//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// How a pending expiry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Expired,
    /// Replaced by a re-arm or an explicit cancel; the owner takes no action.
    Cancelled,
}

/// Single-pending deadline owned by the control loop.
///
/// Arming while armed replaces the pending expiry, so there is never more
/// than one outstanding deadline per timer.
#[derive(Debug)]
pub struct DeadlineTimer {
    label: &'static str,
    deadline: Option<Instant>,
}

impl DeadlineTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            deadline: None,
        }
    }

    /// Arm `after` from now. Returns [`TimerEvent::Cancelled`] when a pending
    /// expiry was replaced.
    pub fn arm(&mut self, after: Duration) -> Option<TimerEvent> {
        let replaced = self
            .deadline
            .replace(Instant::now() + after)
            .map(|_| TimerEvent::Cancelled);
        if replaced.is_some() {
            debug!(timer = self.label, "pending expiry cancelled by re-arm");
        }
        replaced
    }

    pub fn cancel(&mut self) -> Option<TimerEvent> {
        let cancelled = self.deadline.take().map(|_| TimerEvent::Cancelled);
        if cancelled.is_some() {
            debug!(timer = self.label, "pending expiry cancelled");
        }
        cancelled
    }

    /// Consume the pending expiry, if any.
    pub fn fire(&mut self) -> Option<TimerEvent> {
        self.deadline.take().map(|_| TimerEvent::Expired)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Resolve at `deadline`, or never when there is none.
pub async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
