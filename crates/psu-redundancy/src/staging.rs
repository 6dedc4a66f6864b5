//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Warm-redundant staging state machine.
//!
//! Every rank-write batch is preceded by clearing all hardware ranks and a
//! fixed delay. Rotation and reconfiguration share this one machine, so at
//! most one apply is ever outstanding.
//!
//! ```text
//! Idle --begin--> WarmRedundantPending --warm_redundant_done--> ApplyPending --expire--> Idle
//!                         ^                                          |
//!                         +------------------begin-------------------+
//! ```

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::timer::{DeadlineTimer, TimerEvent};

/// What the delayed apply will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagedOperation {
    /// Advance every nonzero rank by one position.
    Rotate,
    /// Write in-memory ranks, recomputing them first when `rerank` is set.
    Reconfigure { rerank: bool },
}

impl StagedOperation {
    /// Combine a pending operation with a newer request.
    ///
    /// Reconfiguration wins over rotation and `rerank` is never dropped. A
    /// rotation superseded this way runs again at the next rotation period.
    pub fn merge(self, newer: StagedOperation) -> StagedOperation {
        use StagedOperation::*;
        match (self, newer) {
            (Reconfigure { rerank: a }, Reconfigure { rerank: b }) => Reconfigure { rerank: a || b },
            (Rotate, Reconfigure { .. }) => newer,
            (Reconfigure { .. }, Rotate) => self,
            (Rotate, Rotate) => Rotate,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StagedOperation::Rotate => "rotate",
            StagedOperation::Reconfigure { .. } => "reconfigure",
        }
    }
}

/// A staged operation tagged with the registry generation it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingApply {
    pub operation: StagedOperation,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Idle,
    /// Issued; the warm-redundant batch is being written.
    WarmRedundantPending(PendingApply),
    /// Warm redundant written; waiting out the delay.
    ApplyPending(PendingApply),
}

#[derive(Debug)]
pub struct StagingController {
    phase: StagePhase,
    timer: DeadlineTimer,
    delay: Duration,
}

impl StagingController {
    pub fn new(delay: Duration) -> Self {
        Self {
            phase: StagePhase::Idle,
            timer: DeadlineTimer::new("warm-redundant"),
            delay,
        }
    }

    pub fn phase(&self) -> StagePhase {
        self.phase
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self.phase, StagePhase::Idle)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Start a staged operation against `generation`.
    ///
    /// A pending apply for the same generation is merged into the new one and
    /// its expiry cancelled; one for an older generation is discarded.
    pub fn begin(&mut self, operation: StagedOperation, generation: u64) -> PendingApply {
        let effective = match self.phase {
            StagePhase::WarmRedundantPending(pending) | StagePhase::ApplyPending(pending)
                if pending.generation == generation =>
            {
                pending.operation.merge(operation)
            }
            _ => operation,
        };
        if self.timer.cancel() == Some(TimerEvent::Cancelled) {
            debug!(
                operation = effective.label(),
                generation, "superseded pending warm-redundant apply"
            );
        }
        let staged = PendingApply {
            operation: effective,
            generation,
        };
        self.phase = StagePhase::WarmRedundantPending(staged);
        staged
    }

    /// The warm-redundant batch has been attempted on every Normal PSU; start
    /// the delay.
    pub fn warm_redundant_done(&mut self) -> Option<Instant> {
        let StagePhase::WarmRedundantPending(staged) = self.phase else {
            return None;
        };
        self.phase = StagePhase::ApplyPending(staged);
        self.timer.arm(self.delay);
        self.timer.deadline()
    }

    /// Take the pending apply once its delay has run out.
    pub fn expire(&mut self) -> Option<PendingApply> {
        match (self.phase, self.timer.fire()) {
            (StagePhase::ApplyPending(staged), Some(TimerEvent::Expired)) => {
                self.phase = StagePhase::Idle;
                Some(staged)
            }
            _ => None,
        }
    }

    /// Drop whatever is staged without applying it.
    pub fn abandon(&mut self) -> Option<PendingApply> {
        self.timer.cancel();
        let abandoned = match self.phase {
            StagePhase::WarmRedundantPending(staged) | StagePhase::ApplyPending(staged) => {
                Some(staged)
            }
            StagePhase::Idle => None,
        };
        self.phase = StagePhase::Idle;
        abandoned
    }
}
