//! Per-request phase machine
//!
//! Pure transition function: receives the current phase and an event,
//! returns the next phase. The gateway performs the I/O and reports what
//! happened; the phase decides whether a failed attempt is retried.
//!
//! `Received → Acquiring → Streaming → Completing → Succeeded`, with
//! `Streaming → Acquiring` for a retry and `Failed` reachable from every
//! non-terminal phase.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    /// Claiming a credential for attempt `attempt` (1-based)
    Acquiring { attempt: u32 },
    /// Upstream call in progress
    Streaming { attempt: u32, delivered: bool },
    /// Cleaning the assembled answer
    Completing,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Received => "received",
            Phase::Acquiring { .. } => "acquiring",
            Phase::Streaming { .. } => "streaming",
            Phase::Completing => "completing",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Request parsed and accepted
    Accepted,
    /// A credential was claimed
    Acquired,
    /// No credential available; never retried
    Exhausted,
    /// First chunk forwarded to the caller; retries are off from here on
    Delivered,
    /// The upstream call failed
    UpstreamFailed,
    /// The upstream call finished
    UpstreamDone,
    /// Output cleaned and response ready
    Cleaned,
    /// Caller went away or the service is shutting down
    Cancelled,
    /// Request could not be served for a reason outside the pool
    Rejected,
}

/// Handle a phase transition. Pure function: no I/O.
pub fn next(phase: Phase, event: PhaseEvent, max_attempts: u32) -> Phase {
    match (phase, event) {
        (Phase::Received, PhaseEvent::Accepted) => Phase::Acquiring { attempt: 1 },

        (Phase::Acquiring { attempt }, PhaseEvent::Acquired) => Phase::Streaming {
            attempt,
            delivered: false,
        },
        (Phase::Acquiring { .. }, PhaseEvent::Exhausted) => Phase::Failed,

        (Phase::Streaming { attempt, .. }, PhaseEvent::Delivered) => Phase::Streaming {
            attempt,
            delivered: true,
        },
        (
            Phase::Streaming {
                attempt,
                delivered: false,
            },
            PhaseEvent::UpstreamFailed,
        ) if attempt < max_attempts => Phase::Acquiring {
            attempt: attempt + 1,
        },
        (Phase::Streaming { .. }, PhaseEvent::UpstreamFailed) => Phase::Failed,
        (Phase::Streaming { .. }, PhaseEvent::UpstreamDone) => Phase::Completing,

        (Phase::Completing, PhaseEvent::Cleaned) => Phase::Succeeded,

        (phase, PhaseEvent::Cancelled | PhaseEvent::Rejected) if !phase.is_terminal() => {
            Phase::Failed
        }

        // Invalid/unhandled transition: stay in current phase
        (phase, _) => phase,
    }
}

/// Phase holder for one request; logs every change.
#[derive(Debug)]
pub struct RequestPhase {
    request_id: String,
    phase: Phase,
    max_attempts: u32,
}

impl RequestPhase {
    pub fn new(request_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            request_id: request_id.into(),
            phase: Phase::Received,
            max_attempts,
        }
    }

    pub fn current(&self) -> Phase {
        self.phase
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Apply an event and return the new phase.
    pub fn advance(&mut self, event: PhaseEvent) -> Phase {
        let from = self.phase;
        self.phase = next(from, event, self.max_attempts);
        if from != self.phase {
            debug!(
                request_id = self.request_id,
                from = from.name(),
                to = self.phase.name(),
                ?event,
                "request phase changed"
            );
        }
        self.phase
    }

    /// Attempt number while acquiring, `None` once retries are over.
    pub fn retry_attempt(&self) -> Option<u32> {
        match self.phase {
            Phase::Acquiring { attempt } => Some(attempt),
            _ => None,
        }
    }
}
