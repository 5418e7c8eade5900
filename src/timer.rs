use std::time::{Duration, Instant};

/// Doubling retransmission interval with a ceiling and a bounded number of
/// expiries.
///
/// There is no jitter: with an externally driven clock the schedule must be
/// exactly reproducible.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start_rto: Duration,
    max_rto: Duration,
    max_timeouts: usize,
    rto: Duration,
    timeouts: usize,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, max_rto: Duration, max_timeouts: usize) -> Self {
        Self {
            start_rto,
            max_rto,
            max_timeouts,
            rto: start_rto,
            timeouts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.rto = self.start_rto;
        self.timeouts = 0;
    }

    /// Current interval.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Expiries seen since the last reset.
    pub fn timeouts(&self) -> usize {
        self.timeouts
    }

    /// Register an expiry. Returns false once the budget is exhausted, in
    /// which case the interval is left untouched.
    pub fn attempt(&mut self) -> bool {
        self.timeouts += 1;

        if self.timeouts >= self.max_timeouts {
            return false;
        }

        self.rto = self.rto.saturating_mul(2).min(self.max_rto);
        true
    }
}

/// A single deadline that is either armed or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn arm(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    /// Arm unless already armed, so repeated triggers never push the
    /// deadline further out.
    pub fn arm_if_idle(&mut self, at: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(at);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }
}

/// The earlier of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
