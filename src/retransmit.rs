//! Retransmission of our outstanding flight and acknowledgement of the
//! peer's records.
//!
//! Every record of an outgoing flight is a slot holding its plaintext body,
//! so it can be sealed again under a fresh record number when resent. With
//! explicit ACKs, slots are acknowledged one by one and only the remaining
//! ones go out on the next expiry. With implicit acknowledgement the whole
//! flight is retired at once when the peer's next flight arrives.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use crate::buffer::Buf;
use crate::codec::Ack;
use crate::timer::{earliest, ExponentialBackoff, Timer};
use crate::types::{ContentType, MessageType, RecordNumber};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The peer's next flight acknowledges ours.
    Implicit,
    /// ACK records name individual record numbers.
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightStatus {
    Unsent,
    AwaitingAck { sent_at: Instant, retries: usize },
    FullyAcked,
    Abandoned,
}

/// What an incoming ACK did to the outstanding flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// Nothing new was acknowledged.
    Ignored,
    /// Some slots are still unacknowledged.
    Partial,
    /// Every slot is acknowledged.
    Complete,
}

/// One record of the outstanding flight.
#[derive(Debug)]
pub struct Slot {
    pub content_type: ContentType,
    pub epoch: u16,
    /// Handshake message the record carries part of, if any.
    pub msg_type: Option<MessageType>,
    pub payload: Buf,
    pub acked: bool,
}

#[derive(Debug)]
pub struct Retransmitter {
    mode: AckMode,
    backoff: ExponentialBackoff,
    timer: Timer,
    status: FlightStatus,
    slots: Vec<Slot>,
    /// Record numbers we sent, oldest first, with the slot they carried.
    sent: VecDeque<(RecordNumber, usize)>,
    max_tracked: usize,

    pending_acks: BTreeSet<RecordNumber>,
    max_pending: usize,
    ack_timer: Timer,
}

impl Retransmitter {
    pub fn new(
        mode: AckMode,
        initial_rto: Duration,
        max_rto: Duration,
        max_timeouts: usize,
        max_tracked: usize,
        max_pending: usize,
    ) -> Self {
        Retransmitter {
            mode,
            backoff: ExponentialBackoff::new(initial_rto, max_rto, max_timeouts),
            timer: Timer::default(),
            status: FlightStatus::Unsent,
            slots: Vec::new(),
            sent: VecDeque::new(),
            max_tracked: max_tracked.max(1),
            pending_acks: BTreeSet::new(),
            max_pending: max_pending.max(1),
            ack_timer: Timer::default(),
        }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    pub fn status(&self) -> FlightStatus {
        self.status
    }

    pub fn rto(&self) -> Duration {
        self.backoff.rto()
    }

    /// Start a new outgoing flight, dropping whatever the previous one held.
    pub fn begin_flight(&mut self) {
        debug!("Begin flight");
        self.slots.clear();
        self.sent.clear();
        self.backoff.reset();
        self.timer.disarm();
        self.status = FlightStatus::Unsent;
    }

    /// Append a record to the outstanding flight. Returns its slot index.
    pub fn add_slot(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        msg_type: Option<MessageType>,
        payload: Buf,
    ) -> usize {
        self.slots.push(Slot {
            content_type,
            epoch,
            msg_type,
            payload,
            acked: false,
        });
        if self.status == FlightStatus::FullyAcked {
            self.status = FlightStatus::Unsent;
        }
        self.slots.len() - 1
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Indexes of slots still waiting for acknowledgement.
    pub fn unacked(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.acked)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether any slot is still waiting.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            FlightStatus::Unsent | FlightStatus::AwaitingAck { .. }
        ) && self.slots.iter().any(|s| !s.acked)
    }

    /// Remember that `number` carried slot `index`.
    pub fn record_sent(&mut self, index: usize, number: RecordNumber) {
        if self.sent.len() >= self.max_tracked {
            if let Some((forgotten, _)) = self.sent.pop_front() {
                trace!("Forget sent record {}", forgotten);
            }
        }
        self.sent.push_back((number, index));
    }

    /// The flight went out. Arms the retransmission timer unless `arm` is
    /// false, which is used for flights resent only on demand.
    pub fn flight_sent(&mut self, now: Instant, arm: bool) {
        let retries = match self.status {
            FlightStatus::AwaitingAck { retries, .. } => retries,
            _ => 0,
        };
        self.status = FlightStatus::AwaitingAck {
            sent_at: now,
            retries,
        };

        if arm {
            let at = now + self.backoff.rto();
            debug!(
                "Flight timeout in {:.03}s",
                self.backoff.rto().as_secs_f32()
            );
            self.timer.arm(at);
        } else {
            self.timer.disarm();
        }
    }

    /// The peer's response acknowledges our whole flight.
    pub fn retire(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        debug!("Flight implicitly acknowledged");
        for slot in &mut self.slots {
            slot.acked = true;
        }
        self.status = FlightStatus::FullyAcked;
        self.timer.disarm();
        self.backoff.reset();
    }

    /// Give up on a slot that can no longer be sent.
    pub fn drop_slot(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.acked = true;
        }
        if !self.slots.is_empty() && self.slots.iter().all(|s| s.acked) {
            self.status = FlightStatus::FullyAcked;
            self.timer.disarm();
        }
    }

    /// Apply an incoming ACK. `write_epoch` is our current write epoch; the
    /// peer cannot acknowledge records from beyond it.
    pub fn on_ack(
        &mut self,
        ack: &Ack,
        write_epoch: u16,
        now: Instant,
    ) -> Result<AckResult, Error> {
        if ack.record_numbers.iter().any(|rn| rn.epoch > write_epoch) {
            return Err(Error::MalformedAck("epoch above write epoch"));
        }

        // Epochs whose write keys are gone only name forgotten records.
        // Those are absorbed like any unknown record number.
        let mut newly = 0;
        for rn in &ack.record_numbers {
            let Some(&(_, index)) = self.sent.iter().find(|(n, _)| n == rn) else {
                trace!("ACK for unknown record {}", rn);
                continue;
            };
            if let Some(slot) = self.slots.get_mut(index) {
                if !slot.acked {
                    slot.acked = true;
                    newly += 1;
                }
            }
        }

        if newly == 0 {
            return Ok(AckResult::Ignored);
        }

        if self.slots.iter().all(|s| s.acked) {
            debug!("Flight fully acknowledged");
            self.status = FlightStatus::FullyAcked;
            self.timer.disarm();
            self.backoff.reset();
            return Ok(AckResult::Complete);
        }

        // Progress, but not done: restart the wait at the current interval.
        if self.timer.is_armed() {
            self.timer.arm(now + self.backoff.rto());
        }
        trace!(
            "Partial ACK: {} slots remain",
            self.slots.iter().filter(|s| !s.acked).count()
        );
        Ok(AckResult::Partial)
    }

    /// Check the retransmission timer. Returns true when the unacknowledged
    /// slots should be resent now.
    pub fn poll_timeout(&mut self, now: Instant) -> Result<bool, Error> {
        if !self.timer.is_due(now) {
            return Ok(false);
        }

        if !self.backoff.attempt() {
            warn!(
                "Flight not acknowledged after {} timeouts",
                self.backoff.timeouts()
            );
            self.status = FlightStatus::Abandoned;
            self.timer.disarm();
            return Err(Error::ReadTimeout(self.backoff.timeouts()));
        }

        if let FlightStatus::AwaitingAck { retries, .. } = &mut self.status {
            *retries += 1;
        }

        debug!(
            "Flight timeout, resend and re-arm in {:.03}s",
            self.backoff.rto().as_secs_f32()
        );
        self.timer.arm(now + self.backoff.rto());
        Ok(true)
    }

    /// Queue a received record number for the next ACK.
    pub fn pending_ack(&mut self, number: RecordNumber, now: Instant) {
        if self.pending_acks.len() >= self.max_pending && !self.pending_acks.contains(&number) {
            if let Some(oldest) = self.pending_acks.pop_first() {
                trace!("Pending ACK set full, drop {}", oldest);
            }
        }
        self.pending_acks.insert(number);
        self.ack_timer.arm_if_idle(now + self.backoff.rto() / 4);
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// Drain the pending set into an ACK and disarm the ACK timer.
    pub fn take_ack(&mut self) -> Ack {
        self.ack_timer.disarm();
        let numbers = std::mem::take(&mut self.pending_acks);
        Ack::new(numbers.into_iter().collect())
    }

    /// Our next flight acknowledges the peer's records implicitly.
    pub fn clear_pending_acks(&mut self) {
        self.pending_acks.clear();
        self.ack_timer.disarm();
    }

    pub fn ack_due(&self, now: Instant) -> bool {
        self.ack_timer.is_due(now) && self.has_pending_acks()
    }

    pub fn flight_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_timer.deadline()
    }

    /// The earlier of the two armed deadlines.
    pub fn next_timeout(&self) -> Option<Instant> {
        earliest(self.timer.deadline(), self.ack_timer.deadline())
    }
}
