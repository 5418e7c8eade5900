//! Epoch and key bookkeeping for both directions.
//!
//! The write side keeps the current epoch plus any superseded epochs whose
//! records may still need retransmitting. Superseded write epochs are
//! dropped once `prior_epoch_expiration` has passed.
//!
//! The read side keeps the current epoch and at most one prior epoch. The
//! prior epoch is readable until its expiry instant.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::buffer::Buf;
use crate::crypto::RecordCipher;
use crate::types::MAX_SEQUENCE;
use crate::window::ReplayWindow;
use crate::Error;

/// The epoch after `epoch`. Fails closed instead of wrapping.
pub fn next_epoch(epoch: u16) -> Result<u16, Error> {
    epoch.checked_add(1).ok_or(Error::EpochOverflow)
}

/// What to do with a record at some epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochCheck {
    /// Current or unexpired prior epoch.
    Accept,
    /// Ahead of the current read epoch, within the allowed skew.
    Defer,
    /// Older than anything we can still read.
    Stale,
    /// Too far ahead.
    TooFar,
}

struct WriteState {
    cipher: Option<Box<dyn RecordCipher>>,
    next_seq: u64,
    retired_at: Option<Instant>,
}

struct ReadState {
    epoch: u16,
    cipher: Option<Box<dyn RecordCipher>>,
    window: ReplayWindow,
}

pub struct EpochTable {
    retention: Duration,
    max_skew: u16,
    horizon: u16,

    current_write: u16,
    write: BTreeMap<u16, WriteState>,

    read: ReadState,
    prior_read: Option<(ReadState, Instant)>,
}

impl EpochTable {
    pub fn new(retention: Duration, max_skew: u16) -> Self {
        let mut write = BTreeMap::new();
        write.insert(
            0,
            WriteState {
                cipher: None,
                next_seq: 0,
                retired_at: None,
            },
        );

        EpochTable {
            retention,
            max_skew,
            horizon: 0,
            current_write: 0,
            write,
            read: ReadState {
                epoch: 0,
                cipher: None,
                window: ReplayWindow::new(),
            },
            prior_read: None,
        }
    }

    pub fn current_write_epoch(&self) -> u16 {
        self.current_write
    }

    pub fn current_read_epoch(&self) -> u16 {
        self.read.epoch
    }

    /// Switch sending to `new`. The superseded epoch stays sealable until
    /// `now + prior_epoch_expiration`.
    pub fn advance_write_epoch(
        &mut self,
        new: u16,
        cipher: Option<Box<dyn RecordCipher>>,
        now: Instant,
    ) -> Result<(), Error> {
        if new <= self.current_write {
            return Err(Error::EpochRegression {
                current: self.current_write,
                new,
            });
        }

        if let Some(old) = self.write.get_mut(&self.current_write) {
            old.retired_at = Some(now);
        }

        debug!("Write epoch {} -> {}", self.current_write, new);
        self.write.insert(
            new,
            WriteState {
                cipher,
                next_seq: 0,
                retired_at: None,
            },
        );
        self.current_write = new;
        self.expire(now);

        Ok(())
    }

    /// Switch receiving to `new`. The current epoch becomes the prior one
    /// and any older prior epoch is forgotten.
    pub fn advance_read_epoch(
        &mut self,
        new: u16,
        cipher: Option<Box<dyn RecordCipher>>,
        now: Instant,
    ) -> Result<(), Error> {
        if new <= self.read.epoch {
            return Err(Error::EpochRegression {
                current: self.read.epoch,
                new,
            });
        }

        debug!("Read epoch {} -> {}", self.read.epoch, new);
        let old = std::mem::replace(
            &mut self.read,
            ReadState {
                epoch: new,
                cipher,
                window: ReplayWindow::new(),
            },
        );
        self.prior_read = Some((old, now + self.retention));

        Ok(())
    }

    /// Forget epochs whose retention has run out.
    pub fn expire(&mut self, now: Instant) {
        let retention = self.retention;
        self.write.retain(|epoch, state| match state.retired_at {
            Some(at) if now >= at + retention => {
                trace!("Forget write epoch {}", epoch);
                false
            }
            _ => true,
        });

        if let Some((prior, expires)) = &self.prior_read {
            if now >= *expires {
                trace!("Forget read epoch {}", prior.epoch);
                self.prior_read = None;
            }
        }
    }

    /// Hold back records up to `epoch` even beyond the skew. Used while
    /// the peer's current flight spans epochs we have no keys for yet.
    pub fn set_read_horizon(&mut self, epoch: u16) {
        self.horizon = epoch;
    }

    fn defer_limit(&self) -> u16 {
        self.read
            .epoch
            .saturating_add(self.max_skew)
            .max(self.horizon)
    }

    pub fn is_acceptable_for_read(&self, epoch: u16, now: Instant) -> bool {
        self.check_read(epoch, now) == EpochCheck::Accept
    }

    pub fn check_read(&self, epoch: u16, now: Instant) -> EpochCheck {
        if epoch == self.read.epoch {
            return EpochCheck::Accept;
        }

        if epoch > self.read.epoch {
            return if epoch <= self.defer_limit() {
                EpochCheck::Defer
            } else {
                EpochCheck::TooFar
            };
        }

        match &self.prior_read {
            Some((prior, expires)) if prior.epoch == epoch && now < *expires => EpochCheck::Accept,
            _ => EpochCheck::Stale,
        }
    }

    /// Readable epochs whose low two bits are `bits`, current first.
    pub fn read_candidates(&self, bits: u8, now: Instant) -> impl Iterator<Item = u16> {
        let current = Some(self.read.epoch);
        let prior = self
            .prior_read
            .as_ref()
            .filter(|(_, expires)| now < *expires)
            .map(|(p, _)| p.epoch);

        current
            .into_iter()
            .chain(prior)
            .filter(move |e| (*e as u8) & 0b11 == bits)
    }

    /// A deferrable future epoch with low bits `bits`, if any.
    pub fn future_candidate(&self, bits: u8) -> Option<u16> {
        let from = self.read.epoch.saturating_add(1);
        (from..=self.defer_limit())
            .take(4)
            .find(|e| (*e as u8) & 0b11 == bits)
    }

    fn read_state(&self, epoch: u16) -> Option<&ReadState> {
        if self.read.epoch == epoch {
            return Some(&self.read);
        }
        match &self.prior_read {
            Some((prior, _)) if prior.epoch == epoch => Some(prior),
            _ => None,
        }
    }

    fn read_state_mut(&mut self, epoch: u16) -> Option<&mut ReadState> {
        if self.read.epoch == epoch {
            return Some(&mut self.read);
        }
        match &mut self.prior_read {
            Some((prior, _)) if prior.epoch == epoch => Some(prior),
            _ => None,
        }
    }

    /// Rebuild a truncated sequence number against the epoch's window.
    pub fn reconstruct_sequence(&self, epoch: u16, low: u64, bits: u32) -> u64 {
        match self.read_state(epoch) {
            Some(state) => state.window.reconstruct(low, bits),
            None => low,
        }
    }

    pub fn is_fresh(&self, epoch: u16, sequence: u64) -> bool {
        self.read_state(epoch)
            .map(|s| s.window.is_fresh(sequence))
            .unwrap_or(false)
    }

    pub fn mark_received(&mut self, epoch: u16, sequence: u64) {
        if let Some(state) = self.read_state_mut(epoch) {
            state.window.mark(sequence);
        }
    }

    /// Decrypt a record body in place. Plaintext epochs pass through.
    pub fn open(
        &mut self,
        epoch: u16,
        sequence: u64,
        aad: &[u8],
        data: &mut Buf,
    ) -> Result<(), Error> {
        let state = self.read_state_mut(epoch).ok_or(Error::MissingKeys(epoch))?;
        match &mut state.cipher {
            Some(cipher) => cipher.open(sequence, aad, data),
            None if epoch == 0 => Ok(()),
            None => Err(Error::MissingKeys(epoch)),
        }
    }

    /// Whether records can still be sealed at `epoch`.
    pub fn can_write(&self, epoch: u16) -> bool {
        self.write.contains_key(&epoch)
    }

    /// Bytes sealing adds at `epoch`.
    pub fn write_overhead(&self, epoch: u16) -> usize {
        self.write
            .get(&epoch)
            .and_then(|s| s.cipher.as_ref())
            .map(|c| c.overhead())
            .unwrap_or(0)
    }

    /// Allocate the next sequence number at `epoch`.
    pub fn next_write_sequence(&mut self, epoch: u16) -> Result<u64, Error> {
        let state = self.write.get_mut(&epoch).ok_or(Error::MissingKeys(epoch))?;
        if state.next_seq > MAX_SEQUENCE {
            warn!("Sequence numbers exhausted in epoch {}", epoch);
            return Err(Error::SequenceExhausted(epoch));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        Ok(seq)
    }

    /// Encrypt a record body in place. Plaintext epochs pass through.
    pub fn seal(
        &mut self,
        epoch: u16,
        sequence: u64,
        aad: &[u8],
        data: &mut Buf,
    ) -> Result<(), Error> {
        let state = self.write.get_mut(&epoch).ok_or(Error::MissingKeys(epoch))?;
        match &mut state.cipher {
            Some(cipher) => cipher.seal(sequence, aad, data),
            None if epoch == 0 => Ok(()),
            None => Err(Error::MissingKeys(epoch)),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_write_sequence(&mut self, epoch: u16, seq: u64) {
        if let Some(state) = self.write.get_mut(&epoch) {
            state.next_seq = seq;
        }
    }
}

impl std::fmt::Debug for EpochTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTable")
            .field("write", &self.current_write)
            .field("retained", &self.write.keys().collect::<Vec<_>>())
            .field("read", &self.read.epoch)
            .field("prior_read", &self.prior_read.as_ref().map(|(p, _)| p.epoch))
            .finish()
    }
}

/// Raw records that arrived for an epoch we cannot read yet.
#[derive(Debug, Default)]
pub struct DeferredRecords {
    records: VecDeque<(u16, Buf)>,
}

impl DeferredRecords {
    pub fn push(&mut self, epoch: u16, record: Buf, max: usize) -> Result<(), Error> {
        if self.records.len() >= max {
            warn!("Receive queue full (max {})", max);
            return Err(Error::ReceiveQueueFull);
        }
        trace!("Defer record for epoch {}", epoch);
        self.records.push_back((epoch, record));
        Ok(())
    }

    /// Take every record that is now readable. Records that fell behind
    /// are discarded.
    pub fn take_ready(&mut self, table: &EpochTable, now: Instant) -> Vec<Buf> {
        let mut ready = Vec::new();
        let mut keep = VecDeque::with_capacity(self.records.len());

        for (epoch, record) in self.records.drain(..) {
            match table.check_read(epoch, now) {
                EpochCheck::Accept => ready.push(record),
                EpochCheck::Defer => keep.push_back((epoch, record)),
                EpochCheck::Stale | EpochCheck::TooFar => {}
            }
        }

        self.records = keep;
        ready
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
