//! Inbound handshake message reassembly.
//!
//! Fragments are buffered per message sequence number until every byte of
//! the message is covered. Overlapping fragments are allowed; the first
//! bytes written for an offset are the ones kept.

use std::collections::{BTreeMap, BTreeSet};

use crate::buffer::Buf;
use crate::codec::{Fragment, Message};
use crate::types::MessageType;
use crate::Error;

/// When a complete message may be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Only the message at the next expected sequence.
    InOrder,
    /// Any complete message inside the window, lowest sequence first.
    AnyOrder,
}

/// Result of feeding one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Added new bytes to a message.
    Buffered,
    /// Nothing new: an already delivered message or bytes we hold.
    Duplicate,
    /// A zero-length fragment of a non-empty message.
    Discarded,
    /// Beyond the buffering window, ignored.
    TooFarAhead,
}

#[derive(Debug)]
struct MessageBuffer {
    msg_type: MessageType,
    total_len: u32,
    epoch: u16,
    data: Buf,
    /// Sorted, non-overlapping, non-adjacent covered ranges.
    covered: Vec<(u32, u32)>,
}

impl MessageBuffer {
    fn new(fragment: &Fragment) -> Self {
        let mut data = Buf::new();
        data.resize(fragment.total_len as usize, 0);
        MessageBuffer {
            msg_type: fragment.msg_type,
            total_len: fragment.total_len,
            epoch: fragment.epoch,
            data,
            covered: Vec::new(),
        }
    }

    fn is_complete(&self) -> bool {
        match self.covered.as_slice() {
            [] => self.total_len == 0,
            [(0, end)] => *end == self.total_len,
            _ => false,
        }
    }

    /// Copy the parts of `[start, end)` not yet covered. Returns whether
    /// anything new was written.
    fn write(&mut self, start: u32, bytes: &[u8]) -> bool {
        let end = start + bytes.len() as u32;
        let mut cursor = start;
        let mut wrote = false;

        for &(s, e) in &self.covered {
            if e <= cursor {
                continue;
            }
            if s >= end {
                break;
            }
            if s > cursor {
                copy_range(&mut self.data, start, bytes, cursor, s);
                wrote = true;
            }
            cursor = cursor.max(e);
            if cursor >= end {
                break;
            }
        }

        if cursor < end {
            copy_range(&mut self.data, start, bytes, cursor, end);
            wrote = true;
        }

        if wrote {
            self.cover(start, end);
        }
        wrote
    }

    fn cover(&mut self, start: u32, end: u32) {
        self.covered.push((start, end));
        self.covered.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.covered.len());
        for &(s, e) in &self.covered {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.covered = merged;
    }
}

/// Copy `bytes[from..to]` (message offsets, `bytes` starting at `start`).
fn copy_range(data: &mut Buf, start: u32, bytes: &[u8], from: u32, to: u32) {
    let src = &bytes[(from - start) as usize..(to - start) as usize];
    data[from as usize..to as usize].copy_from_slice(src);
}

/// Per-connection inbound reassembler.
#[derive(Debug)]
pub struct Reassembler {
    delivery: Delivery,
    next_seq: u16,
    max_ahead: u16,
    max_message_len: usize,
    max_buffered: usize,
    buffered: usize,
    buffers: BTreeMap<u16, MessageBuffer>,
    /// Delivered out of order, above `next_seq`.
    delivered: BTreeSet<u16>,
}

impl Reassembler {
    pub fn new(
        delivery: Delivery,
        max_ahead: u16,
        max_message_len: usize,
        max_buffered: usize,
    ) -> Self {
        Reassembler {
            delivery,
            next_seq: 0,
            max_ahead: max_ahead.max(1),
            max_message_len,
            max_buffered,
            buffered: 0,
            buffers: BTreeMap::new(),
            delivered: BTreeSet::new(),
        }
    }

    /// Lowest message sequence not yet delivered.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Bytes currently allocated to partial and undelivered messages.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Whether any message, partial or complete, is waiting.
    pub fn has_buffered(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Sequence numbers and types of every waiting message.
    pub fn buffered_messages(&self) -> impl Iterator<Item = (u16, MessageType)> + '_ {
        self.buffers.iter().map(|(seq, b)| (*seq, b.msg_type))
    }

    pub fn insert(&mut self, fragment: &Fragment) -> Result<Outcome, Error> {
        let seq = fragment.message_seq;

        if seq < self.next_seq || self.delivered.contains(&seq) {
            trace!("Duplicate fragment of message {}", seq);
            return Ok(Outcome::Duplicate);
        }

        if fragment.is_discard() {
            trace!("Discard fragment for message {}", seq);
            return Ok(Outcome::Discarded);
        }

        if seq - self.next_seq >= self.max_ahead {
            trace!(
                "Fragment of message {} too far ahead of {}",
                seq,
                self.next_seq
            );
            return Ok(Outcome::TooFarAhead);
        }

        if fragment.total_len as usize > self.max_message_len {
            warn!(
                "Handshake message {} too large: {} > {}",
                seq, fragment.total_len, self.max_message_len
            );
            return Err(Error::ExcessiveMessageSize(fragment.total_len as usize));
        }

        let created = if let Some(existing) = self.buffers.get(&seq) {
            if existing.msg_type != fragment.msg_type
                || existing.total_len != fragment.total_len
                || existing.epoch != fragment.epoch
            {
                return Err(Error::FragmentMismatch(seq));
            }
            false
        } else {
            let needed = self.buffered + fragment.total_len as usize;
            if needed > self.max_buffered {
                warn!(
                    "Buffered handshake data would exceed {}: {}",
                    self.max_buffered, needed
                );
                return Err(Error::BufferedDataExceeded(self.max_buffered));
            }
            self.buffered = needed;
            self.buffers.insert(seq, MessageBuffer::new(fragment));
            true
        };

        let Some(buffer) = self.buffers.get_mut(&seq) else {
            return Err(Error::InvalidState("message buffer vanished"));
        };

        if !created && buffer.is_complete() {
            return Ok(Outcome::Duplicate);
        }

        if buffer.write(fragment.offset, &fragment.data) || created {
            Ok(Outcome::Buffered)
        } else {
            Ok(Outcome::Duplicate)
        }
    }

    /// Whether the message `seq` has every byte.
    pub fn is_complete(&self, seq: u16) -> bool {
        self.buffers.get(&seq).map(|b| b.is_complete()).unwrap_or(false)
    }

    fn ready_seq(&self) -> Option<u16> {
        match self.delivery {
            Delivery::InOrder => self
                .is_complete(self.next_seq)
                .then_some(self.next_seq),
            Delivery::AnyOrder => self
                .buffers
                .iter()
                .find(|(_, b)| b.is_complete())
                .map(|(seq, _)| *seq),
        }
    }

    /// Release the next deliverable complete message.
    pub fn next_message(&mut self) -> Option<Message> {
        let seq = self.ready_seq()?;
        let buffer = self.buffers.remove(&seq)?;
        self.buffered -= buffer.total_len as usize;

        if seq == self.next_seq {
            self.next_seq = self.next_seq.wrapping_add(1);
            while self.delivered.remove(&self.next_seq) {
                self.next_seq = self.next_seq.wrapping_add(1);
            }
        } else {
            self.delivered.insert(seq);
        }

        Some(Message {
            msg_type: buffer.msg_type,
            message_seq: seq,
            epoch: buffer.epoch,
            body: buffer.data,
        })
    }
}
