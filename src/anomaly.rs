//! Injectable transport and record anomalies.
//!
//! Every anomaly is a transformation of the datagrams produced by one
//! otherwise correct flight transmission. [`AnomalyHooks`] applies one of
//! them to a chosen flight of the plan.

use crate::buffer::Buf;
use crate::codec::{LEGACY_RECORD_HEADER_LEN, UNIFIED_FIXED_BITS, UNIFIED_FIXED_MASK};
use crate::hooks::{DatagramTag, FlightHooks};
use crate::rng::SeededRng;
use crate::types::{ContentType, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// Lose every datagram.
    Drop,
    /// Send every datagram twice in a row.
    Duplicate,
    /// Send the datagrams in reverse order.
    Reverse,
    /// Cut the last byte off the last datagram.
    Truncate,
    /// Flip one bit at a fixed position.
    BitFlip { datagram: usize, byte: usize, bit: u8 },
    /// Flip one bit somewhere past the first record header.
    RandomBitFlip,
    /// Rewrite the content type of every legacy record.
    WrongContentType(ContentType),
    /// Rewrite the epoch of every legacy record.
    WrongEpoch(u16),
    /// Send every record in its own datagram.
    SplitRecords,
    /// Precede every handshake message with a discard fragment. Applied
    /// while the flight is built, the datagrams are untouched.
    InjectDiscard,
}

impl Anomaly {
    pub fn apply(&self, datagrams: Vec<Buf>, rng: &mut SeededRng) -> Vec<Buf> {
        match *self {
            Anomaly::Drop => Vec::new(),
            Anomaly::Duplicate => datagrams
                .into_iter()
                .flat_map(|d| [d.clone(), d])
                .collect(),
            Anomaly::Reverse => datagrams.into_iter().rev().collect(),
            Anomaly::Truncate => {
                let mut datagrams = datagrams;
                if let Some(last) = datagrams.last_mut() {
                    let len = last.len().saturating_sub(1);
                    last.truncate(len);
                }
                datagrams
            }
            Anomaly::BitFlip {
                datagram,
                byte,
                bit,
            } => {
                let mut datagrams = datagrams;
                if let Some(b) = datagrams.get_mut(datagram).and_then(|d| d.get_mut(byte)) {
                    *b ^= 1 << (bit & 7);
                }
                datagrams
            }
            Anomaly::RandomBitFlip => {
                let mut datagrams = datagrams;
                let n = datagrams.len();
                if n == 0 {
                    return datagrams;
                }
                let d = &mut datagrams[rng.below(n)];
                if d.len() > LEGACY_RECORD_HEADER_LEN {
                    let span = d.len() - LEGACY_RECORD_HEADER_LEN;
                    let byte = LEGACY_RECORD_HEADER_LEN + rng.below(span);
                    let bit = rng.below(8);
                    d[byte] ^= 1 << bit;
                }
                datagrams
            }
            Anomaly::WrongContentType(ct) => rewrite_records(datagrams, |header| {
                header[0] = ct.as_u8();
            }),
            Anomaly::WrongEpoch(epoch) => rewrite_records(datagrams, |header| {
                header[3..5].copy_from_slice(&epoch.to_be_bytes());
            }),
            Anomaly::SplitRecords => datagrams
                .into_iter()
                .flat_map(|d| {
                    let spans = legacy_records(&d);
                    if spans.len() <= 1 {
                        return vec![d];
                    }
                    spans
                        .into_iter()
                        .map(|(start, end)| Buf::from_slice(&d[start..end]))
                        .collect()
                })
                .collect(),
            Anomaly::InjectDiscard => datagrams,
        }
    }
}

/// `(start, end)` of every legacy record in a datagram. Stops at the first
/// compact or truncated record.
fn legacy_records(datagram: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut at = 0;

    while at + LEGACY_RECORD_HEADER_LEN <= datagram.len() {
        if datagram[at] & UNIFIED_FIXED_MASK == UNIFIED_FIXED_BITS {
            break;
        }
        let len = u16::from_be_bytes([datagram[at + 11], datagram[at + 12]]) as usize;
        let end = at + LEGACY_RECORD_HEADER_LEN + len;
        if end > datagram.len() {
            break;
        }
        spans.push((at, end));
        at = end;
    }

    spans
}

fn rewrite_records(mut datagrams: Vec<Buf>, f: impl Fn(&mut [u8])) -> Vec<Buf> {
    for d in &mut datagrams {
        for (start, _) in legacy_records(d) {
            f(&mut d[start..start + LEGACY_RECORD_HEADER_LEN]);
        }
    }
    datagrams
}

/// Applies one [`Anomaly`] to one flight of the plan.
#[derive(Debug)]
pub struct AnomalyHooks {
    flight: usize,
    anomaly: Anomaly,
    first_only: bool,
    applied: usize,
}

impl AnomalyHooks {
    /// Apply `anomaly` to the first transmission of flight `flight`.
    pub fn new(flight: usize, anomaly: Anomaly) -> Self {
        AnomalyHooks {
            flight,
            anomaly,
            first_only: true,
            applied: 0,
        }
    }

    /// Apply to retransmissions too.
    pub fn every_attempt(mut self) -> Self {
        self.first_only = false;
        self
    }

    /// How many transmissions were altered so far.
    pub fn applied(&self) -> usize {
        self.applied
    }
}

impl FlightHooks for AnomalyHooks {
    fn inject_discard(&mut self, flight: usize, _msg_type: MessageType) -> bool {
        self.anomaly == Anomaly::InjectDiscard && flight == self.flight
    }

    fn transform_datagrams(
        &mut self,
        tag: DatagramTag,
        datagrams: Vec<Buf>,
        rng: &mut SeededRng,
    ) -> Vec<Buf> {
        if tag.flight != Some(self.flight) || (self.first_only && tag.attempt > 0) {
            return datagrams;
        }
        debug!(
            "Apply {:?} to flight {} attempt {}",
            self.anomaly, self.flight, tag.attempt
        );
        self.applied += 1;
        self.anomaly.apply(datagrams, rng)
    }
}
