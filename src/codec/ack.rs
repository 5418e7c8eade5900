//! ACK record body (RFC 9147 Section 7).
//!
//! ```text
//! struct {
//!     RecordNumber record_numbers<0..2^16-1>;
//! } ACK;
//!
//! struct {
//!     uint64 epoch;
//!     uint64 sequence_number;
//! } RecordNumber;
//! ```

use nom::number::complete::{be_u16, be_u64};
use nom::IResult;

use crate::buffer::Buf;
use crate::types::{RecordNumber, MAX_SEQUENCE};
use crate::Error;

const ENTRY_SIZE: usize = 16;

/// Largest number of entries that fit the 16-bit length prefix.
const MAX_ENTRIES: usize = u16::MAX as usize / ENTRY_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub record_numbers: Vec<RecordNumber>,
}

impl Ack {
    pub fn new(record_numbers: Vec<RecordNumber>) -> Self {
        Self { record_numbers }
    }

    pub fn is_empty(&self) -> bool {
        self.record_numbers.is_empty()
    }

    fn parse_entry(input: &[u8]) -> IResult<&[u8], (u64, u64)> {
        let (input, epoch) = be_u64(input)?;
        let (input, sequence) = be_u64(input)?;
        Ok((input, (epoch, sequence)))
    }

    /// Parse an ACK body. The body must be consumed exactly.
    pub fn parse(input: &[u8]) -> Result<Ack, Error> {
        let (input, len) = be_u16::<_, nom::error::Error<&[u8]>>(input)
            .map_err(|_| Error::MalformedAck("truncated length"))?;
        let len = len as usize;

        if len % ENTRY_SIZE != 0 {
            return Err(Error::MalformedAck("length not a multiple of 16"));
        }
        if input.len() != len {
            return Err(Error::MalformedAck("length does not match record"));
        }

        let mut record_numbers = Vec::with_capacity(len / ENTRY_SIZE);
        let mut remaining = input;

        while !remaining.is_empty() {
            let (rest, (epoch, sequence)) =
                Self::parse_entry(remaining).map_err(|_| Error::MalformedAck("truncated entry"))?;

            if epoch > u16::MAX as u64 {
                return Err(Error::MalformedAck("epoch out of range"));
            }
            if sequence > MAX_SEQUENCE {
                return Err(Error::MalformedAck("sequence out of range"));
            }

            record_numbers.push(RecordNumber::new(epoch as u16, sequence));
            remaining = rest;
        }

        Ok(Ack { record_numbers })
    }

    /// Serialize, keeping at most as many entries as the length prefix allows.
    pub fn serialize(&self, output: &mut Buf) {
        let entries = &self.record_numbers[..self.record_numbers.len().min(MAX_ENTRIES)];
        let len = (entries.len() * ENTRY_SIZE) as u16;
        output.extend_from_slice(&len.to_be_bytes());

        for rn in entries {
            output.extend_from_slice(&(rn.epoch as u64).to_be_bytes());
            output.extend_from_slice(&rn.sequence.to_be_bytes());
        }
    }

    pub fn acknowledges(&self, number: RecordNumber) -> bool {
        self.record_numbers.contains(&number)
    }
}
