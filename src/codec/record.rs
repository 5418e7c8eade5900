//! Record headers and datagram splitting.
//!
//! # Legacy header
//! ```text
//!  struct {
//!      ContentType type;
//!      ProtocolVersion version;
//!      uint16 epoch;
//!      uint48 sequence_number;
//!      uint16 length;
//!      opaque fragment[length];
//!  } DTLSPlaintext / DTLSCiphertext;
//! ```
//!
//! # Unified header (epoch > 0, compact mode)
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+
//! |0|0|1|C|S|L|E E|  C = CID, S = 16-bit seq, L = length present, E = epoch
//! +-+-+-+-+-+-+-+-+
//! | 8 or 16 bit   |
//! |Sequence Number|
//! +-+-+-+-+-+-+-+-+
//! | 16 bit Length |  if L = 1
//! +-+-+-+-+-+-+-+-+
//! ~ Encrypted     ~
//! | Record        |  runs to the end of the datagram if L = 0
//! +-+-+-+-+-+-+-+-+
//! ```

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;
use tinyvec::ArrayVec;

use super::{malformed, CodecMode};
use crate::buffer::Buf;
use crate::types::{ContentType, MAX_SEQUENCE};
use crate::Error;

pub const DTLS1_0: u16 = 0xFEFF;
pub const DTLS1_2: u16 = 0xFEFD;

pub const LEGACY_RECORD_HEADER_LEN: usize = 13;

/// Upper bound on records in one datagram, in both directions.
pub const MAX_RECORDS_PER_DATAGRAM: usize = 64;

pub const UNIFIED_FIXED_BITS: u8 = 0b0010_0000;
pub const UNIFIED_FIXED_MASK: u8 = 0b1110_0000;
pub const UNIFIED_CID_BIT: u8 = 0b0001_0000;
pub const UNIFIED_SEQ_16BIT: u8 = 0b0000_1000;
pub const UNIFIED_LENGTH_BIT: u8 = 0b0000_0100;
pub const UNIFIED_EPOCH_MASK: u8 = 0b0000_0011;

/// Fixed-width record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: u16,
    pub epoch: u16,
    pub sequence: u64,
    pub length: u16,
}

impl RecordHeader {
    fn parse(input: &[u8]) -> IResult<&[u8], RecordHeader> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = be_u16(input)?;
        let (input, epoch) = be_u16(input)?;
        let (input, seq) = take(6_usize)(input)?;
        let (input, length) = be_u16(input)?;

        let mut bytes = [0; 8];
        bytes[2..].copy_from_slice(seq);

        Ok((
            input,
            RecordHeader {
                content_type,
                version,
                epoch,
                sequence: u64::from_be_bytes(bytes),
                length,
            },
        ))
    }
}

/// Compact record header. Epoch and sequence are truncated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnifiedHeader {
    pub epoch_bits: u8,
    pub seq_bits: u16,
    pub seq_16bit: bool,
    pub length: Option<u16>,
}

impl UnifiedHeader {
    /// Build the header for a record at `epoch`/`sequence`.
    pub fn new(epoch: u16, sequence: u64, short_seq: bool, length: Option<u16>) -> Self {
        let seq_16bit = !short_seq;
        let seq_bits = if seq_16bit {
            (sequence & 0xFFFF) as u16
        } else {
            (sequence & 0xFF) as u16
        };
        UnifiedHeader {
            epoch_bits: (epoch as u8) & UNIFIED_EPOCH_MASK,
            seq_bits,
            seq_16bit,
            length,
        }
    }

    /// Number of sequence bits present on the wire.
    pub fn sequence_width(&self) -> u32 {
        if self.seq_16bit {
            16
        } else {
            8
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + if self.seq_16bit { 2 } else { 1 } + if self.length.is_some() { 2 } else { 0 }
    }

    /// Whether the full `epoch` could have produced these low bits.
    pub fn matches_epoch(&self, epoch: u16) -> bool {
        (epoch as u8) & UNIFIED_EPOCH_MASK == self.epoch_bits
    }

    fn parse(input: &[u8]) -> IResult<&[u8], (u8, UnifiedHeader)> {
        let (input, flags) = be_u8(input)?;
        let seq_16bit = flags & UNIFIED_SEQ_16BIT != 0;

        let (input, seq_bits) = if seq_16bit {
            be_u16(input)?
        } else {
            let (input, seq) = be_u8(input)?;
            (input, seq as u16)
        };

        let (input, length) = if flags & UNIFIED_LENGTH_BIT != 0 {
            let (input, len) = be_u16(input)?;
            (input, Some(len))
        } else {
            (input, None)
        };

        Ok((
            input,
            (
                flags,
                UnifiedHeader {
                    epoch_bits: flags & UNIFIED_EPOCH_MASK,
                    seq_bits,
                    seq_16bit,
                    length,
                },
            ),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHeader {
    Legacy(RecordHeader),
    Unified(UnifiedHeader),
}

impl Default for RawHeader {
    fn default() -> Self {
        RawHeader::Legacy(RecordHeader::default())
    }
}

/// One record sliced out of a datagram, not yet decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawRecord<'a> {
    pub header: RawHeader,
    /// Header exactly as received. Used as additional authenticated data.
    pub header_bytes: &'a [u8],
    pub body: &'a [u8],
}

fn parse_legacy(input: &[u8]) -> Result<(RawRecord<'_>, &[u8]), Error> {
    let (rest, header) =
        RecordHeader::parse(input).map_err(malformed("truncated record header"))?;

    if let ContentType::Unknown(_) = header.content_type {
        return Err(Error::MalformedRecord("unknown content type"));
    }
    if header.version != DTLS1_2 && header.version != DTLS1_0 {
        return Err(Error::MalformedRecord("unknown record version"));
    }

    let (rest, body) = take::<_, _, nom::error::Error<&[u8]>>(header.length as usize)(rest)
        .map_err(malformed("record straddles datagram"))?;

    let record = RawRecord {
        header: RawHeader::Legacy(header),
        header_bytes: &input[..LEGACY_RECORD_HEADER_LEN],
        body,
    };
    Ok((record, rest))
}

fn parse_unified(input: &[u8]) -> Result<(RawRecord<'_>, &[u8]), Error> {
    let (rest, (flags, header)) =
        UnifiedHeader::parse(input).map_err(malformed("truncated record header"))?;

    if flags & UNIFIED_CID_BIT != 0 {
        return Err(Error::MalformedRecord("connection id not supported"));
    }

    let header_len = input.len() - rest.len();
    let (rest, body) = match header.length {
        Some(len) => take::<_, _, nom::error::Error<&[u8]>>(len as usize)(rest)
            .map_err(malformed("record straddles datagram"))?,
        None => (&rest[rest.len()..], rest),
    };

    let record = RawRecord {
        header: RawHeader::Unified(header),
        header_bytes: &input[..header_len],
        body,
    };
    Ok((record, rest))
}

/// Slice a datagram into records.
///
/// Any record that runs past the end of the datagram fails the whole
/// datagram.
pub fn split_datagram(
    datagram: &[u8],
    mode: CodecMode,
) -> Result<ArrayVec<[RawRecord<'_>; MAX_RECORDS_PER_DATAGRAM]>, Error> {
    let mut records = ArrayVec::new();
    let mut input = datagram;

    while !input.is_empty() {
        let unified =
            mode == CodecMode::Compact && input[0] & UNIFIED_FIXED_MASK == UNIFIED_FIXED_BITS;

        let (record, rest) = if unified {
            parse_unified(input)?
        } else {
            parse_legacy(input)?
        };

        if records.try_push(record).is_some() {
            return Err(Error::MalformedRecord("too many records in datagram"));
        }
        input = rest;
    }

    Ok(records)
}

/// Write a legacy header. `header.length` must already be the body length.
pub fn write_legacy_header(header: &RecordHeader, out: &mut Buf) {
    debug_assert!(header.sequence <= MAX_SEQUENCE);
    out.push(header.content_type.as_u8());
    out.extend_from_slice(&header.version.to_be_bytes());
    out.extend_from_slice(&header.epoch.to_be_bytes());
    out.extend_from_slice(&header.sequence.to_be_bytes()[2..]);
    out.extend_from_slice(&header.length.to_be_bytes());
}

pub fn write_unified_header(header: &UnifiedHeader, out: &mut Buf) {
    let mut flags = UNIFIED_FIXED_BITS | (header.epoch_bits & UNIFIED_EPOCH_MASK);
    if header.seq_16bit {
        flags |= UNIFIED_SEQ_16BIT;
    }
    if header.length.is_some() {
        flags |= UNIFIED_LENGTH_BIT;
    }

    out.push(flags);
    if header.seq_16bit {
        out.extend_from_slice(&header.seq_bits.to_be_bytes());
    } else {
        out.push(header.seq_bits as u8);
    }
    if let Some(len) = header.length {
        out.extend_from_slice(&len.to_be_bytes());
    }
}
