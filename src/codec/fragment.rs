//! Handshake message fragments.
//!
//! # Legacy header
//! ```text
//!  struct {
//!      HandshakeType msg_type;
//!      uint24 length;            // total message length
//!      uint16 message_seq;
//!      uint24 fragment_offset;
//!      uint24 fragment_length;
//!      opaque body[fragment_length];
//!  } Handshake;
//! ```
//!
//! # Compact header
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+
//! |S|W|0 0 0 0 0 0|  S = 8-bit message_seq, W = whole message
//! +-+-+-+-+-+-+-+-+
//! |   msg_type    |
//! +-+-+-+-+-+-+-+-+
//! | 8 or 16 bit   |
//! |  message_seq  |
//! +-+-+-+-+-+-+-+-+
//! | length(3) offset(3) fragment_length(3) |  only if W = 0
//! +-+-+-+-+-+-+-+-+
//! ~ body          ~  if W = 1 the body runs to the end of the record
//! +-+-+-+-+-+-+-+-+
//! ```

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;

use super::{malformed, CodecMode};
use crate::buffer::Buf;
use crate::types::MessageType;
use crate::Error;

pub const LEGACY_FRAGMENT_HEADER_LEN: usize = 12;

/// Compact flag: message_seq is encoded in a single byte.
pub const COMPACT_SHORT_SEQ: u8 = 0b1000_0000;

/// Compact flag: the fragment is the entire message, length fields omitted.
pub const COMPACT_WHOLE_MESSAGE: u8 = 0b0100_0000;

const COMPACT_RESERVED: u8 = 0b0011_1111;

const MAX_U24: usize = 0xFF_FFFF;

/// A complete logical handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub message_seq: u16,
    pub epoch: u16,
    pub body: Buf,
}

impl Message {
    pub fn new(msg_type: MessageType, message_seq: u16, epoch: u16, body: &[u8]) -> Self {
        Message {
            msg_type,
            message_seq,
            epoch,
            body: Buf::from_slice(body),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentHeader {
    pub msg_type: MessageType,
    pub total_len: u32,
    pub message_seq: u16,
    pub offset: u32,
    pub length: u32,
}

impl FragmentHeader {
    fn is_whole(&self) -> bool {
        self.offset == 0 && self.length == self.total_len
    }

    /// Encoded size of the header alone.
    pub fn encoded_len(&self, mode: CodecMode) -> usize {
        match mode {
            CodecMode::Legacy => LEGACY_FRAGMENT_HEADER_LEN,
            CodecMode::Compact => {
                let seq = if self.message_seq <= 0xFF { 1 } else { 2 };
                let lengths = if self.is_whole() { 0 } else { 9 };
                2 + seq + lengths
            }
        }
    }

    fn parse_legacy(input: &[u8]) -> IResult<&[u8], FragmentHeader> {
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, total_len) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, offset) = be_u24(input)?;
        let (input, length) = be_u24(input)?;

        Ok((
            input,
            FragmentHeader {
                msg_type,
                total_len,
                message_seq,
                offset,
                length,
            },
        ))
    }

    /// Parses up to and including the sequence number.
    fn parse_compact_prefix(input: &[u8]) -> IResult<&[u8], (u8, MessageType, u16)> {
        let (input, flags) = be_u8(input)?;
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, message_seq) = if flags & COMPACT_SHORT_SEQ != 0 {
            let (input, seq) = be_u8(input)?;
            (input, seq as u16)
        } else {
            be_u16(input)?
        };
        Ok((input, (flags, msg_type, message_seq)))
    }

    fn parse_lengths(input: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
        let (input, total_len) = be_u24(input)?;
        let (input, offset) = be_u24(input)?;
        let (input, length) = be_u24(input)?;
        Ok((input, (total_len, offset, length)))
    }
}

/// A slice of a handshake message as carried by one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub msg_type: MessageType,
    pub total_len: u32,
    pub message_seq: u16,
    pub offset: u32,
    pub data: Buf,
    /// Epoch of the enclosing record.
    pub epoch: u16,
}

impl Fragment {
    pub fn header(&self) -> FragmentHeader {
        FragmentHeader {
            msg_type: self.msg_type,
            total_len: self.total_len,
            message_seq: self.message_seq,
            offset: self.offset,
            length: self.data.len() as u32,
        }
    }

    /// One past the last byte offset this fragment covers.
    pub fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }

    /// A fragment that covers no bytes of a non-empty message.
    ///
    /// Carries nothing to buffer, only occupies a record.
    pub fn is_discard(&self) -> bool {
        self.data.is_empty() && self.total_len > 0
    }

    /// Build a discard fragment for the given message.
    pub fn discard(msg_type: MessageType, message_seq: u16, total_len: u32, epoch: u16) -> Self {
        Fragment {
            msg_type,
            total_len,
            message_seq,
            offset: total_len,
            data: Buf::new(),
            epoch,
        }
    }
}

/// Serialize one fragment header followed by `data`.
pub fn encode_fragment(header: &FragmentHeader, data: &[u8], mode: CodecMode, out: &mut Buf) {
    debug_assert_eq!(header.length as usize, data.len());

    match mode {
        CodecMode::Legacy => {
            out.push(header.msg_type.as_u8());
            out.push_u24(header.total_len);
            out.extend_from_slice(&header.message_seq.to_be_bytes());
            out.push_u24(header.offset);
            out.push_u24(header.length);
        }
        CodecMode::Compact => {
            let short = header.message_seq <= 0xFF;
            let whole = header.is_whole();

            let mut flags = 0;
            if short {
                flags |= COMPACT_SHORT_SEQ;
            }
            if whole {
                flags |= COMPACT_WHOLE_MESSAGE;
            }

            out.push(flags);
            out.push(header.msg_type.as_u8());
            if short {
                out.push(header.message_seq as u8);
            } else {
                out.extend_from_slice(&header.message_seq.to_be_bytes());
            }
            if !whole {
                out.push_u24(header.total_len);
                out.push_u24(header.offset);
                out.push_u24(header.length);
            }
        }
    }

    out.extend_from_slice(data);
}

/// Split a message into wire fragments of at most `max_fragment_len` body
/// bytes each.
///
/// A zero-length message still produces exactly one header-only fragment.
pub fn encode_fragments(message: &Message, max_fragment_len: usize, mode: CodecMode) -> Vec<Buf> {
    let max = max_fragment_len.max(1);
    let total = message.body.len();
    let mut out = Vec::with_capacity(total / max + 1);
    let mut offset = 0;

    loop {
        let len = (total - offset).min(max);
        let header = FragmentHeader {
            msg_type: message.msg_type,
            total_len: total as u32,
            message_seq: message.message_seq,
            offset: offset as u32,
            length: len as u32,
        };

        let mut buf = Buf::new();
        encode_fragment(&header, &message.body[offset..offset + len], mode, &mut buf);
        out.push(buf);

        offset += len;
        if offset >= total {
            break;
        }
    }

    out
}

/// Parse one fragment from the front of a record body.
///
/// `epoch` comes from the enclosing record and is stamped onto the result.
pub fn decode_fragment(
    input: &[u8],
    mode: CodecMode,
    epoch: u16,
) -> Result<(Fragment, &[u8]), Error> {
    let (header, data, rest) = match mode {
        CodecMode::Legacy => {
            let (input, header) = FragmentHeader::parse_legacy(input)
                .map_err(malformed("truncated fragment header"))?;
            let (rest, data) = take::<_, _, nom::error::Error<&[u8]>>(header.length as usize)(
                input,
            )
            .map_err(malformed("fragment length exceeds record"))?;
            (header, data, rest)
        }
        CodecMode::Compact => {
            let (input, (flags, msg_type, message_seq)) =
                FragmentHeader::parse_compact_prefix(input)
                    .map_err(malformed("truncated fragment header"))?;

            if flags & COMPACT_RESERVED != 0 {
                return Err(Error::MalformedRecord("compact fragment flags"));
            }

            if flags & COMPACT_WHOLE_MESSAGE != 0 {
                if input.len() > MAX_U24 {
                    return Err(Error::MalformedRecord("fragment length exceeds record"));
                }
                let header = FragmentHeader {
                    msg_type,
                    total_len: input.len() as u32,
                    message_seq,
                    offset: 0,
                    length: input.len() as u32,
                };
                (header, input, &input[input.len()..])
            } else {
                let (input, (total_len, offset, length)) = FragmentHeader::parse_lengths(input)
                    .map_err(malformed("truncated fragment header"))?;
                let (rest, data) = take::<_, _, nom::error::Error<&[u8]>>(length as usize)(input)
                    .map_err(malformed("fragment length exceeds record"))?;
                let header = FragmentHeader {
                    msg_type,
                    total_len,
                    message_seq,
                    offset,
                    length,
                };
                (header, data, rest)
            }
        }
    };

    if header.offset as u64 + header.length as u64 > header.total_len as u64 {
        return Err(Error::MalformedRecord("fragment beyond message end"));
    }

    let fragment = Fragment {
        msg_type: header.msg_type,
        total_len: header.total_len,
        message_seq: header.message_seq,
        offset: header.offset,
        data: Buf::from_slice(data),
        epoch,
    };

    Ok((fragment, rest))
}

/// Parse every fragment in a handshake record body.
pub fn decode_fragments(
    mut input: &[u8],
    mode: CodecMode,
    epoch: u16,
) -> Result<Vec<Fragment>, Error> {
    if input.is_empty() {
        return Err(Error::MalformedRecord("empty handshake record"));
    }

    let mut fragments = Vec::new();
    while !input.is_empty() {
        let (fragment, rest) = decode_fragment(input, mode, epoch)?;
        fragments.push(fragment);
        input = rest;
    }

    Ok(fragments)
}
