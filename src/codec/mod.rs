//! Wire codec for handshake fragments, records and record-level messages.
//!
//! Everything here is a pure transform. Parse failures are surfaced as
//! [`Error`] values for the caller to turn into an abort; nothing is
//! silently repaired.

mod ack;
mod fragment;
mod record;

pub use ack::Ack;
pub use fragment::{
    decode_fragment, decode_fragments, encode_fragment, encode_fragments, Fragment, FragmentHeader,
    Message, COMPACT_SHORT_SEQ, COMPACT_WHOLE_MESSAGE, LEGACY_FRAGMENT_HEADER_LEN,
};
pub use record::{
    split_datagram, write_legacy_header, write_unified_header, RawHeader, RawRecord,
    RecordHeader, UnifiedHeader, DTLS1_0, DTLS1_2, LEGACY_RECORD_HEADER_LEN,
    MAX_RECORDS_PER_DATAGRAM, UNIFIED_CID_BIT, UNIFIED_EPOCH_MASK, UNIFIED_FIXED_BITS,
    UNIFIED_FIXED_MASK, UNIFIED_LENGTH_BIT, UNIFIED_SEQ_16BIT,
};

use crate::Error;

/// Header shape negotiated for records above epoch 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecMode {
    /// Fixed-width record and fragment headers.
    #[default]
    Legacy,
    /// Unified record header and compact fragment header.
    Compact,
}

/// Validate a ChangeCipherSpec body. Exactly one byte, value 1.
pub fn parse_change_cipher_spec(body: &[u8]) -> Result<(), Error> {
    match body {
        [1] => Ok(()),
        [b, ..] => Err(Error::BadChangeCipherSpec(*b)),
        [] => Err(Error::BadChangeCipherSpec(0)),
    }
}

/// Alert body: level and description.
pub fn parse_alert(body: &[u8]) -> Result<(u8, u8), Error> {
    match body {
        [level, description] => Ok((*level, *description)),
        _ => Err(Error::MalformedRecord("alert length")),
    }
}

/// Alert level for fatal alerts.
pub const ALERT_LEVEL_FATAL: u8 = 2;

/// Map a nom failure to a decode error.
pub(crate) fn malformed<E>(what: &'static str) -> impl FnOnce(nom::Err<E>) -> Error {
    move |_| Error::MalformedRecord(what)
}
