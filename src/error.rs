use thiserror::Error;

use crate::types::{ContentType, MessageType};

/// Errors surfaced by the record layer and flight machinery.
///
/// Every variant is fatal to the connection. Recoverable conditions
/// (duplicates, reordering, stale acknowledgements) are absorbed internally
/// and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Malformed record: {0}")]
    MalformedRecord(&'static str),

    #[error("Malformed ACK: {0}")]
    MalformedAck(&'static str),

    #[error("Bad change cipher spec byte {0:#04x}")]
    BadChangeCipherSpec(u8),

    #[error("Fragment does not match earlier fragments of message {0}")]
    FragmentMismatch(u16),

    #[error("Excess handshake data")]
    ExcessHandshakeData,

    #[error("Unexpected {0:?} record at epoch {1}")]
    UnexpectedRecord(ContentType, u16),

    #[error("Unexpected handshake message {got:?}, expected {expected:?}")]
    UnexpectedMessage {
        got: MessageType,
        expected: Option<MessageType>,
    },

    #[error("Too many consecutive empty records ({0})")]
    TooManyEmptyFragments(usize),

    #[error("Too many key updates ({0})")]
    TooManyKeyUpdates(usize),

    #[error("Handshake message too large ({0} bytes)")]
    ExcessiveMessageSize(usize),

    #[error("Buffered handshake data exceeds {0} bytes")]
    BufferedDataExceeded(usize),

    #[error("Receive queue full")]
    ReceiveQueueFull,

    #[error("Transmit queue full")]
    TransmitQueueFull,

    #[error("Flight not acknowledged after {0} timeouts")]
    ReadTimeout(usize),

    #[error("Epoch is not allowed to wrap")]
    EpochOverflow,

    #[error("Epoch {new} does not advance past {current}")]
    EpochRegression { current: u16, new: u16 },

    #[error("Record sequence exhausted in epoch {0}")]
    SequenceExhausted(u16),

    #[error("Handshake message sequence exhausted")]
    MessageSeqExhausted,

    #[error("No keys for epoch {0}")]
    MissingKeys(u16),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Received fatal alert {0}")]
    AlertReceived(u8),

    #[error("Not allowed in current state: {0}")]
    InvalidState(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bytes that could not be parsed.
    Decode,
    /// Well-formed data that arrived out of place.
    Unexpected,
    /// A bound against an adversarial or buggy peer was hit.
    Resource,
    /// The peer stopped answering.
    Liveness,
    /// Misuse of the API or a broken internal invariant.
    Internal,
    /// Invalid configuration.
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRecord(_)
            | Error::MalformedAck(_)
            | Error::BadChangeCipherSpec(_)
            | Error::FragmentMismatch(_) => ErrorKind::Decode,

            Error::ExcessHandshakeData
            | Error::UnexpectedRecord(..)
            | Error::UnexpectedMessage { .. }
            | Error::AlertReceived(_) => ErrorKind::Unexpected,

            Error::TooManyEmptyFragments(_)
            | Error::TooManyKeyUpdates(_)
            | Error::ExcessiveMessageSize(_)
            | Error::BufferedDataExceeded(_)
            | Error::ReceiveQueueFull
            | Error::TransmitQueueFull
            | Error::SequenceExhausted(_)
            | Error::MessageSeqExhausted => ErrorKind::Resource,

            Error::ReadTimeout(_) => ErrorKind::Liveness,

            Error::EpochOverflow
            | Error::EpochRegression { .. }
            | Error::MissingKeys(_)
            | Error::CryptoError(_)
            | Error::InvalidState(_) => ErrorKind::Internal,

            Error::ConfigError(_) => ErrorKind::Config,
        }
    }

    /// Error code string as compared against a test's expected error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedRecord(_) => ":DECODE_ERROR:",
            Error::MalformedAck(_) => ":DECODE_ERROR:",
            Error::BadChangeCipherSpec(_) => ":BAD_CHANGE_CIPHER_SPEC:",
            Error::FragmentMismatch(_) => ":FRAGMENT_MISMATCH:",
            Error::ExcessHandshakeData => ":EXCESS_HANDSHAKE_DATA:",
            Error::UnexpectedRecord(..) => ":UNEXPECTED_RECORD:",
            Error::UnexpectedMessage { .. } => ":UNEXPECTED_MESSAGE:",
            Error::TooManyEmptyFragments(_) => ":TOO_MANY_EMPTY_FRAGMENTS:",
            Error::TooManyKeyUpdates(_) => ":TOO_MANY_KEY_UPDATES:",
            Error::ExcessiveMessageSize(_) => ":EXCESSIVE_MESSAGE_SIZE:",
            Error::BufferedDataExceeded(_) => ":EXCESSIVE_MESSAGE_SIZE:",
            Error::ReceiveQueueFull => ":RECEIVE_QUEUE_FULL:",
            Error::TransmitQueueFull => ":TRANSMIT_QUEUE_FULL:",
            Error::ReadTimeout(_) => ":READ_TIMEOUT_EXPIRED:",
            Error::EpochOverflow => ":EPOCH_OVERFLOW:",
            Error::EpochRegression { .. } => ":INTERNAL_ERROR:",
            Error::SequenceExhausted(_) => ":SEQUENCE_EXHAUSTED:",
            Error::MessageSeqExhausted => ":SEQUENCE_EXHAUSTED:",
            Error::MissingKeys(_) => ":INTERNAL_ERROR:",
            Error::CryptoError(_) => ":INTERNAL_ERROR:",
            Error::AlertReceived(_) => ":PEER_ALERT:",
            Error::InvalidState(_) => ":INTERNAL_ERROR:",
            Error::ConfigError(_) => ":CONFIG_ERROR:",
        }
    }
}
