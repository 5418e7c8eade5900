//! Extension points around flight construction and receipt.
//!
//! A [`Connection`](crate::Connection) calls into a [`FlightHooks`]
//! implementation when it fills a message, before it sends a flight, after
//! it has received a complete flight, and with the datagrams of every
//! flight transmission. Test scenarios that need a misbehaving peer
//! implement the one or two methods they care about and leave the rest at
//! their defaults.

use crate::buffer::Buf;
use crate::flight::FlightItem;
use crate::rng::SeededRng;
use crate::types::{MessageType, Role};

/// Body length of the default Certificate message. Larger than one
/// fragment at the default `max_fragment_len`.
pub const DEFAULT_CERTIFICATE_LEN: usize = 1500;

/// A flight as seen by the hooks.
#[derive(Debug, Clone, Copy)]
pub struct FlightInfo<'a> {
    /// Position in the flight plan. `None` for post-handshake flights.
    pub index: Option<usize>,
    pub sender: Role,
    pub items: &'a [FlightItem],
    /// The last flight of the handshake.
    pub is_final: bool,
}

/// Identifies the transmission a batch of datagrams belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramTag {
    /// Flight plan index, `None` for post-handshake flights, ACKs and
    /// application data.
    pub flight: Option<usize>,
    /// 0 for the first transmission, incremented for every resend.
    pub attempt: usize,
}

pub trait FlightHooks {
    /// Fill the body of an outgoing handshake message.
    fn message_body(&mut self, msg_type: MessageType, message_seq: u16, out: &mut Buf) {
        default_body(msg_type, message_seq, out);
    }

    fn before_send_flight(&mut self, _flight: &FlightInfo<'_>) {}

    fn after_receive_flight(&mut self, _flight: &FlightInfo<'_>) {}

    /// Whether to precede `msg_type` in flight `flight` with a discard
    /// fragment.
    fn inject_discard(&mut self, _flight: usize, _msg_type: MessageType) -> bool {
        false
    }

    /// Rewrite the datagrams of one transmission before they are queued.
    /// `rng` is the connection's generator, seeded from
    /// [`Config::rng_seed`](crate::Config::rng_seed).
    fn transform_datagrams(
        &mut self,
        _tag: DatagramTag,
        datagrams: Vec<Buf>,
        _rng: &mut SeededRng,
    ) -> Vec<Buf> {
        datagrams
    }
}

/// Hooks that change nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl FlightHooks for DefaultHooks {}

/// Deterministic filler for message bodies.
pub fn default_body(msg_type: MessageType, message_seq: u16, out: &mut Buf) {
    let len = match msg_type {
        MessageType::Certificate => DEFAULT_CERTIFICATE_LEN,
        // update_not_requested
        MessageType::KeyUpdate => {
            out.push(0);
            return;
        }
        MessageType::EndOfEarlyData | MessageType::ServerHelloDone => 0,
        MessageType::Finished => 12,
        _ => 48,
    };

    let seed = msg_type.as_u8() as usize + message_seq as usize;
    for i in 0..len {
        out.push((seed + i) as u8);
    }
}
