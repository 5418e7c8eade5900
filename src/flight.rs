//! Flight plans.
//!
//! Handshake messages are grouped into flights. A flight is retransmitted
//! and acknowledged as a unit. The plan for a connection is fixed by the
//! protocol, the handshake kind and a couple of options, and both peers
//! derive the same plan from the same configuration.
//!
//! ```text
//!  DTLS 1.2 full handshake
//!
//!  Client                                          Server
//!  ------                                          ------
//!  ClientHello             -------->                           Flight 1
//!
//!                          <-------    HelloVerifyRequest      (stateless)
//!
//!  ClientHello              -------->                          (again)
//!
//!                                             ServerHello    \
//!                                             Certificate     \
//!                                       ServerKeyExchange      Flight 2
//!                                     CertificateRequest*     /
//!                          <--------      ServerHelloDone    /
//!
//!  Certificate*                                              \
//!  ClientKeyExchange                                          \
//!  CertificateVerify*                                          Flight 3
//!  [ChangeCipherSpec]                                         /
//!  Finished                -------->                         /
//!
//!                                       NewSessionTicket*    \
//!                                      [ChangeCipherSpec]     Flight 4
//!                          <--------             Finished    /
//! ```

use crate::types::{MessageType, Protocol, Role};
use crate::Config;

/// Shape of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    /// Full handshake.
    Full,
    /// Abbreviated handshake resuming an earlier session.
    Resumption,
    /// Full handshake with a stateless HelloVerifyRequest (DTLS 1.2) or
    /// HelloRetryRequest (DTLS 1.3) round trip first.
    HelloRetry,
    /// DTLS 1.3 resumption with 0-RTT data at epoch 1.
    EarlyData { accepted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightItem {
    /// A handshake message and the epoch it is sent in.
    Handshake(MessageType, u16),
    /// Sent in the epoch preceding the items after it.
    ChangeCipherSpec,
}

impl FlightItem {
    pub fn msg_type(&self) -> Option<MessageType> {
        match self {
            FlightItem::Handshake(t, _) => Some(*t),
            FlightItem::ChangeCipherSpec => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightSpec {
    pub sender: Role,
    pub items: Vec<FlightItem>,
    /// Never retransmitted on a timer, only answered again on demand.
    pub stateless: bool,
    /// `message_seq` of the first handshake item.
    pub first_seq: u16,
}

impl FlightSpec {
    /// Handshake items with their message sequence numbers, in order.
    pub fn messages(&self) -> impl Iterator<Item = (u16, MessageType, u16)> + '_ {
        self.items
            .iter()
            .filter_map(|i| match i {
                FlightItem::Handshake(t, e) => Some((*t, *e)),
                FlightItem::ChangeCipherSpec => None,
            })
            .enumerate()
            .map(move |(n, (t, e))| (self.first_seq + n as u16, t, e))
    }

    /// Position in `items` of the handshake message with `message_seq`.
    pub fn item_for_seq(&self, message_seq: u16) -> Option<usize> {
        let n = message_seq.checked_sub(self.first_seq)? as usize;
        self.items
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, FlightItem::Handshake(..)))
            .nth(n)
            .map(|(idx, _)| idx)
    }

    /// One past the last `message_seq` in this flight.
    pub fn end_seq(&self) -> u16 {
        self.first_seq + self.messages().count() as u16
    }

    pub fn has_change_cipher_spec(&self) -> bool {
        self.items.contains(&FlightItem::ChangeCipherSpec)
    }
}

#[derive(Default)]
struct Builder {
    flights: Vec<FlightSpec>,
    next_seq: [u16; 2],
}

fn slot(role: Role) -> usize {
    match role {
        Role::Client => 0,
        Role::Server => 1,
    }
}

fn hs(msg_type: MessageType, epoch: u16) -> FlightItem {
    FlightItem::Handshake(msg_type, epoch)
}

impl Builder {
    fn flight(&mut self, sender: Role, items: Vec<FlightItem>, stateless: bool) {
        let first_seq = self.next_seq[slot(sender)];
        let count = items.iter().filter(|i| i.msg_type().is_some()).count() as u16;
        self.next_seq[slot(sender)] += count;
        self.flights.push(FlightSpec {
            sender,
            items,
            stateless,
            first_seq,
        });
    }
}

/// The ordered flights of one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightPlan {
    protocol: Protocol,
    flights: Vec<FlightSpec>,
    next_seq: [u16; 2],
}

impl FlightPlan {
    pub fn new(config: &Config) -> Self {
        let mut b = Builder::default();
        match config.protocol() {
            Protocol::Dtls12 => dtls12(&mut b, config),
            Protocol::Dtls13 => dtls13(&mut b, config),
        }
        FlightPlan {
            protocol: config.protocol(),
            flights: b.flights,
            next_seq: b.next_seq,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn flights(&self) -> &[FlightSpec] {
        &self.flights
    }

    pub fn get(&self, index: usize) -> Option<&FlightSpec> {
        self.flights.get(index)
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// The role that sends the final flight.
    pub fn last_sender(&self) -> Option<Role> {
        self.flights.last().map(|f| f.sender)
    }

    /// First `message_seq` `role` uses after the handshake.
    pub fn post_handshake_seq(&self, role: Role) -> u16 {
        self.next_seq[slot(role)]
    }
}

fn dtls12(b: &mut Builder, config: &Config) {
    use MessageType::*;
    let auth = config.client_auth();
    let tickets = config.session_tickets();

    b.flight(Role::Client, vec![hs(ClientHello, 0)], false);

    if config.handshake() == HandshakeKind::HelloRetry {
        b.flight(Role::Server, vec![hs(HelloVerifyRequest, 0)], true);
        b.flight(Role::Client, vec![hs(ClientHello, 0)], false);
    }

    if config.handshake() == HandshakeKind::Resumption {
        let mut server = vec![hs(ServerHello, 0)];
        if tickets {
            server.push(hs(NewSessionTicket, 0));
        }
        server.push(FlightItem::ChangeCipherSpec);
        server.push(hs(Finished, 1));
        b.flight(Role::Server, server, false);

        b.flight(
            Role::Client,
            vec![FlightItem::ChangeCipherSpec, hs(Finished, 1)],
            false,
        );
        return;
    }

    let mut server = vec![
        hs(ServerHello, 0),
        hs(Certificate, 0),
        hs(ServerKeyExchange, 0),
    ];
    if auth {
        server.push(hs(CertificateRequest, 0));
    }
    server.push(hs(ServerHelloDone, 0));
    b.flight(Role::Server, server, false);

    let mut client = Vec::new();
    if auth {
        client.push(hs(Certificate, 0));
    }
    client.push(hs(ClientKeyExchange, 0));
    if auth {
        client.push(hs(CertificateVerify, 0));
    }
    client.push(FlightItem::ChangeCipherSpec);
    client.push(hs(Finished, 1));
    b.flight(Role::Client, client, false);

    let mut last = Vec::new();
    if tickets {
        last.push(hs(NewSessionTicket, 0));
    }
    last.push(FlightItem::ChangeCipherSpec);
    last.push(hs(Finished, 1));
    b.flight(Role::Server, last, false);
}

fn dtls13(b: &mut Builder, config: &Config) {
    use MessageType::*;

    b.flight(Role::Client, vec![hs(ClientHello, 0)], false);

    match config.handshake() {
        HandshakeKind::Full | HandshakeKind::HelloRetry => {
            if config.handshake() == HandshakeKind::HelloRetry {
                b.flight(Role::Server, vec![hs(HelloRetryRequest, 0)], true);
                b.flight(Role::Client, vec![hs(ClientHello, 0)], false);
            }

            let mut server = vec![hs(ServerHello, 0), hs(EncryptedExtensions, 2)];
            if config.client_auth() {
                server.push(hs(CertificateRequest, 2));
            }
            server.extend([hs(Certificate, 2), hs(CertificateVerify, 2), hs(Finished, 2)]);
            b.flight(Role::Server, server, false);

            let mut client = Vec::new();
            if config.client_auth() {
                client.extend([hs(Certificate, 2), hs(CertificateVerify, 2)]);
            }
            client.push(hs(Finished, 2));
            b.flight(Role::Client, client, false);
        }
        HandshakeKind::Resumption | HandshakeKind::EarlyData { .. } => {
            b.flight(
                Role::Server,
                vec![
                    hs(ServerHello, 0),
                    hs(EncryptedExtensions, 2),
                    hs(Finished, 2),
                ],
                false,
            );

            let mut client = Vec::new();
            if config.handshake() == (HandshakeKind::EarlyData { accepted: true }) {
                client.push(hs(EndOfEarlyData, 1));
            }
            client.push(hs(Finished, 2));
            b.flight(Role::Client, client, false);
        }
    }
}
