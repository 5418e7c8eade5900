//! Small MTU, heavy fragmentation and fully reversed delivery.

use std::time::Duration;

use dflight::script::{Pair, Received, Step};
use dflight::{Config, HandshakeKind, MessageType, Protocol, Role};

fn small_mtu(protocol: Protocol, kind: HandshakeKind) -> Config {
    Config::builder()
        .protocol(protocol)
        .handshake(kind)
        .mtu(60)
        .max_fragment_len(10)
        .max_queue_tx(512)
        .max_queue_rx(512)
        .build()
        .expect("config")
}

fn reversed(rounds: usize) -> Vec<Step> {
    let mut steps = vec![Step::Start];
    for n in 0..rounds {
        let from = if n % 2 == 0 { Role::Client } else { Role::Server };
        steps.push(Step::DeliverReversed { from });
    }
    steps.push(Step::ExpectConnected(Role::Client));
    steps.push(Step::ExpectConnected(Role::Server));
    steps
}

#[test]
fn dtls12_full_reversed() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(small_mtu(Protocol::Dtls12, HandshakeKind::Full), 41);
    pair.run(reversed(4)).expect("script");

    let messages: Vec<_> = pair
        .received(Role::Client)
        .iter()
        .filter_map(|r| match r {
            Received::HandshakeMessage(t) => Some(*t),
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec![
            MessageType::ServerHello,
            MessageType::Certificate,
            MessageType::ServerKeyExchange,
            MessageType::ServerHelloDone,
            MessageType::Finished,
        ]
    );
}

#[test]
fn dtls12_resumption_reversed() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(small_mtu(Protocol::Dtls12, HandshakeKind::Resumption), 42);
    pair.run(reversed(3)).expect("script");
}

#[test]
fn dtls13_full_reversed() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(small_mtu(Protocol::Dtls13, HandshakeKind::Full), 43);
    pair.run(reversed(3)).expect("script");
}

#[test]
fn dtls13_resumption_reversed() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(small_mtu(Protocol::Dtls13, HandshakeKind::Resumption), 44);
    pair.run(reversed(3)).expect("script");
}

#[test]
fn every_datagram_fits_the_mtu() {
    let _ = env_logger::try_init();

    for protocol in [Protocol::Dtls12, Protocol::Dtls13] {
        let mut pair = Pair::new(small_mtu(protocol, HandshakeKind::Full), 45);
        pair.run([Step::Start, Step::Deliver {
            from: Role::Client,
            count: None,
        }])
        .expect("script");

        let flight = pair.take_packets(Role::Server);
        // The 1500 byte certificate alone needs 150 fragments.
        assert!(flight.len() > 150, "{:?}: {}", protocol, flight.len());
        assert!(flight.iter().all(|d| d.len() <= 60));
    }
}

#[test]
fn records_beyond_the_window_are_not_acknowledged() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .allow_pipelining(true)
        .build()
        .expect("config");
    let mut pair = Pair::new(config, 46);
    pair.handshake().expect("handshake");

    let mut steps = vec![Step::SendNewSessionTicket; 10];
    steps.extend([
        Step::ExpectPackets {
            from: Role::Server,
            count: 10,
        },
        // Only the last four tickets arrive. Three of them are more than
        // seven messages ahead of the first missing one.
        Step::Drop {
            from: Role::Server,
            count: Some(6),
        },
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Advance(Duration::from_millis(100)),
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        // The partial ACK re-armed the timer one interval later. On expiry
        // everything but the acknowledged ticket is resent.
        Step::Advance(Duration::from_millis(400)),
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Advance(Duration::from_millis(100)),
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectIdle(Role::Server),
    ]);
    pair.run(steps).expect("script");

    let tickets = pair
        .received(Role::Client)
        .iter()
        .filter(|r| **r == Received::HandshakeMessage(MessageType::NewSessionTicket))
        .count();
    assert_eq!(tickets, 10);
}
