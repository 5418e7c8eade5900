//! Retransmission timers, partial acknowledgement and on-demand resends.

use std::time::{Duration, Instant};

use dflight::anomaly::{Anomaly, AnomalyHooks};
use dflight::script::Pair;
use dflight::{Config, DefaultHooks, Error, FlightStatus, HandshakeKind, Protocol, State};

use crate::common::*;

#[test]
fn client_gives_up_after_thirteen_timeouts() {
    let _ = env_logger::try_init();

    let (mut client, _server) = endpoints(dtls13_config());
    let t0 = Instant::now();

    client.handle_timeout(t0).expect("start");
    assert_eq!(collect_packets(&mut client).len(), 1);

    let mut next = client.next_timeout().expect("timer armed");
    assert_eq!(next, t0 + Duration::from_millis(400));

    for expiry in 1..13u32 {
        client.handle_timeout(next).expect("resend");
        assert_eq!(collect_packets(&mut client).len(), 1, "expiry {}", expiry);

        let following = client.next_timeout().expect("timer re-armed");
        let interval = Duration::from_millis(400)
            .saturating_mul(1 << expiry)
            .min(Duration::from_secs(60));
        assert_eq!(following - next, interval, "expiry {}", expiry);
        next = following;
    }

    let err = client.handle_timeout(next).unwrap_err();
    assert_eq!(err, Error::ReadTimeout(13));
    assert_eq!(err.code(), ":READ_TIMEOUT_EXPIRED:");
    assert_eq!(*client.state(), State::Failed(err));
    assert_eq!(client.next_timeout(), None);
    assert!(collect_packets(&mut client).is_empty());
}

#[test]
fn timer_does_not_fire_early() {
    let _ = env_logger::try_init();

    let (mut client, _server) = endpoints(dtls12_config());
    let t0 = Instant::now();

    client.handle_timeout(t0).expect("start");
    collect_packets(&mut client);

    client
        .handle_timeout(t0 + Duration::from_millis(399))
        .expect("not due");
    assert!(collect_packets(&mut client).is_empty());

    client
        .handle_timeout(t0 + Duration::from_millis(400))
        .expect("due");
    assert_eq!(collect_packets(&mut client).len(), 1);
}

#[test]
fn partial_ack_resends_only_the_rest() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .client_auth(true)
        .build()
        .expect("config");
    let (mut client, mut server) = endpoints(config);
    let t0 = Instant::now();

    client.handle_timeout(t0).expect("start");
    deliver_packets(&collect_packets(&mut client), &mut server, t0);
    deliver_packets(&collect_packets(&mut server), &mut client, t0);

    // Certificate, CertificateVerify, Finished. The certificate needs two
    // fragments and the first fills a datagram on its own.
    let last_flight = collect_packets(&mut client);
    assert_eq!(last_flight.len(), 2);

    server.handle_packet(&last_flight[0], t0).expect("first half");
    assert_eq!(server.next_timeout(), Some(t0 + Duration::from_millis(100)));

    let t1 = t0 + Duration::from_millis(100);
    server.handle_timeout(t1).expect("ack timer");
    let acks = collect_packets(&mut server);
    assert_eq!(acks.len(), 1);

    deliver_packets(&acks, &mut client, t1);
    assert!(matches!(
        client.flight_status(),
        FlightStatus::AwaitingAck { .. }
    ));
    // Progress restarts the wait.
    let t2 = t1 + Duration::from_millis(400);
    assert_eq!(client.next_timeout(), Some(t2));

    client.handle_timeout(t2).expect("resend");
    let resent = collect_packets(&mut client);
    assert_eq!(resent.len(), 1);
    assert!(resent[0].len() < last_flight[0].len());

    deliver_packets(&resent, &mut server, t2);
    assert!(server.is_connected());

    deliver_packets(&collect_packets(&mut server), &mut client, t2);
    assert_eq!(client.flight_status(), FlightStatus::FullyAcked);
    assert_eq!(client.next_timeout(), None);
    assert_eq!(server.next_timeout(), None);
}

#[test]
fn lost_server_flight_recovers() {
    let _ = env_logger::try_init();

    for protocol in [Protocol::Dtls12, Protocol::Dtls13] {
        let mut pair = Pair::with_hooks(
            config(protocol, HandshakeKind::Full),
            21,
            Box::new(DefaultHooks),
            Box::new(AnomalyHooks::new(1, Anomaly::Drop)),
        );
        let start = pair.now();
        pair.handshake()
            .unwrap_or_else(|e| panic!("{:?}: {}", protocol, e));
        assert!(pair.now() >= start + Duration::from_millis(400));
    }
}

#[test]
fn lost_client_hello_recovers() {
    let _ = env_logger::try_init();

    let mut pair = Pair::with_hooks(
        dtls13_config(),
        22,
        Box::new(AnomalyHooks::new(0, Anomaly::Drop)),
        Box::new(DefaultHooks),
    );
    pair.handshake().expect("handshake");
}

#[test]
fn dtls12_lost_final_flight_is_resent_on_demand() {
    let _ = env_logger::try_init();

    // The server sends the last flight and never arms a timer for it. Only
    // the client's retransmission brings it back.
    let mut pair = Pair::with_hooks(
        dtls12_config(),
        23,
        Box::new(DefaultHooks),
        Box::new(AnomalyHooks::new(3, Anomaly::Drop)),
    );
    pair.handshake().expect("handshake");
}

#[test]
fn dtls13_lost_final_flight_is_resent_on_timer() {
    let _ = env_logger::try_init();

    let mut pair = Pair::with_hooks(
        dtls13_config(),
        24,
        Box::new(AnomalyHooks::new(2, Anomaly::Drop)),
        Box::new(DefaultHooks),
    );
    pair.handshake().expect("handshake");
}

#[test]
fn replayed_datagram_is_ignored() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let t0 = Instant::now();

    client.handle_timeout(t0).expect("start");
    deliver_packets(&collect_packets(&mut client), &mut server, t0);
    let flight = collect_packets(&mut server);
    assert_eq!(flight.len(), 3);

    deliver_packets(&flight[..2], &mut client, t0);
    let first = drain_outputs(&mut client);
    assert_eq!(first.messages.len(), 2);

    deliver_packets(&flight[..1], &mut client, t0);
    let out = drain_outputs(&mut client);
    assert!(out.packets.is_empty());
    assert!(out.messages.is_empty());
}

#[test]
fn duplicate_of_current_flight_does_not_resend() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let t0 = Instant::now();

    client.handle_timeout(t0).expect("start");
    deliver_packets(&collect_packets(&mut client), &mut server, t0);
    let flight = collect_packets(&mut server);
    deliver_packets(&flight[..2], &mut client, t0);
    drain_outputs(&mut client);

    // The server times out and resends the whole flight under new record
    // numbers.
    let t1 = t0 + Duration::from_millis(400);
    server.handle_timeout(t1).expect("server resend");
    let resent = collect_packets(&mut server);
    assert_eq!(resent.len(), 3);

    // Duplicates from the flight being received are not a reason to
    // resend the ClientHello.
    deliver_packets(&resent[..1], &mut client, t1);
    assert!(collect_packets(&mut client).is_empty());

    deliver_packets(&resent[2..], &mut client, t1);
    assert!(client.is_connected());
    assert_eq!(collect_packets(&mut client).len(), 1);
}
