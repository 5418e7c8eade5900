//! Handshake completion across protocol versions and handshake shapes.

use std::time::Instant;

use dflight::codec::CodecMode;
use dflight::script::{Pair, Received, Step};
use dflight::{Config, HandshakeKind, MessageType, Protocol, Role, State, MAX_MTU};

use crate::common::*;

use MessageType::*;

#[test]
fn dtls13_full_handshake_messages() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let (client_seen, server_seen) = handshake(&mut client, &mut server, Instant::now());

    assert!(client_seen.connected);
    assert!(server_seen.connected);
    assert_eq!(
        client_seen.messages,
        vec![
            ServerHello,
            EncryptedExtensions,
            Certificate,
            CertificateVerify,
            Finished
        ]
    );
    assert_eq!(server_seen.messages, vec![ClientHello, Finished]);

    assert_eq!(client.read_epoch(), 3);
    assert_eq!(client.write_epoch(), 3);
    assert_eq!(server.read_epoch(), 3);
    assert_eq!(server.write_epoch(), 3);
}

#[test]
fn dtls12_full_handshake_messages() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls12_config());
    let (client_seen, server_seen) = handshake(&mut client, &mut server, Instant::now());

    assert_eq!(
        client_seen.messages,
        vec![
            ServerHello,
            Certificate,
            ServerKeyExchange,
            ServerHelloDone,
            Finished
        ]
    );
    assert_eq!(
        server_seen.messages,
        vec![ClientHello, ClientKeyExchange, Finished]
    );

    assert_eq!(client.write_epoch(), 1);
    assert_eq!(server.read_epoch(), 1);
}

#[test]
fn dtls12_client_auth_and_tickets() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .protocol(Protocol::Dtls12)
        .client_auth(true)
        .session_tickets(true)
        .build()
        .expect("config");
    let (mut client, mut server) = endpoints(config);
    let (client_seen, server_seen) = handshake(&mut client, &mut server, Instant::now());

    assert_eq!(
        client_seen.messages,
        vec![
            ServerHello,
            Certificate,
            ServerKeyExchange,
            CertificateRequest,
            ServerHelloDone,
            NewSessionTicket,
            Finished
        ]
    );
    assert_eq!(
        server_seen.messages,
        vec![
            ClientHello,
            Certificate,
            ClientKeyExchange,
            CertificateVerify,
            Finished
        ]
    );
}

#[test]
fn every_handshake_shape_completes() {
    let _ = env_logger::try_init();

    let shapes = [
        (Protocol::Dtls12, HandshakeKind::Full),
        (Protocol::Dtls12, HandshakeKind::Resumption),
        (Protocol::Dtls12, HandshakeKind::HelloRetry),
        (Protocol::Dtls13, HandshakeKind::Full),
        (Protocol::Dtls13, HandshakeKind::Resumption),
        (Protocol::Dtls13, HandshakeKind::HelloRetry),
        (Protocol::Dtls13, HandshakeKind::EarlyData { accepted: true }),
        (Protocol::Dtls13, HandshakeKind::EarlyData { accepted: false }),
    ];

    for (protocol, kind) in shapes {
        for auth in [false, true] {
            for tickets in [false, true] {
                let config = Config::builder()
                    .protocol(protocol)
                    .handshake(kind)
                    .client_auth(auth)
                    .session_tickets(tickets)
                    .build()
                    .expect("config");

                let mut pair = Pair::new(config, 9);
                pair.handshake().unwrap_or_else(|e| {
                    panic!("{:?} {:?} auth={} tickets={}: {}", protocol, kind, auth, tickets, e)
                });
                pair.run([Step::ExpectIdle(Role::Client), Step::ExpectIdle(Role::Server)])
                    .unwrap_or_else(|e| panic!("{:?} {:?}: {}", protocol, kind, e));
            }
        }
    }
}

#[test]
fn dtls13_hello_retry_is_stateless() {
    let _ = env_logger::try_init();

    let config = config(Protocol::Dtls13, HandshakeKind::HelloRetry);
    let (mut client, mut server) = endpoints(config);
    let now = Instant::now();

    client.handle_timeout(now).expect("client start");
    deliver_packets(&collect_packets(&mut client), &mut server, now);

    let out = drain_outputs(&mut server);
    assert_eq!(out.packets.len(), 1);
    assert_eq!(out.messages, vec![ClientHello]);
    // No timer for the HelloRetryRequest.
    assert_eq!(out.timeout, None);
    assert_eq!(server.next_timeout(), None);
}

#[test]
fn dtls13_early_data_accepted() {
    let _ = env_logger::try_init();

    let config = config(Protocol::Dtls13, HandshakeKind::EarlyData { accepted: true });
    let mut pair = Pair::new(config, 3);

    pair.run([
        Step::Start,
        Step::SendApplicationData {
            from: Role::Client,
            data: b"early".to_vec(),
        },
        Step::ExpectPackets {
            from: Role::Client,
            count: 2,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
    ])
    .expect("script");

    assert!(pair
        .received(Role::Server)
        .contains(&Received::EarlyData(b"early".to_vec())));

    pair.handshake().expect("handshake");
    assert!(pair
        .received(Role::Server)
        .contains(&Received::HandshakeMessage(EndOfEarlyData)));
}

#[test]
fn dtls13_early_data_rejected() {
    let _ = env_logger::try_init();

    let config = config(Protocol::Dtls13, HandshakeKind::EarlyData { accepted: false });
    let mut pair = Pair::new(config, 3);

    pair.run([
        Step::Start,
        Step::SendApplicationData {
            from: Role::Client,
            data: b"early".to_vec(),
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
    ])
    .expect("script");

    pair.handshake().expect("handshake");
    assert!(!pair
        .received(Role::Server)
        .iter()
        .any(|r| matches!(r, Received::EarlyData(_))));
    assert!(!pair
        .received(Role::Server)
        .contains(&Received::HandshakeMessage(EndOfEarlyData)));
}

#[test]
fn dtls13_server_issues_ticket_after_handshake() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .session_tickets(true)
        .build()
        .expect("config");
    let mut pair = Pair::new(config, 5);
    pair.handshake().expect("handshake");

    assert!(pair
        .received(Role::Client)
        .contains(&Received::HandshakeMessage(NewSessionTicket)));
    // The ticket flight was acknowledged.
    assert_eq!(*pair.connection(Role::Server).state(), State::HandshakeComplete);

    pair.run([
        Step::SendNewSessionTicket,
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectIdle(Role::Server),
    ])
    .expect("script");

    let tickets = pair
        .received(Role::Client)
        .iter()
        .filter(|r| **r == Received::HandshakeMessage(NewSessionTicket))
        .count();
    assert_eq!(tickets, 2);
}

#[test]
fn application_data_both_ways() {
    let _ = env_logger::try_init();

    for protocol in [Protocol::Dtls12, Protocol::Dtls13] {
        let config = config(protocol, HandshakeKind::Full);
        let mut pair = Pair::new(config, 11);
        pair.handshake().expect("handshake");

        pair.run([
            Step::SendApplicationData {
                from: Role::Client,
                data: b"ping".to_vec(),
            },
            Step::Deliver {
                from: Role::Client,
                count: None,
            },
            Step::ExpectApplicationData {
                role: Role::Server,
                data: b"ping".to_vec(),
            },
            Step::SendApplicationData {
                from: Role::Server,
                data: b"pong".to_vec(),
            },
            Step::Deliver {
                from: Role::Server,
                count: None,
            },
            Step::ExpectApplicationData {
                role: Role::Client,
                data: b"pong".to_vec(),
            },
        ])
        .expect("script");
    }
}

#[test]
fn large_application_data_is_split_by_mtu() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    let data = vec![7u8; 3000];
    client.send_application_data(&data, now).expect("send");
    let packets = collect_packets(&mut client);
    assert_eq!(packets.len(), 3);
    assert!(packets.iter().all(|p| p.len() <= 1150));

    deliver_packets(&packets, &mut server, now);
    let out = drain_outputs(&mut server);
    let received: Vec<u8> = out.app_data.concat();
    assert_eq!(received, data);
}

#[test]
fn largest_mtu_keeps_record_lengths_intact() {
    let _ = env_logger::try_init();

    let config = Config::builder().mtu(MAX_MTU).build().expect("config");
    let (mut client, mut server) = endpoints(config);
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    let data = vec![3u8; 66_000];
    client.send_application_data(&data, now).expect("send");
    let packets = collect_packets(&mut client);
    assert!(packets.len() >= 4);
    assert!(packets.iter().all(|p| p.len() <= MAX_MTU));

    deliver_packets(&packets, &mut server, now);
    let received: Vec<u8> = drain_outputs(&mut server).app_data.concat();
    assert_eq!(received, data);
}

#[test]
fn compact_headers() {
    let _ = env_logger::try_init();

    let variants = [(false, false), (true, false), (false, true), (true, true)];

    for (short_seq, omit_length) in variants {
        let config = Config::builder()
            .codec_mode(CodecMode::Compact)
            .short_record_sequence(short_seq)
            .omit_record_length(omit_length)
            .client_auth(true)
            .build()
            .expect("config");

        let mut pair = Pair::new(config, 13);
        pair.handshake()
            .unwrap_or_else(|e| panic!("short={} omit={}: {}", short_seq, omit_length, e));

        pair.run([
            Step::SendApplicationData {
                from: Role::Client,
                data: b"compact".to_vec(),
            },
            Step::Deliver {
                from: Role::Client,
                count: None,
            },
            Step::ExpectApplicationData {
                role: Role::Server,
                data: b"compact".to_vec(),
            },
            Step::ExpectIdle(Role::Client),
        ])
        .unwrap_or_else(|e| panic!("short={} omit={}: {}", short_seq, omit_length, e));
    }
}

#[test]
fn no_timer_before_start_or_after_completion() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    assert_eq!(client.next_timeout(), None);
    assert_eq!(server.next_timeout(), None);

    handshake(&mut client, &mut server, Instant::now());
    assert_eq!(client.next_timeout(), None);
    assert_eq!(server.next_timeout(), None);
}
