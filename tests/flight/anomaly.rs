//! Transport and record anomalies injected into the server's first flight.

use dflight::anomaly::{Anomaly, AnomalyHooks};
use dflight::script::{Pair, Step};
use dflight::{Config, ContentType, DefaultHooks, FlightHooks, HandshakeKind, Protocol, Role};

use crate::common::*;

fn pair_with(config: Config, anomaly: Anomaly) -> Pair {
    Pair::with_hooks(
        config,
        51,
        Box::new(DefaultHooks),
        Box::new(AnomalyHooks::new(1, anomaly)),
    )
}

#[test]
fn recoverable_anomalies() {
    let _ = env_logger::try_init();

    let anomalies = [
        Anomaly::Drop,
        Anomaly::Duplicate,
        Anomaly::Reverse,
        Anomaly::SplitRecords,
        Anomaly::InjectDiscard,
    ];

    for protocol in [Protocol::Dtls12, Protocol::Dtls13] {
        for anomaly in anomalies {
            let mut pair = pair_with(config(protocol, HandshakeKind::Full), anomaly);
            pair.handshake()
                .unwrap_or_else(|e| panic!("{:?} {:?}: {}", protocol, anomaly, e));
        }
    }
}

#[test]
fn corrupted_record_is_dropped_and_resent() {
    let _ = env_logger::try_init();

    // The first datagram holds ServerHello (73 bytes) followed by the
    // sealed EncryptedExtensions. Byte 100 is inside its ciphertext.
    let mut pair = pair_with(
        dtls13_config(),
        Anomaly::BitFlip {
            datagram: 0,
            byte: 100,
            bit: 0,
        },
    );
    pair.handshake().expect("handshake");
}

#[test]
fn truncated_datagram_is_fatal() {
    let _ = env_logger::try_init();

    let mut pair = pair_with(dtls13_config(), Anomaly::Truncate);
    pair.run([
        Step::Start,
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::ExpectError {
            role: Role::Client,
            code: ":DECODE_ERROR:",
        },
    ])
    .expect("script");
}

#[test]
fn unreadable_epoch_is_fatal() {
    let _ = env_logger::try_init();

    let mut pair = pair_with(dtls13_config(), Anomaly::WrongEpoch(7));
    pair.run([
        Step::Start,
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::ExpectError {
            role: Role::Client,
            code: ":UNEXPECTED_RECORD:",
        },
    ])
    .expect("script");
}

#[test]
fn plaintext_application_data_is_fatal() {
    let _ = env_logger::try_init();

    for protocol in [Protocol::Dtls12, Protocol::Dtls13] {
        let mut pair = pair_with(
            config(protocol, HandshakeKind::Full),
            Anomaly::WrongContentType(ContentType::ApplicationData),
        );
        pair.run([
            Step::Start,
            Step::Deliver {
                from: Role::Client,
                count: None,
            },
            Step::Deliver {
                from: Role::Server,
                count: None,
            },
            Step::ExpectError {
                role: Role::Client,
                code: ":UNEXPECTED_RECORD:",
            },
        ])
        .unwrap_or_else(|e| panic!("{:?}: {}", protocol, e));
    }
}

#[test]
fn anomalies_on_every_attempt_exhaust_the_client() {
    let _ = env_logger::try_init();

    let config = Config::builder().max_timeouts(3).build().expect("config");
    let mut pair = Pair::with_hooks(
        config,
        52,
        Box::new(DefaultHooks),
        Box::new(AnomalyHooks::new(1, Anomaly::Drop).every_attempt()),
    );

    let err = pair.handshake().unwrap_err();
    assert!(
        err.to_string().contains("Flight not acknowledged after 3 timeouts"),
        "{}",
        err
    );
}

#[test]
fn random_corruption_follows_the_configured_seed() {
    let _ = env_logger::try_init();

    let server_flight = |hooks: Box<dyn FlightHooks>| {
        let config = Config::builder().rng_seed(9).build().expect("config");
        let mut pair = Pair::with_hooks(config, 53, Box::new(DefaultHooks), hooks);
        pair.run([
            Step::Start,
            Step::Deliver {
                from: Role::Client,
                count: None,
            },
        ])
        .expect("script");
        pair.take_packets(Role::Server)
    };

    let clean = server_flight(Box::new(DefaultHooks));
    let first = server_flight(Box::new(AnomalyHooks::new(1, Anomaly::RandomBitFlip)));
    let second = server_flight(Box::new(AnomalyHooks::new(1, Anomaly::RandomBitFlip)));

    assert_ne!(first, clean);
    assert_eq!(first, second);
}
