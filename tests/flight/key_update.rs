//! Post-handshake KeyUpdate and NewSessionTicket flights.

use std::time::{Duration, Instant};

use dflight::script::{Pair, Received, Step};
use dflight::{Config, Error, MessageType, Role, State};

use crate::common::*;

fn connected_pair(config: Config) -> Pair {
    let mut pair = Pair::new(config, 31);
    pair.handshake().expect("handshake");
    pair
}

#[test]
fn repeated_key_updates_advance_epochs() {
    let _ = env_logger::try_init();

    let mut pair = connected_pair(dtls13_config());

    for n in 0..3u16 {
        pair.run([
            Step::UpdateKeys(Role::Client),
            Step::ExpectPackets {
                from: Role::Client,
                count: 1,
            },
            Step::Deliver {
                from: Role::Client,
                count: None,
            },
            Step::ExpectEpochs {
                role: Role::Server,
                read: 4 + n,
                write: 3,
            },
            // Not switched until acknowledged.
            Step::ExpectEpochs {
                role: Role::Client,
                read: 3,
                write: 3 + n,
            },
            Step::Deliver {
                from: Role::Server,
                count: None,
            },
            Step::ExpectEpochs {
                role: Role::Client,
                read: 3,
                write: 4 + n,
            },
            Step::ExpectIdle(Role::Client),
        ])
        .unwrap_or_else(|e| panic!("update {}: {}", n, e));
    }

    pair.run([
        Step::SendApplicationData {
            from: Role::Client,
            data: b"after".to_vec(),
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectApplicationData {
            role: Role::Server,
            data: b"after".to_vec(),
        },
    ])
    .expect("data after updates");
}

#[test]
fn server_key_update() {
    let _ = env_logger::try_init();

    let mut pair = connected_pair(dtls13_config());
    pair.run([
        Step::UpdateKeys(Role::Server),
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectEpochs {
            role: Role::Server,
            read: 3,
            write: 4,
        },
        Step::ExpectEpochs {
            role: Role::Client,
            read: 4,
            write: 3,
        },
    ])
    .expect("script");

    assert!(pair
        .received(Role::Client)
        .contains(&Received::HandshakeMessage(MessageType::KeyUpdate)));
}

#[test]
fn too_many_key_updates() {
    let _ = env_logger::try_init();

    let config = Config::builder().max_key_updates(2).build().expect("config");
    let mut pair = connected_pair(config);

    let round = [
        Step::UpdateKeys(Role::Client),
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
    ];

    pair.run(round.clone()).expect("first");
    pair.run(round).expect("second");

    pair.run([
        Step::UpdateKeys(Role::Client),
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectError {
            role: Role::Server,
            code: ":TOO_MANY_KEY_UPDATES:",
        },
    ])
    .expect("third");
}

#[test]
fn pipelined_post_handshake_messages() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .allow_pipelining(true)
        .build()
        .expect("config");
    let mut pair = connected_pair(config);

    pair.run([
        Step::SendNewSessionTicket,
        Step::UpdateKeys(Role::Server),
        Step::ExpectPackets {
            from: Role::Server,
            count: 2,
        },
    ])
    .expect("both sent");
    assert_eq!(
        *pair.connection(Role::Server).state(),
        State::PostHandshake { pending: 2 }
    );

    pair.run([
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectEpochs {
            role: Role::Server,
            read: 3,
            write: 4,
        },
        Step::ExpectEpochs {
            role: Role::Client,
            read: 4,
            write: 3,
        },
        Step::ExpectIdle(Role::Server),
    ])
    .expect("acknowledged");
    assert_eq!(
        *pair.connection(Role::Server).state(),
        State::HandshakeComplete
    );
}

#[test]
fn post_handshake_messages_queue_without_pipelining() {
    let _ = env_logger::try_init();

    let mut pair = connected_pair(dtls13_config());

    pair.run([
        Step::SendNewSessionTicket,
        Step::UpdateKeys(Role::Server),
        Step::ExpectPackets {
            from: Role::Server,
            count: 1,
        },
    ])
    .expect("one sent");
    assert_eq!(
        *pair.connection(Role::Server).state(),
        State::PostHandshake { pending: 2 }
    );

    pair.run([
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        // The queued KeyUpdate goes out once the ticket is acknowledged.
        Step::ExpectPackets {
            from: Role::Server,
            count: 1,
        },
        Step::ExpectEpochs {
            role: Role::Server,
            read: 3,
            write: 3,
        },
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::ExpectEpochs {
            role: Role::Server,
            read: 3,
            write: 4,
        },
        Step::ExpectIdle(Role::Server),
    ])
    .expect("drained in order");
    assert_eq!(
        *pair.connection(Role::Server).state(),
        State::HandshakeComplete
    );
}

#[test]
fn key_update_is_never_pipelined() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .allow_pipelining(true)
        .build()
        .expect("config");
    let mut pair = connected_pair(config);

    pair.run([
        Step::UpdateKeys(Role::Client),
        Step::UpdateKeys(Role::Client),
        Step::ExpectPackets {
            from: Role::Client,
            count: 1,
        },
    ])
    .expect("second queued");
    assert_eq!(
        *pair.connection(Role::Client).state(),
        State::PostHandshake { pending: 2 }
    );
}

#[test]
fn lost_key_update_is_retransmitted() {
    let _ = env_logger::try_init();

    let mut pair = connected_pair(dtls13_config());
    pair.run([
        Step::UpdateKeys(Role::Client),
        Step::Drop {
            from: Role::Client,
            count: None,
        },
        Step::Advance(Duration::from_millis(400)),
        Step::ExpectPackets {
            from: Role::Client,
            count: 1,
        },
        Step::Deliver {
            from: Role::Client,
            count: None,
        },
        Step::Deliver {
            from: Role::Server,
            count: None,
        },
        Step::ExpectEpochs {
            role: Role::Client,
            read: 3,
            write: 4,
        },
    ])
    .expect("script");
}

#[test]
fn misuse_is_rejected_without_failing() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let now = Instant::now();

    assert!(matches!(client.update_keys(now), Err(Error::InvalidState(_))));
    assert_eq!(*client.state(), State::PreHandshake);

    handshake(&mut client, &mut server, now);
    assert!(matches!(
        client.send_new_session_ticket(now),
        Err(Error::InvalidState(_))
    ));
    assert!(client.is_connected());

    let (mut client, mut server) = endpoints(dtls12_config());
    handshake(&mut client, &mut server, now);
    assert!(matches!(
        server.send_new_session_ticket(now),
        Err(Error::InvalidState(_))
    ));
    assert!(server.is_connected());
}
