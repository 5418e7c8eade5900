//! Epoch transitions, prior-epoch retention and read skew.

use std::time::{Duration, Instant};

use dflight::{Config, ContentType, Error};

use crate::common::*;

#[test]
fn prior_epoch_readable_until_expiry() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    client.send_application_data(b"A", now).expect("A");
    let a = collect_packets(&mut client);
    client.send_application_data(b"B", now).expect("B");
    let b = collect_packets(&mut client);

    client.update_keys(now).expect("update");
    let key_update = collect_packets(&mut client);
    assert_eq!(key_update.len(), 1);

    deliver_packets(&key_update, &mut server, now);
    assert_eq!(server.read_epoch(), 4);

    // Epoch 3 is still readable right after the switch.
    deliver_packets(&a, &mut server, now);
    let out = drain_outputs(&mut server);
    assert_eq!(out.app_data, vec![b"A".to_vec()]);

    // Past the retention window it is silently dropped.
    let later = now + Duration::from_secs(301);
    server.handle_packet(&b[0], later).expect("stale record is no error");
    let out = drain_outputs(&mut server);
    assert!(out.app_data.is_empty());
    assert!(server.is_connected());
}

#[test]
fn retention_is_configurable() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .prior_epoch_expiration(Duration::from_secs(10))
        .build()
        .expect("config");
    let (mut client, mut server) = endpoints(config);
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    client.send_application_data(b"A", now).expect("A");
    let a = collect_packets(&mut client);
    client.update_keys(now).expect("update");
    deliver_packets(&collect_packets(&mut client), &mut server, now);

    server
        .handle_packet(&a[0], now + Duration::from_secs(11))
        .expect("stale");
    assert!(drain_outputs(&mut server).app_data.is_empty());
}

#[test]
fn write_epoch_switches_after_ack() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    client.update_keys(now).expect("update");
    assert_eq!(client.write_epoch(), 3);

    // Data sent before the ACK still goes out at the old epoch.
    client.send_application_data(b"old", now).expect("send");
    let old = collect_packets(&mut client);

    assert_eq!(old.len(), 2);

    deliver_packets(&old, &mut server, now);
    let first = drain_outputs(&mut server);
    assert_eq!(first.app_data, vec![b"old".to_vec()]);

    deliver_packets(&first.packets, &mut client, now);
    assert_eq!(client.write_epoch(), 4);

    client.send_application_data(b"new", now).expect("send");
    deliver_packets(&collect_packets(&mut client), &mut server, now);
    assert_eq!(drain_outputs(&mut server).app_data, vec![b"new".to_vec()]);
}

#[test]
fn future_epoch_beyond_skew_is_fatal() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    let packet = record(ContentType::ApplicationData, 5, 0, b"ahead");
    let err = server.handle_packet(&packet, now).unwrap_err();
    assert_eq!(err, Error::UnexpectedRecord(ContentType::ApplicationData, 5));
}

#[test]
fn handshake_epoch_is_held_until_readable() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls13_config());
    let now = Instant::now();

    client.handle_timeout(now).expect("start");
    deliver_packets(&collect_packets(&mut client), &mut server, now);
    let flight = collect_packets(&mut server);
    assert_eq!(flight.len(), 3);

    // Epoch 2 records before the ServerHello that makes them readable.
    deliver_packets(&flight[1..], &mut client, now);
    let out = drain_outputs(&mut client);
    assert!(out.messages.is_empty());
    assert_eq!(client.read_epoch(), 0);

    deliver_packets(&flight[..1], &mut client, now);
    let out = drain_outputs(&mut client);
    assert!(out.connected);
    assert_eq!(out.messages.len(), 5);
    assert_eq!(out.packets.len(), 1);
}

#[test]
fn dtls12_ccs_opens_epoch_one() {
    let _ = env_logger::try_init();

    let (mut client, mut server) = endpoints(dtls12_config());
    let now = Instant::now();
    handshake(&mut client, &mut server, now);

    assert_eq!(client.read_epoch(), 1);
    assert_eq!(client.write_epoch(), 1);
    assert_eq!(server.read_epoch(), 1);
    assert_eq!(server.write_epoch(), 1);
}
