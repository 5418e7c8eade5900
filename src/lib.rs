//! dflight
//!
//! Sans-IO DTLS 1.2 and 1.3 record layer and flight machinery: record and
//! fragment codecs, handshake message reassembly, epoch keys with replay
//! protection, and retransmission with implicit or explicit (ACK)
//! acknowledgement.
//!
//! Handshake message contents are opaque. A [`Connection`] follows a
//! [`FlightPlan`] derived from its [`Config`], fills message bodies through
//! [`FlightHooks`] and protects records with ciphers from a [`KeySource`].
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use dflight::crypto::StaticKeys;
//! use dflight::{Config, Connection, Output, Role};
//!
//! let config = Arc::new(Config::default());
//! let mut client = Connection::new(config, Role::Client, Box::new(StaticKeys::new(1)));
//!
//! let now = Instant::now();
//! client.handle_timeout(now).unwrap();
//!
//! let mut buf = vec![0; 2048];
//! assert!(matches!(client.poll_output(&mut buf), Output::Packet(_)));
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

pub mod anomaly;
pub mod buffer;
pub mod codec;
pub mod crypto;
pub mod epoch;
pub mod flight;
pub mod hooks;
pub mod reassembly;
pub mod retransmit;
pub mod script;

mod config;
mod connection;
mod error;
mod rng;
mod timer;
mod types;
mod window;

pub use config::{Config, ConfigBuilder, MAX_MTU};
pub use connection::{Connection, Output, State};
pub use crypto::{KeySource, RecordCipher};
pub use error::{Error, ErrorKind};
pub use flight::{FlightItem, FlightPlan, FlightSpec, HandshakeKind};
pub use hooks::{DatagramTag, DefaultHooks, FlightHooks, FlightInfo};
pub use retransmit::FlightStatus;
pub use rng::SeededRng;
pub use types::{ContentType, MessageType, Protocol, RecordNumber, Role, MAX_SEQUENCE};
