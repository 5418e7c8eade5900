use std::time::Duration;

use crate::codec::CodecMode;
use crate::flight::HandshakeKind;
use crate::types::Protocol;
use crate::Error;

/// Largest accepted `mtu`.
pub const MAX_MTU: usize = 13 + (1 << 14) + 256;

/// Connection configuration.
///
/// Both peers of a handshake must agree on the protocol, the handshake
/// kind, client authentication and session tickets, since those decide the
/// shape of every flight.
#[derive(Debug, Clone)]
pub struct Config {
    protocol: Protocol,
    codec_mode: CodecMode,
    short_record_sequence: bool,
    omit_record_length: bool,
    handshake: HandshakeKind,
    client_auth: bool,
    session_tickets: bool,
    mtu: usize,
    max_fragment_len: usize,
    initial_rto: Duration,
    max_rto: Duration,
    max_timeouts: usize,
    prior_epoch_expiration: Duration,
    max_epoch_skew: u16,
    max_queue_rx: usize,
    max_queue_tx: usize,
    max_flight_messages: u16,
    max_buffered_bytes: usize,
    max_handshake_message_len: usize,
    max_tracked_records: usize,
    max_pending_acks: usize,
    max_empty_records: usize,
    max_key_updates: usize,
    allow_pipelining: bool,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            protocol: Protocol::Dtls13,
            codec_mode: CodecMode::Legacy,
            short_record_sequence: false,
            omit_record_length: false,
            handshake: HandshakeKind::Full,
            client_auth: false,
            session_tickets: false,
            mtu: 1150,
            max_fragment_len: 1024,
            initial_rto: Duration::from_millis(400),
            max_rto: Duration::from_secs(60),
            max_timeouts: 13,
            prior_epoch_expiration: Duration::from_secs(5 * 60),
            max_epoch_skew: 1,
            max_queue_rx: 30,
            max_queue_tx: 32,
            max_flight_messages: 7,
            max_buffered_bytes: 65536,
            max_handshake_message_len: 65536,
            max_tracked_records: 64,
            max_pending_acks: 32,
            max_empty_records: 32,
            max_key_updates: 32,
            allow_pipelining: false,
            rng_seed: None,
        }
    }

    /// Protocol variant.
    #[inline(always)]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Header shape for records above epoch 0.
    ///
    /// Epoch 0 always uses the legacy shape.
    #[inline(always)]
    pub fn codec_mode(&self) -> CodecMode {
        self.codec_mode
    }

    /// Use the 8-bit sequence number in compact record headers.
    #[inline(always)]
    pub fn short_record_sequence(&self) -> bool {
        self.short_record_sequence
    }

    /// Omit the length field of compact record headers.
    ///
    /// Such records run to the end of the datagram, so each is sent alone.
    #[inline(always)]
    pub fn omit_record_length(&self) -> bool {
        self.omit_record_length
    }

    #[inline(always)]
    pub fn handshake(&self) -> HandshakeKind {
        self.handshake
    }

    /// Whether the server requests a client certificate.
    #[inline(always)]
    pub fn client_auth(&self) -> bool {
        self.client_auth
    }

    /// Whether the server issues a NewSessionTicket.
    #[inline(always)]
    pub fn session_tickets(&self) -> bool {
        self.session_tickets
    }

    /// Max transmission unit.
    ///
    /// The largest datagram we will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest handshake fragment body in a single record.
    #[inline(always)]
    pub fn max_fragment_len(&self) -> usize {
        self.max_fragment_len
    }

    /// Retransmission interval of the first attempt.
    ///
    /// Every flight restarts with this value. Doubled for every retry.
    #[inline(always)]
    pub fn initial_rto(&self) -> Duration {
        self.initial_rto
    }

    /// Ceiling for the doubled retransmission interval.
    #[inline(always)]
    pub fn max_rto(&self) -> Duration {
        self.max_rto
    }

    /// Timer expiries after which a flight is considered lost.
    #[inline(always)]
    pub fn max_timeouts(&self) -> usize {
        self.max_timeouts
    }

    /// How long a superseded epoch stays valid.
    #[inline(always)]
    pub fn prior_epoch_expiration(&self) -> Duration {
        self.prior_epoch_expiration
    }

    /// How many epochs ahead of the current read epoch a record may be
    /// and still be held back instead of rejected.
    #[inline(always)]
    pub fn max_epoch_skew(&self) -> u16 {
        self.max_epoch_skew
    }

    /// Max records held back waiting for a future epoch.
    #[inline(always)]
    pub fn max_queue_rx(&self) -> usize {
        self.max_queue_rx
    }

    /// Max outgoing datagrams to buffer.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }

    /// How far past the next expected message sequence fragments are buffered.
    #[inline(always)]
    pub fn max_flight_messages(&self) -> u16 {
        self.max_flight_messages
    }

    #[inline(always)]
    pub fn max_buffered_bytes(&self) -> usize {
        self.max_buffered_bytes
    }

    #[inline(always)]
    pub fn max_handshake_message_len(&self) -> usize {
        self.max_handshake_message_len
    }

    /// Sent record numbers remembered for matching incoming ACKs.
    #[inline(always)]
    pub fn max_tracked_records(&self) -> usize {
        self.max_tracked_records
    }

    /// Received record numbers held for the next outgoing ACK.
    #[inline(always)]
    pub fn max_pending_acks(&self) -> usize {
        self.max_pending_acks
    }

    /// Consecutive records without progress tolerated.
    #[inline(always)]
    pub fn max_empty_records(&self) -> usize {
        self.max_empty_records
    }

    /// KeyUpdates accepted from the peer over the connection lifetime.
    #[inline(always)]
    pub fn max_key_updates(&self) -> usize {
        self.max_key_updates
    }

    /// Start post-handshake flights before the previous one is acknowledged.
    #[inline(always)]
    pub fn allow_pipelining(&self) -> bool {
        self.allow_pipelining
    }

    /// Seed for the anomaly injector's randomness.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    protocol: Protocol,
    codec_mode: CodecMode,
    short_record_sequence: bool,
    omit_record_length: bool,
    handshake: HandshakeKind,
    client_auth: bool,
    session_tickets: bool,
    mtu: usize,
    max_fragment_len: usize,
    initial_rto: Duration,
    max_rto: Duration,
    max_timeouts: usize,
    prior_epoch_expiration: Duration,
    max_epoch_skew: u16,
    max_queue_rx: usize,
    max_queue_tx: usize,
    max_flight_messages: u16,
    max_buffered_bytes: usize,
    max_handshake_message_len: usize,
    max_tracked_records: usize,
    max_pending_acks: usize,
    max_empty_records: usize,
    max_key_updates: usize,
    allow_pipelining: bool,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Defaults to DTLS 1.3.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Compact headers require DTLS 1.3. Defaults to legacy.
    pub fn codec_mode(mut self, mode: CodecMode) -> Self {
        self.codec_mode = mode;
        self
    }

    pub fn short_record_sequence(mut self, enabled: bool) -> Self {
        self.short_record_sequence = enabled;
        self
    }

    pub fn omit_record_length(mut self, enabled: bool) -> Self {
        self.omit_record_length = enabled;
        self
    }

    /// Defaults to a full handshake.
    pub fn handshake(mut self, kind: HandshakeKind) -> Self {
        self.handshake = kind;
        self
    }

    pub fn client_auth(mut self, enabled: bool) -> Self {
        self.client_auth = enabled;
        self
    }

    pub fn session_tickets(mut self, enabled: bool) -> Self {
        self.session_tickets = enabled;
        self
    }

    /// Defaults to 1150. At most [`MAX_MTU`].
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Defaults to 1024.
    pub fn max_fragment_len(mut self, len: usize) -> Self {
        self.max_fragment_len = len;
        self
    }

    /// Defaults to 400ms.
    pub fn initial_rto(mut self, rto: Duration) -> Self {
        self.initial_rto = rto;
        self
    }

    /// Defaults to 60 seconds.
    pub fn max_rto(mut self, rto: Duration) -> Self {
        self.max_rto = rto;
        self
    }

    /// Defaults to 13.
    pub fn max_timeouts(mut self, n: usize) -> Self {
        self.max_timeouts = n;
        self
    }

    /// Defaults to 5 minutes.
    pub fn prior_epoch_expiration(mut self, d: Duration) -> Self {
        self.prior_epoch_expiration = d;
        self
    }

    /// Defaults to 1.
    pub fn max_epoch_skew(mut self, skew: u16) -> Self {
        self.max_epoch_skew = skew;
        self
    }

    /// Defaults to 30.
    pub fn max_queue_rx(mut self, n: usize) -> Self {
        self.max_queue_rx = n;
        self
    }

    /// Defaults to 32.
    pub fn max_queue_tx(mut self, n: usize) -> Self {
        self.max_queue_tx = n;
        self
    }

    /// Defaults to 7.
    pub fn max_flight_messages(mut self, n: u16) -> Self {
        self.max_flight_messages = n;
        self
    }

    /// Defaults to 65536.
    pub fn max_buffered_bytes(mut self, n: usize) -> Self {
        self.max_buffered_bytes = n;
        self
    }

    /// Defaults to 65536.
    pub fn max_handshake_message_len(mut self, n: usize) -> Self {
        self.max_handshake_message_len = n;
        self
    }

    /// Defaults to 64.
    pub fn max_tracked_records(mut self, n: usize) -> Self {
        self.max_tracked_records = n;
        self
    }

    /// Defaults to 32.
    pub fn max_pending_acks(mut self, n: usize) -> Self {
        self.max_pending_acks = n;
        self
    }

    /// Defaults to 32.
    pub fn max_empty_records(mut self, n: usize) -> Self {
        self.max_empty_records = n;
        self
    }

    /// Defaults to 32.
    pub fn max_key_updates(mut self, n: usize) -> Self {
        self.max_key_updates = n;
        self
    }

    /// Only valid for DTLS 1.3. Defaults to false.
    pub fn allow_pipelining(mut self, enabled: bool) -> Self {
        self.allow_pipelining = enabled;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` for combinations that cannot work.
    pub fn build(self) -> Result<Config, Error> {
        if self.protocol == Protocol::Dtls12 {
            if self.codec_mode == CodecMode::Compact {
                return Err(Error::ConfigError(
                    "compact headers require DTLS 1.3".into(),
                ));
            }
            if self.allow_pipelining {
                return Err(Error::ConfigError(
                    "pipelining requires explicit acknowledgements".into(),
                ));
            }
            if matches!(self.handshake, HandshakeKind::EarlyData { .. }) {
                return Err(Error::ConfigError("early data requires DTLS 1.3".into()));
            }
        }

        if self.max_timeouts == 0 {
            return Err(Error::ConfigError("max_timeouts must be at least 1".into()));
        }

        if self.initial_rto.is_zero() || self.max_rto < self.initial_rto {
            return Err(Error::ConfigError(
                "max_rto must be at least initial_rto".into(),
            ));
        }

        if self.max_fragment_len == 0 {
            return Err(Error::ConfigError("max_fragment_len must be positive".into()));
        }

        // Largest record header and fragment header plus AEAD overhead.
        const MIN_MTU: usize = 13 + 12 + 17 + 1;
        if self.mtu < MIN_MTU {
            return Err(Error::ConfigError(format!("mtu below {}", MIN_MTU)));
        }

        // A legacy header and one record of 2^14 bytes plus expansion.
        if self.mtu > MAX_MTU {
            return Err(Error::ConfigError(format!("mtu above {}", MAX_MTU)));
        }

        Ok(Config {
            protocol: self.protocol,
            codec_mode: self.codec_mode,
            short_record_sequence: self.short_record_sequence,
            omit_record_length: self.omit_record_length,
            handshake: self.handshake,
            client_auth: self.client_auth,
            session_tickets: self.session_tickets,
            mtu: self.mtu,
            max_fragment_len: self.max_fragment_len,
            initial_rto: self.initial_rto,
            max_rto: self.max_rto,
            max_timeouts: self.max_timeouts,
            prior_epoch_expiration: self.prior_epoch_expiration,
            max_epoch_skew: self.max_epoch_skew,
            max_queue_rx: self.max_queue_rx,
            max_queue_tx: self.max_queue_tx,
            max_flight_messages: self.max_flight_messages,
            max_buffered_bytes: self.max_buffered_bytes,
            max_handshake_message_len: self.max_handshake_message_len,
            max_tracked_records: self.max_tracked_records,
            max_pending_acks: self.max_pending_acks,
            max_empty_records: self.max_empty_records,
            max_key_updates: self.max_key_updates,
            allow_pipelining: self.allow_pipelining,
            rng_seed: self.rng_seed,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
