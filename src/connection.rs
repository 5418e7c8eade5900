//! A single DTLS endpoint: record layer, reassembly, epochs and flights.
//!
//! The connection is sans-IO. Datagrams go in through
//! [`handle_packet`](Connection::handle_packet), the clock moves through
//! [`handle_timeout`](Connection::handle_timeout), and everything the
//! connection wants to say comes out of
//! [`poll_output`](Connection::poll_output).
//!
//! Any error returned from an entry point is fatal. The connection latches
//! into [`State::Failed`] and every later call returns the same error.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{Buf, BufferPool};
use crate::codec::{
    decode_fragments, encode_fragment, encode_fragments, parse_alert, parse_change_cipher_spec,
    split_datagram, write_legacy_header, write_unified_header, Ack, CodecMode, FragmentHeader,
    Message, RawHeader, RawRecord, RecordHeader, UnifiedHeader, ALERT_LEVEL_FATAL, DTLS1_2,
    LEGACY_FRAGMENT_HEADER_LEN, LEGACY_RECORD_HEADER_LEN, MAX_RECORDS_PER_DATAGRAM,
};
use crate::crypto::KeySource;
use crate::epoch::{next_epoch, DeferredRecords, EpochCheck, EpochTable};
use crate::flight::{FlightItem, FlightPlan, FlightSpec, HandshakeKind};
use crate::hooks::{DatagramTag, DefaultHooks, FlightHooks, FlightInfo};
use crate::reassembly::{Delivery, Outcome, Reassembler};
use crate::retransmit::{AckMode, AckResult, FlightStatus, Retransmitter};
use crate::rng::SeededRng;
use crate::types::{ContentType, MessageType, Protocol, RecordNumber, Role};
use crate::{Config, Error};

/// Output from polling the connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Output<'a> {
    /// A datagram to send to the peer.
    Packet(&'a [u8]),
    /// The handshake completed.
    Connected,
    /// A complete handshake message from the peer was consumed.
    HandshakeMessage(MessageType),
    /// Application data from the peer.
    ApplicationData(&'a [u8]),
    /// 0-RTT data accepted by the server.
    EarlyData(&'a [u8]),
    /// Nothing more right now. Call `handle_timeout` at this instant.
    Timeout(Instant),
    /// Nothing more and no timer armed.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    PreHandshake,
    /// Waiting on, or about to send, flight `flight` of the plan.
    Handshaking { flight: usize },
    HandshakeComplete,
    /// Post-handshake flights sent and not yet acknowledged.
    PostHandshake { pending: usize },
    Failed(Error),
}

#[derive(Debug)]
enum Event {
    Connected,
    HandshakeMessage(MessageType),
    ApplicationData(Buf),
    EarlyData(Buf),
}

pub struct Connection {
    config: Arc<Config>,
    role: Role,
    plan: FlightPlan,
    keys: Box<dyn KeySource>,
    hooks: Box<dyn FlightHooks>,
    /// Lent to the hooks for randomised datagram rewrites.
    rng: SeededRng,

    state: State,

    epochs: EpochTable,
    deferred: DeferredRecords,
    reassembler: Reassembler,
    retransmit: Retransmitter,

    /// Pool of buffers
    buffers_free: BufferPool,

    /// Datagrams ready for `poll_output`.
    queue_tx: VecDeque<Buf>,

    /// Datagrams of the transmission being built.
    batch: Vec<Buf>,
    batch_records: usize,
    /// The last datagram of the batch ends in a record without length.
    batch_closed: bool,

    events: VecDeque<Event>,

    /// Flight of the plan we are receiving or about to send.
    cursor: usize,
    /// Items of the peer flight at `cursor` received so far.
    received: Vec<bool>,
    /// A ChangeCipherSpec arrived before the messages preceding it.
    pending_ccs: bool,

    /// Plan index of the flight held by the retransmitter, `None` for a
    /// post-handshake flight.
    tx_flight: Option<usize>,
    /// Transmissions of the current outgoing flight so far.
    attempt: usize,

    /// Next handshake message sequence for sending.
    next_send_seq: u16,

    /// Consecutive records that made no progress.
    empty_records: usize,
    key_updates_received: usize,
    /// Our KeyUpdate is in the outstanding flight.
    pending_key_update: bool,
    /// Post-handshake messages waiting for the outstanding flight.
    queued_post: VecDeque<MessageType>,
    /// Post-handshake messages in the outstanding flight.
    post_in_flight: usize,

    /// DTLS 1.2: when to forget our untimed final flight.
    final_flight_expires: Option<Instant>,
    last_on_demand_resend: Option<Instant>,

    /// Application data that arrived before the handshake completed.
    held: VecDeque<Buf>,
}

impl Connection {
    /// Create a connection with default hooks.
    pub fn new(config: Arc<Config>, role: Role, keys: Box<dyn KeySource>) -> Connection {
        Self::with_hooks(config, role, keys, Box::new(DefaultHooks))
    }

    pub fn with_hooks(
        config: Arc<Config>,
        role: Role,
        keys: Box<dyn KeySource>,
        hooks: Box<dyn FlightHooks>,
    ) -> Connection {
        let plan = FlightPlan::new(&config);

        let (delivery, ack_mode) = match config.protocol() {
            Protocol::Dtls12 => (Delivery::InOrder, AckMode::Implicit),
            Protocol::Dtls13 => (Delivery::AnyOrder, AckMode::Explicit),
        };

        let reassembler = Reassembler::new(
            delivery,
            config.max_flight_messages(),
            config.max_handshake_message_len(),
            config.max_buffered_bytes(),
        );

        let retransmit = Retransmitter::new(
            ack_mode,
            config.initial_rto(),
            config.max_rto(),
            config.max_timeouts(),
            config.max_tracked_records(),
            config.max_pending_acks(),
        );

        let epochs = EpochTable::new(config.prior_epoch_expiration(), config.max_epoch_skew());

        let rng = SeededRng::new(config.rng_seed());

        let mut connection = Connection {
            config,
            role,
            plan,
            keys,
            hooks,
            rng,
            state: State::PreHandshake,
            epochs,
            deferred: DeferredRecords::default(),
            reassembler,
            retransmit,
            buffers_free: BufferPool::default(),
            queue_tx: VecDeque::new(),
            batch: Vec::new(),
            batch_records: 0,
            batch_closed: false,
            events: VecDeque::new(),
            cursor: 0,
            received: Vec::new(),
            pending_ccs: false,
            tx_flight: None,
            attempt: 0,
            next_send_seq: 0,
            empty_records: 0,
            key_updates_received: 0,
            pending_key_update: false,
            queued_post: VecDeque::new(),
            post_in_flight: 0,
            final_flight_expires: None,
            last_on_demand_resend: None,
            held: VecDeque::new(),
        };

        connection.enter_peer_flight();
        connection
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn plan(&self) -> &FlightPlan {
        &self.plan
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            State::HandshakeComplete | State::PostHandshake { .. }
        )
    }

    pub fn read_epoch(&self) -> u16 {
        self.epochs.current_read_epoch()
    }

    pub fn write_epoch(&self) -> u16 {
        self.epochs.current_write_epoch()
    }

    /// Status of the outgoing flight.
    pub fn flight_status(&self) -> FlightStatus {
        self.retransmit.status()
    }

    /// The earliest armed timer, `None` when idle.
    pub fn next_timeout(&self) -> Option<Instant> {
        if let State::Failed(_) = self.state {
            return None;
        }
        self.retransmit.next_timeout()
    }

    /// Process one received datagram.
    pub fn handle_packet(&mut self, packet: &[u8], now: Instant) -> Result<(), Error> {
        self.check_failed()?;
        let result = self.process_packet(packet, now);
        self.latch(result)
    }

    /// Drive timers. The client starts the handshake on its first call.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.check_failed()?;
        let result = self.process_timeout(now);
        self.latch(result)
    }

    /// Queue application data. Allowed once connected, or for a DTLS 1.3
    /// client offering early data before that.
    ///
    /// Calling this too early returns `InvalidState` without failing the
    /// connection.
    pub fn send_application_data(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        self.check_failed()?;
        if !self.is_connected() && !self.can_send_early_data() {
            return Err(Error::InvalidState("handshake not complete"));
        }
        let result = self.write_application_data(data, now);
        self.latch(result)
    }

    /// Send a KeyUpdate. The write epoch advances once it is acknowledged.
    pub fn update_keys(&mut self, now: Instant) -> Result<(), Error> {
        self.check_failed()?;
        self.check_post_handshake()?;
        let result = self.send_post_handshake(MessageType::KeyUpdate, now);
        self.latch(result)
    }

    /// Issue a NewSessionTicket (DTLS 1.3 server).
    pub fn send_new_session_ticket(&mut self, now: Instant) -> Result<(), Error> {
        self.check_failed()?;
        self.check_post_handshake()?;
        if self.role != Role::Server {
            return Err(Error::InvalidState("only servers issue tickets"));
        }
        let result = self.send_post_handshake(MessageType::NewSessionTicket, now);
        self.latch(result)
    }

    fn check_post_handshake(&self) -> Result<(), Error> {
        if self.protocol() != Protocol::Dtls13 {
            return Err(Error::InvalidState("post-handshake messages require DTLS 1.3"));
        }
        if !self.is_connected() {
            return Err(Error::InvalidState("handshake not complete"));
        }
        Ok(())
    }

    fn can_send_early_data(&self) -> bool {
        self.role == Role::Client
            && matches!(self.config.handshake(), HandshakeKind::EarlyData { .. })
            && self.epochs.current_write_epoch() == 1
    }

    /// Poll for the next output. `buf` must hold the largest datagram, which
    /// is [`Config::mtu`] bytes.
    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a> {
        if let State::Failed(_) = self.state {
            return Output::Idle;
        }

        if let Some(event) = self.events.pop_front() {
            return match event {
                Event::Connected => Output::Connected,
                Event::HandshakeMessage(t) => Output::HandshakeMessage(t),
                Event::ApplicationData(data) => Output::ApplicationData(self.copy_out(data, buf)),
                Event::EarlyData(data) => Output::EarlyData(self.copy_out(data, buf)),
            };
        }

        if let Some(p) = self.queue_tx.pop_front() {
            return Output::Packet(self.copy_out(p, buf));
        }

        match self.retransmit.next_timeout() {
            Some(t) => Output::Timeout(t),
            None => Output::Idle,
        }
    }

    fn copy_out<'a>(&mut self, data: Buf, buf: &'a mut [u8]) -> &'a [u8] {
        let len = data.len();
        if len > buf.len() {
            debug!(
                "poll_output buffer of {} bytes, {} needed (mtu {})",
                buf.len(),
                len,
                self.config.mtu()
            );
        }
        assert!(
            len <= buf.len(),
            "Output buffer too small {} > {}",
            len,
            buf.len()
        );
        buf[..len].copy_from_slice(&data);
        self.buffers_free.push(data);
        &buf[..len]
    }

    fn check_failed(&self) -> Result<(), Error> {
        match &self.state {
            State::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    fn latch(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        if let Err(e) = &result {
            warn!("{:?} connection failed: {}", self.role, e);
            self.state = State::Failed(e.clone());
            self.events.clear();
            self.batch.clear();
            for p in self.queue_tx.drain(..) {
                self.buffers_free.push(p);
            }
        }
        result
    }

    fn protocol(&self) -> Protocol {
        self.config.protocol()
    }

    fn is_handshaking(&self) -> bool {
        self.cursor < self.plan.len()
    }

    fn set_handshaking_state(&mut self) {
        if self.is_handshaking() {
            self.state = State::Handshaking {
                flight: self.cursor,
            };
        }
    }

    /// The peer flight we are receiving, if the cursor is on one.
    fn peer_flight(&self) -> Option<&FlightSpec> {
        self.plan
            .get(self.cursor)
            .filter(|f| f.sender == self.role.peer())
    }

    fn enter_peer_flight(&mut self) {
        let (len, horizon) = match self.peer_flight() {
            Some(f) => (
                f.items.len(),
                f.items
                    .iter()
                    .filter_map(|i| match i {
                        FlightItem::Handshake(_, e) => Some(*e),
                        FlightItem::ChangeCipherSpec => None,
                    })
                    .max()
                    .unwrap_or(0),
            ),
            None => (0, 0),
        };
        self.received = vec![false; len];
        self.pending_ccs = false;
        self.epochs.set_read_horizon(horizon);
    }

    // ---------------------------------------------------------------
    // Timers

    fn process_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.epochs.expire(now);

        if self.state == State::PreHandshake && self.role == Role::Client {
            debug!("Client starts handshake");
            return self.send_plan_flights(now);
        }

        if let Some(expires) = self.final_flight_expires {
            if now >= expires {
                debug!("Forget final flight");
                self.retransmit.begin_flight();
                self.tx_flight = None;
                self.final_flight_expires = None;
            }
        }

        if self.retransmit.ack_due(now) {
            self.flush_ack(now)?;
        }

        if self.retransmit.poll_timeout(now)? {
            self.resend_unacked("flight timeout")?;
        }

        Ok(())
    }

    // ---------------------------------------------------------------
    // Receiving

    fn process_packet(&mut self, packet: &[u8], now: Instant) -> Result<(), Error> {
        self.epochs.expire(now);

        if self.state == State::PreHandshake && self.role == Role::Server {
            self.state = State::Handshaking { flight: 0 };
        }

        let records = split_datagram(packet, self.config.codec_mode())?;
        for record in records.iter() {
            self.process_record(record, now)?;
            self.pump(now)?;
        }

        Ok(())
    }

    /// Deliver complete messages, advance read epochs and replay deferred
    /// records until nothing changes.
    fn pump(&mut self, now: Instant) -> Result<(), Error> {
        loop {
            let mut progressed = false;

            while let Some(message) = self.reassembler.next_message() {
                self.on_message(message, now)?;
                progressed = true;
            }

            self.advance_read_lazily(now)?;

            let ready = self.deferred.take_ready(&self.epochs, now);
            for stored in ready {
                trace!("Replay deferred record");
                let records = split_datagram(&stored, self.config.codec_mode())?;
                for record in records.iter() {
                    self.process_record(record, now)?;
                }
                self.buffers_free.push(stored);
                progressed = true;
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn defer(&mut self, epoch: u16, record: &RawRecord<'_>) -> Result<(), Error> {
        let mut stored = self.buffers_free.pop();
        stored.extend_from_slice(record.header_bytes);
        stored.extend_from_slice(record.body);
        self.deferred.push(epoch, stored, self.config.max_queue_rx())
    }

    /// Early data the server did not accept is skipped.
    fn skips_epoch(&self, epoch: u16) -> bool {
        self.role == Role::Server
            && epoch == 1
            && self.config.handshake() == (HandshakeKind::EarlyData { accepted: false })
    }

    fn process_record(&mut self, record: &RawRecord<'_>, now: Instant) -> Result<(), Error> {
        let (content_type, epoch, sequence, body) = match record.header {
            RawHeader::Legacy(h) => {
                if self.skips_epoch(h.epoch) {
                    trace!("Skip early data record {}:{}", h.epoch, h.sequence);
                    return Ok(());
                }

                match self.epochs.check_read(h.epoch, now) {
                    EpochCheck::Accept => {}
                    EpochCheck::Stale => {
                        trace!("Drop record at stale epoch {}", h.epoch);
                        return Ok(());
                    }
                    EpochCheck::Defer => return self.defer(h.epoch, record),
                    EpochCheck::TooFar => {
                        return Err(Error::UnexpectedRecord(h.content_type, h.epoch));
                    }
                }

                if !self.epochs.is_fresh(h.epoch, h.sequence) {
                    trace!("Drop replayed record {}:{}", h.epoch, h.sequence);
                    return Ok(());
                }

                let mut body = self.buffers_free.pop();
                body.extend_from_slice(record.body);
                if self
                    .epochs
                    .open(h.epoch, h.sequence, record.header_bytes, &mut body)
                    .is_err()
                {
                    trace!("Drop record {}:{} failing authentication", h.epoch, h.sequence);
                    self.buffers_free.push(body);
                    return Ok(());
                }

                (h.content_type, h.epoch, h.sequence, body)
            }
            RawHeader::Unified(h) => {
                let Some((epoch, sequence, mut body)) = self.open_unified(record, &h, now) else {
                    if let Some(epoch) = self.epochs.future_candidate(h.epoch_bits) {
                        if !self.skips_epoch(epoch) {
                            return self.defer(epoch, record);
                        }
                    }
                    trace!("Drop compact record matching no epoch");
                    return Ok(());
                };

                let Some(inner) = body.last().copied() else {
                    self.buffers_free.push(body);
                    return Err(Error::MalformedRecord("missing inner content type"));
                };
                body.truncate(body.len() - 1);

                let content_type = ContentType::from_u8(inner);
                if let ContentType::Unknown(_) = content_type {
                    self.buffers_free.push(body);
                    return Err(Error::MalformedRecord("unknown content type"));
                }

                (content_type, epoch, sequence, body)
            }
        };

        self.epochs.mark_received(epoch, sequence);
        let number = RecordNumber::new(epoch, sequence);

        let result = match content_type {
            ContentType::Handshake => self.on_handshake_record(number, &body, now),
            ContentType::ChangeCipherSpec => self.on_change_cipher_spec(epoch, &body, now),
            ContentType::Alert => self.on_alert(&body),
            ContentType::ApplicationData => self.on_application_data(epoch, &body),
            ContentType::Ack => self.on_ack_record(epoch, &body, now),
            ContentType::Unknown(_) => Err(Error::MalformedRecord("unknown content type")),
        };

        self.buffers_free.push(body);
        result
    }

    /// Trial-decrypt a compact record against every readable epoch whose
    /// low bits match.
    fn open_unified(
        &mut self,
        record: &RawRecord<'_>,
        header: &UnifiedHeader,
        now: Instant,
    ) -> Option<(u16, u64, Buf)> {
        let candidates: Vec<u16> = self.epochs.read_candidates(header.epoch_bits, now).collect();

        for epoch in candidates {
            if self.skips_epoch(epoch) {
                continue;
            }
            let sequence = self.epochs.reconstruct_sequence(
                epoch,
                header.seq_bits as u64,
                header.sequence_width(),
            );
            if !self.epochs.is_fresh(epoch, sequence) {
                trace!("Drop replayed record {}:{}", epoch, sequence);
                continue;
            }

            let mut body = self.buffers_free.pop();
            body.extend_from_slice(record.body);
            if self
                .epochs
                .open(epoch, sequence, record.header_bytes, &mut body)
                .is_ok()
            {
                return Some((epoch, sequence, body));
            }
            self.buffers_free.push(body);
        }

        None
    }

    fn note_empty(&mut self) -> Result<(), Error> {
        self.empty_records += 1;
        if self.empty_records > self.config.max_empty_records() {
            warn!("Too many empty records: {}", self.empty_records);
            return Err(Error::TooManyEmptyFragments(self.empty_records));
        }
        Ok(())
    }

    fn fragment_mode(&self, epoch: u16) -> CodecMode {
        if epoch == 0 {
            CodecMode::Legacy
        } else {
            self.config.codec_mode()
        }
    }

    fn on_handshake_record(
        &mut self,
        number: RecordNumber,
        body: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let fragments = decode_fragments(body, self.fragment_mode(number.epoch), number.epoch)?;

        let mut buffered = false;
        let mut duplicate = None;
        let mut processed = fragments.is_empty();
        for fragment in &fragments {
            match self.reassembler.insert(fragment)? {
                Outcome::Buffered => buffered = true,
                Outcome::Duplicate => duplicate = Some(fragment.message_seq),
                Outcome::Discarded => {}
                Outcome::TooFarAhead => continue,
            }
            processed = true;
        }

        // A record whose fragments were all beyond the window must be
        // resent, so it is not acknowledged.
        if !processed {
            trace!("Record {} not acknowledged", number);
        } else if self.retransmit.mode() == AckMode::Explicit {
            self.retransmit.pending_ack(number, now);
        }

        if buffered {
            self.empty_records = 0;
        } else if duplicate.is_none() {
            self.note_empty()?;
        }

        if let Some(message_seq) = duplicate {
            self.on_duplicate(message_seq, now)?;
        }

        Ok(())
    }

    /// The peer retransmitted something we already consumed. A message
    /// from a flight before the one we are receiving means the peer lost
    /// our last flight.
    fn on_duplicate(&mut self, message_seq: u16, now: Instant) -> Result<(), Error> {
        let earlier_flight = match self.peer_flight() {
            Some(f) => message_seq < f.first_seq,
            None => self.tx_flight.is_some(),
        };

        if earlier_flight && self.retransmit.is_outstanding() {
            self.resend_on_demand(now)
        } else {
            self.flush_ack(now)
        }
    }

    fn resend_on_demand(&mut self, now: Instant) -> Result<(), Error> {
        let gap = self.config.initial_rto() / 2;
        if let Some(last) = self.last_on_demand_resend {
            if now < last + gap {
                trace!("Skip resend, last one too recent");
                return Ok(());
            }
        }
        self.last_on_demand_resend = Some(now);
        self.resend_unacked("peer retransmission")
    }

    fn on_change_cipher_spec(&mut self, epoch: u16, body: &[u8], now: Instant) -> Result<(), Error> {
        parse_change_cipher_spec(body)?;

        if self.protocol() == Protocol::Dtls13 {
            trace!("Ignore compatibility ChangeCipherSpec");
            return self.note_empty();
        }

        let Some(ccs_index) = self
            .peer_flight()
            .and_then(|f| f.items.iter().position(|i| *i == FlightItem::ChangeCipherSpec))
        else {
            if self.is_handshaking() {
                return Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec, epoch));
            }
            // Retransmitted with the peer's final flight.
            trace!("ChangeCipherSpec after handshake");
            self.note_empty()?;
            if self.retransmit.is_outstanding() {
                self.resend_on_demand(now)?;
            }
            return Ok(());
        };

        if self.received[ccs_index] || epoch != self.epochs.current_read_epoch() {
            trace!("Duplicate ChangeCipherSpec");
            return self.note_empty();
        }

        self.pending_ccs = true;
        self.apply_pending_ccs(now)
    }

    /// Act on a received ChangeCipherSpec once every message before it in
    /// the flight has arrived.
    fn apply_pending_ccs(&mut self, now: Instant) -> Result<(), Error> {
        if !self.pending_ccs {
            return Ok(());
        }

        let Some(ccs_index) = self
            .peer_flight()
            .and_then(|f| f.items.iter().position(|i| *i == FlightItem::ChangeCipherSpec))
        else {
            return Ok(());
        };

        if !self.received[..ccs_index].iter().all(|r| *r) {
            trace!("Hold early ChangeCipherSpec");
            return Ok(());
        }

        let epoch = next_epoch(self.epochs.current_read_epoch())?;
        let cipher = self.keys.cipher(self.role.peer(), epoch)?;
        self.epochs.advance_read_epoch(epoch, Some(cipher), now)?;

        self.received[ccs_index] = true;
        self.pending_ccs = false;
        self.empty_records = 0;
        self.check_flight_complete(now)
    }

    fn on_alert(&mut self, body: &[u8]) -> Result<(), Error> {
        let (level, description) = parse_alert(body)?;
        if level == ALERT_LEVEL_FATAL {
            return Err(Error::AlertReceived(description));
        }
        debug!("Ignore warning alert {}", description);
        Ok(())
    }

    fn on_application_data(&mut self, epoch: u16, body: &[u8]) -> Result<(), Error> {
        let early = self.protocol() == Protocol::Dtls13 && epoch == 1;
        let handshake_epoch = self.protocol() == Protocol::Dtls13 && epoch == 2;

        if epoch == 0 || handshake_epoch {
            return Err(Error::UnexpectedRecord(ContentType::ApplicationData, epoch));
        }

        if early {
            let accepted = self.role == Role::Server
                && self.config.handshake() == (HandshakeKind::EarlyData { accepted: true });
            if !accepted {
                return Err(Error::UnexpectedRecord(ContentType::ApplicationData, epoch));
            }
            if body.is_empty() {
                return self.note_empty();
            }
            self.empty_records = 0;
            self.events
                .push_back(Event::EarlyData(Buf::from_slice(body)));
            return Ok(());
        }

        if body.is_empty() {
            return self.note_empty();
        }
        self.empty_records = 0;

        let data = Buf::from_slice(body);
        if self.is_connected() {
            self.events.push_back(Event::ApplicationData(data));
        } else {
            if self.held.len() >= self.config.max_queue_rx() {
                warn!("Receive queue full (max {})", self.config.max_queue_rx());
                return Err(Error::ReceiveQueueFull);
            }
            trace!("Hold application data until connected");
            self.held.push_back(data);
        }
        Ok(())
    }

    fn on_ack_record(&mut self, epoch: u16, body: &[u8], now: Instant) -> Result<(), Error> {
        if self.protocol() == Protocol::Dtls12 || epoch == 0 {
            return Err(Error::UnexpectedRecord(ContentType::Ack, epoch));
        }

        let ack = Ack::parse(body)?;
        if ack.is_empty() {
            return self.note_empty();
        }

        let write_epoch = self.epochs.current_write_epoch();
        match self.retransmit.on_ack(&ack, write_epoch, now)? {
            AckResult::Ignored => {}
            AckResult::Partial => self.empty_records = 0,
            AckResult::Complete => {
                self.empty_records = 0;
                self.on_flight_acked(now)?;
            }
        }
        Ok(())
    }

    /// Our outstanding flight is fully acknowledged.
    fn on_flight_acked(&mut self, now: Instant) -> Result<(), Error> {
        if self.pending_key_update {
            self.pending_key_update = false;
            let epoch = next_epoch(self.epochs.current_write_epoch())?;
            let cipher = self.keys.cipher(self.role, epoch)?;
            self.epochs.advance_write_epoch(epoch, Some(cipher), now)?;
        }

        self.tx_flight = None;
        self.post_in_flight = 0;

        if let Some(next) = self.queued_post.pop_front() {
            return self.send_post_handshake(next, now);
        }

        self.update_post_state();
        Ok(())
    }

    fn update_post_state(&mut self) {
        if !self.is_connected() {
            return;
        }
        let pending = self.post_in_flight + self.queued_post.len();
        self.state = if pending == 0 {
            State::HandshakeComplete
        } else {
            State::PostHandshake { pending }
        };
    }

    fn on_message(&mut self, message: Message, now: Instant) -> Result<(), Error> {
        trace!(
            "Received {:?} seq {} epoch {}",
            message.msg_type,
            message.message_seq,
            message.epoch
        );

        if !self.is_handshaking() {
            let result = self.on_post_handshake_message(&message, now);
            self.buffers_free.push(message.body);
            return result;
        }

        let Some(flight) = self.peer_flight() else {
            return Err(Error::UnexpectedMessage {
                got: message.msg_type,
                expected: None,
            });
        };

        let Some(index) = flight.item_for_seq(message.message_seq) else {
            warn!(
                "Message seq {} beyond flight {}",
                message.message_seq, self.cursor
            );
            return Err(Error::ExcessHandshakeData);
        };

        let FlightItem::Handshake(expected, epoch) = flight.items[index] else {
            return Err(Error::InvalidState("sequence maps to ChangeCipherSpec"));
        };

        if message.msg_type != expected {
            return Err(Error::UnexpectedMessage {
                got: message.msg_type,
                expected: Some(expected),
            });
        }

        if message.epoch != epoch {
            return Err(Error::UnexpectedRecord(ContentType::Handshake, message.epoch));
        }

        self.received[index] = true;
        self.buffers_free.push(message.body);
        self.events.push_back(Event::HandshakeMessage(expected));

        self.apply_pending_ccs(now)?;
        self.check_flight_complete(now)
    }

    fn on_post_handshake_message(&mut self, message: &Message, now: Instant) -> Result<(), Error> {
        if self.protocol() == Protocol::Dtls12 || !message.msg_type.is_post_handshake() {
            warn!("Handshake message {:?} after handshake", message.msg_type);
            return Err(Error::ExcessHandshakeData);
        }

        match message.msg_type {
            MessageType::KeyUpdate => {
                self.key_updates_received += 1;
                if self.key_updates_received > self.config.max_key_updates() {
                    return Err(Error::TooManyKeyUpdates(self.key_updates_received));
                }

                let epoch = next_epoch(self.epochs.current_read_epoch())?;
                let cipher = self.keys.cipher(self.role.peer(), epoch)?;
                self.epochs.advance_read_epoch(epoch, Some(cipher), now)?;
            }
            MessageType::NewSessionTicket if self.role == Role::Client => {}
            got => {
                return Err(Error::UnexpectedMessage {
                    got,
                    expected: None,
                })
            }
        }

        self.events
            .push_back(Event::HandshakeMessage(message.msg_type));
        self.flush_ack(now)
    }

    /// Advance the read epoch when the next expected message of the peer's
    /// flight needs it (DTLS 1.3).
    fn advance_read_lazily(&mut self, now: Instant) -> Result<(), Error> {
        if self.protocol() != Protocol::Dtls13 {
            return Ok(());
        }

        let Some(flight) = self.peer_flight() else {
            return Ok(());
        };

        let next = flight
            .items
            .iter()
            .zip(&self.received)
            .find(|(_, received)| !**received)
            .and_then(|(item, _)| match item {
                FlightItem::Handshake(_, e) => Some(*e),
                FlightItem::ChangeCipherSpec => None,
            });

        let Some(epoch) = next else {
            return Ok(());
        };

        if epoch > self.epochs.current_read_epoch() {
            let cipher = self.keys.cipher(self.role.peer(), epoch)?;
            self.epochs.advance_read_epoch(epoch, Some(cipher), now)?;
        }
        Ok(())
    }

    fn check_flight_complete(&mut self, now: Instant) -> Result<(), Error> {
        if self.received.is_empty() || !self.received.iter().all(|r| *r) {
            return Ok(());
        }
        self.on_peer_flight_complete(now)
    }

    fn on_peer_flight_complete(&mut self, now: Instant) -> Result<(), Error> {
        let index = self.cursor;
        let end = self
            .peer_flight()
            .map(|f| f.end_seq())
            .ok_or(Error::InvalidState("no peer flight"))?;

        let excess = self
            .reassembler
            .buffered_messages()
            .any(|(seq, t)| seq >= end && !t.is_post_handshake());
        if excess {
            warn!("Handshake data buffered beyond flight {}", index);
            return Err(Error::ExcessHandshakeData);
        }

        debug!("{:?} received flight {}", self.role, index);
        if let Some(info) = flight_info(&self.plan, index) {
            self.hooks.after_receive_flight(&info);
        }

        // The peer's flight acknowledges ours.
        if self.tx_flight.is_some() && self.final_flight_expires.is_none() {
            self.retransmit.retire();
            self.tx_flight = None;
        }

        let early_data_accepted = self.protocol() == Protocol::Dtls13
            && self.role == Role::Server
            && index == 0
            && self.config.handshake() == (HandshakeKind::EarlyData { accepted: true });
        if early_data_accepted {
            let cipher = self.keys.cipher(self.role.peer(), 1)?;
            self.epochs.advance_read_epoch(1, Some(cipher), now)?;
        }

        self.cursor += 1;
        self.received.clear();
        self.pending_ccs = false;

        if self.is_handshaking() {
            self.send_plan_flights(now)
        } else {
            // The peer spoke last. Acknowledge right away.
            self.flush_ack(now)?;
            self.complete_handshake(now)
        }
    }

    fn complete_handshake(&mut self, now: Instant) -> Result<(), Error> {
        debug!("{:?} handshake complete", self.role);
        self.state = State::HandshakeComplete;
        self.events.push_back(Event::Connected);
        self.epochs.set_read_horizon(0);

        let app = self.protocol().application_epoch();
        if self.epochs.current_write_epoch() < app {
            let cipher = self.keys.cipher(self.role, app)?;
            self.epochs.advance_write_epoch(app, Some(cipher), now)?;
        }
        if self.epochs.current_read_epoch() < app {
            let cipher = self.keys.cipher(self.role.peer(), app)?;
            self.epochs.advance_read_epoch(app, Some(cipher), now)?;
        }

        self.next_send_seq = self.plan.post_handshake_seq(self.role);

        while let Some(data) = self.held.pop_front() {
            self.events.push_back(Event::ApplicationData(data));
        }

        let tickets = self.protocol() == Protocol::Dtls13
            && self.role == Role::Server
            && self.config.session_tickets();
        if tickets {
            self.send_post_handshake(MessageType::NewSessionTicket, now)?;
        }

        Ok(())
    }

    // ---------------------------------------------------------------
    // Sending

    /// Send our flights starting at the cursor until it reaches a peer
    /// flight or the end of the plan.
    fn send_plan_flights(&mut self, now: Instant) -> Result<(), Error> {
        while let Some(flight) = self.plan.get(self.cursor) {
            if flight.sender != self.role {
                break;
            }
            self.state = State::Handshaking {
                flight: self.cursor,
            };
            self.send_flight(self.cursor, now)?;
            self.cursor += 1;
        }

        if self.is_handshaking() {
            self.set_handshaking_state();
            self.enter_peer_flight();
            Ok(())
        } else {
            self.complete_handshake(now)
        }
    }

    fn ensure_write_epoch(&mut self, epoch: u16, now: Instant) -> Result<(), Error> {
        if epoch > self.epochs.current_write_epoch() {
            let cipher = self.keys.cipher(self.role, epoch)?;
            self.epochs.advance_write_epoch(epoch, Some(cipher), now)?;
        }
        Ok(())
    }

    fn is_compact(&self, epoch: u16) -> bool {
        epoch > 0 && self.config.codec_mode() == CodecMode::Compact
    }

    fn record_header_len(&self, epoch: u16) -> usize {
        if self.is_compact(epoch) {
            let length = (!self.config.omit_record_length()).then_some(0);
            let header = UnifiedHeader::new(epoch, 0, self.config.short_record_sequence(), length);
            // Inner content type.
            header.encoded_len() + 1
        } else {
            LEGACY_RECORD_HEADER_LEN
        }
    }

    /// Largest record payload at `epoch` that keeps the record within the MTU.
    fn payload_budget(&self, epoch: u16) -> usize {
        let overhead = self.record_header_len(epoch) + self.epochs.write_overhead(epoch);
        self.config.mtu().saturating_sub(overhead).max(1)
    }

    fn fragment_budget(&self, epoch: u16) -> usize {
        self.payload_budget(epoch)
            .saturating_sub(LEGACY_FRAGMENT_HEADER_LEN)
            .min(self.config.max_fragment_len())
            .max(1)
    }

    fn send_flight(&mut self, index: usize, now: Instant) -> Result<(), Error> {
        let Some(flight) = self.plan.get(index).cloned() else {
            return Err(Error::InvalidState("no such flight"));
        };
        let is_final = index + 1 == self.plan.len();

        debug!("{:?} sends flight {}", self.role, index);
        if let Some(info) = flight_info(&self.plan, index) {
            self.hooks.before_send_flight(&info);
        }

        self.retransmit.begin_flight();
        self.retransmit.clear_pending_acks();
        self.tx_flight = Some(index);
        self.attempt = 0;

        for item in &flight.items {
            match *item {
                FlightItem::Handshake(msg_type, epoch) => {
                    self.ensure_write_epoch(epoch, now)?;
                    let seq = self.take_send_seq()?;

                    if self.hooks.inject_discard(index, msg_type) {
                        self.write_discard(msg_type, seq, epoch)?;
                    }
                    self.add_message_slots(msg_type, seq, epoch);
                }
                FlightItem::ChangeCipherSpec => {
                    let epoch = self.epochs.current_write_epoch();
                    self.retransmit.add_slot(
                        ContentType::ChangeCipherSpec,
                        epoch,
                        None,
                        Buf::from_slice(&[1]),
                    );
                }
            }
        }

        let slots = self.retransmit.unacked();
        self.transmit_slots(&slots)?;
        self.flush_batch(DatagramTag {
            flight: Some(index),
            attempt: 0,
        })?;

        let untimed_final = is_final && self.retransmit.mode() == AckMode::Implicit;
        self.retransmit
            .flight_sent(now, !flight.stateless && !untimed_final);

        if untimed_final {
            self.final_flight_expires = Some(now + self.config.prior_epoch_expiration());
        }

        let offers_early_data = index == 0
            && self.role == Role::Client
            && matches!(self.config.handshake(), HandshakeKind::EarlyData { .. });
        if offers_early_data {
            self.ensure_write_epoch(1, now)?;
        }

        Ok(())
    }

    /// Build a message through the hooks and add its fragments as slots.
    fn add_message_slots(&mut self, msg_type: MessageType, seq: u16, epoch: u16) {
        let mut body = self.buffers_free.pop();
        self.hooks.message_body(msg_type, seq, &mut body);
        let message = Message {
            msg_type,
            message_seq: seq,
            epoch,
            body,
        };

        let budget = self.fragment_budget(epoch);
        for fragment in encode_fragments(&message, budget, self.fragment_mode(epoch)) {
            self.retransmit
                .add_slot(ContentType::Handshake, epoch, Some(msg_type), fragment);
        }
        self.buffers_free.push(message.body);
    }

    /// An untracked zero-length fragment covering nothing.
    fn write_discard(&mut self, msg_type: MessageType, seq: u16, epoch: u16) -> Result<(), Error> {
        trace!("Inject discard fragment before {:?}", msg_type);
        let header = FragmentHeader {
            msg_type,
            total_len: 1,
            message_seq: seq,
            offset: 1,
            length: 0,
        };
        let mut payload = self.buffers_free.pop();
        encode_fragment(&header, &[], self.fragment_mode(epoch), &mut payload);
        self.write_record(ContentType::Handshake, epoch, &payload)?;
        self.buffers_free.push(payload);
        Ok(())
    }

    /// Seal and batch the given slots under fresh record numbers.
    fn transmit_slots(&mut self, slots: &[usize]) -> Result<(), Error> {
        for &index in slots {
            let Some((content_type, epoch, msg_type, payload)) = self
                .retransmit
                .slot(index)
                .map(|s| (s.content_type, s.epoch, s.msg_type, s.payload.clone()))
            else {
                continue;
            };

            if !self.epochs.can_write(epoch) {
                debug!("Epoch {} expired, drop slot {} ({:?})", epoch, index, msg_type);
                self.retransmit.drop_slot(index);
                continue;
            }

            let number = self.write_record(content_type, epoch, &payload)?;
            self.retransmit.record_sent(index, number);
        }
        Ok(())
    }

    fn resend_unacked(&mut self, reason: &str) -> Result<(), Error> {
        let slots = self.retransmit.unacked();
        if slots.is_empty() {
            return Ok(());
        }

        self.attempt += 1;
        debug!(
            "Resending {} records due to {} (attempt {})",
            slots.len(),
            reason,
            self.attempt
        );

        self.transmit_slots(&slots)?;
        self.flush_batch(DatagramTag {
            flight: self.tx_flight,
            attempt: self.attempt,
        })
    }

    /// Send every pending acknowledgement now.
    fn flush_ack(&mut self, _now: Instant) -> Result<(), Error> {
        if self.retransmit.mode() != AckMode::Explicit || !self.retransmit.has_pending_acks() {
            return Ok(());
        }

        let ack = self.retransmit.take_ack();
        let epoch = self.epochs.current_write_epoch();
        if epoch == 0 {
            trace!("No keys to send ACK with");
            return Ok(());
        }

        trace!("Send ACK for {} records", ack.record_numbers.len());
        let mut body = self.buffers_free.pop();
        ack.serialize(&mut body);
        self.write_record(ContentType::Ack, epoch, &body)?;
        self.buffers_free.push(body);

        self.flush_batch(DatagramTag {
            flight: None,
            attempt: 0,
        })
    }

    fn write_application_data(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        self.epochs.expire(now);
        let epoch = self.epochs.current_write_epoch();
        let budget = self.payload_budget(epoch);
        trace!("Send {} bytes application data at epoch {}", data.len(), epoch);

        if data.is_empty() {
            self.write_record(ContentType::ApplicationData, epoch, &[])?;
        }
        for chunk in data.chunks(budget) {
            self.write_record(ContentType::ApplicationData, epoch, chunk)?;
        }

        self.flush_batch(DatagramTag {
            flight: None,
            attempt: 0,
        })
    }

    fn send_post_handshake(&mut self, msg_type: MessageType, now: Instant) -> Result<(), Error> {
        self.check_post_handshake()?;

        let outstanding = self.retransmit.is_outstanding();
        let join = outstanding
            && self.tx_flight.is_none()
            && self.config.allow_pipelining()
            && !self.pending_key_update;

        if outstanding && !join {
            debug!("Queue {:?} behind outstanding flight", msg_type);
            self.queued_post.push_back(msg_type);
            self.update_post_state();
            return Ok(());
        }

        if !join {
            self.retransmit.begin_flight();
            self.tx_flight = None;
            self.attempt = 0;
            self.post_in_flight = 0;
        }

        let epoch = self.epochs.current_write_epoch();
        let seq = self.take_send_seq()?;
        debug!("{:?} sends {:?} seq {} at epoch {}", self.role, msg_type, seq, epoch);

        let first_new = self.retransmit.unacked().len();
        self.add_message_slots(msg_type, seq, epoch);
        let slots: Vec<usize> = self.retransmit.unacked().into_iter().skip(first_new).collect();

        self.transmit_slots(&slots)?;
        self.flush_batch(DatagramTag {
            flight: None,
            attempt: 0,
        })?;

        if !join {
            self.retransmit.flight_sent(now, true);
        }

        if msg_type == MessageType::KeyUpdate {
            self.pending_key_update = true;
        }

        self.post_in_flight += 1;
        self.update_post_state();
        Ok(())
    }

    /// Message sequence numbers never wrap.
    fn take_send_seq(&mut self) -> Result<u16, Error> {
        let seq = self.next_send_seq;
        self.next_send_seq = seq.checked_add(1).ok_or(Error::MessageSeqExhausted)?;
        Ok(seq)
    }

    /// Seal one record and append it to the batch. Returns its record number.
    fn write_record(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        payload: &[u8],
    ) -> Result<RecordNumber, Error> {
        let sequence = self.epochs.next_write_sequence(epoch)?;
        let compact = self.is_compact(epoch);

        let mut body = self.buffers_free.pop();
        body.extend_from_slice(payload);
        if compact {
            body.push(content_type.as_u8());
        }
        let length = u16::try_from(body.len() + self.epochs.write_overhead(epoch))
            .map_err(|_| Error::InvalidState("record longer than 65535 bytes"))?;

        let mut header = self.buffers_free.pop();
        let closes = compact && self.config.omit_record_length();
        if compact {
            let length = (!closes).then_some(length);
            let unified = UnifiedHeader::new(
                epoch,
                sequence,
                self.config.short_record_sequence(),
                length,
            );
            write_unified_header(&unified, &mut header);
        } else {
            let legacy = RecordHeader {
                content_type,
                version: DTLS1_2,
                epoch,
                sequence,
                length,
            };
            write_legacy_header(&legacy, &mut header);
        }

        self.epochs.seal(epoch, sequence, &header, &mut body)?;
        trace!(
            "Record {:?} {}:{} ({} bytes)",
            content_type,
            epoch,
            sequence,
            header.len() + body.len()
        );

        self.push_record(&header, &body, closes);
        self.buffers_free.push(header);
        self.buffers_free.push(body);

        Ok(RecordNumber::new(epoch, sequence))
    }

    fn push_record(&mut self, header: &[u8], body: &[u8], closes: bool) {
        let len = header.len() + body.len();
        let mtu = self.config.mtu();

        let fits = !self.batch_closed
            && self.batch_records < MAX_RECORDS_PER_DATAGRAM
            && self
                .batch
                .last()
                .map(|d| d.len() + len <= mtu)
                .unwrap_or(false);

        if fits {
            if let Some(last) = self.batch.last_mut() {
                last.extend_from_slice(header);
                last.extend_from_slice(body);
                self.batch_records += 1;
            }
        } else {
            let mut datagram = self.buffers_free.pop();
            datagram.extend_from_slice(header);
            datagram.extend_from_slice(body);
            self.batch.push(datagram);
            self.batch_records = 1;
        }

        self.batch_closed = closes;
    }

    /// Hand the batch to the hooks and queue the result.
    fn flush_batch(&mut self, tag: DatagramTag) -> Result<(), Error> {
        let batch = mem::take(&mut self.batch);
        self.batch_records = 0;
        self.batch_closed = false;

        if batch.is_empty() {
            return Ok(());
        }

        for datagram in self.hooks.transform_datagrams(tag, batch, &mut self.rng) {
            if self.queue_tx.len() >= self.config.max_queue_tx() {
                warn!("Transmit queue full (max {})", self.config.max_queue_tx());
                return Err(Error::TransmitQueueFull);
            }
            self.queue_tx.push_back(datagram);
        }
        Ok(())
    }
}

fn flight_info(plan: &FlightPlan, index: usize) -> Option<FlightInfo<'_>> {
    plan.get(index).map(|f| FlightInfo {
        index: Some(index),
        sender: f.sender,
        items: &f.items,
        is_final: index + 1 == plan.len(),
    })
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("epochs", &self.epochs)
            .field("queue_tx", &self.queue_tx.len())
            .finish()
    }
}
