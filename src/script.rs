//! Deterministic two-party driver.
//!
//! A [`Pair`] owns a client and a server [`Connection`], a manual clock and
//! one datagram queue per direction. Scenarios are written as a list of
//! [`Step`]s and executed with [`Pair::run`]. Nothing moves between the two
//! sides unless a step says so, which makes loss, reordering and timeouts
//! exact.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::crypto::{KeySource, StaticKeys};
use crate::hooks::{DefaultHooks, FlightHooks};
use crate::types::{MessageType, Role};
use crate::{Config, Connection, Error, Output, State};

/// Largest datagram the pair will poll.
const POLL_BUFFER_LEN: usize = 65536;

/// Rounds [`Pair::handshake`] runs before giving up.
const MAX_ROUNDS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Call `handle_timeout` on both sides without moving the clock. The
    /// first call starts the client.
    Start,
    /// Deliver queued datagrams from `from` to its peer, oldest first.
    /// `None` delivers all.
    Deliver { from: Role, count: Option<usize> },
    /// Deliver every queued datagram from `from`, newest first.
    DeliverReversed { from: Role },
    /// Lose queued datagrams from `from`. `None` drops all.
    Drop { from: Role, count: Option<usize> },
    /// Move the clock and call `handle_timeout` on both sides.
    Advance(Duration),
    /// Exactly `count` datagrams from `from` are waiting.
    ExpectPackets { from: Role, count: usize },
    ExpectConnected(Role),
    /// No timer armed and nothing to send.
    ExpectIdle(Role),
    /// `role` failed with the error code `code`.
    ExpectError { role: Role, code: &'static str },
    ExpectApplicationData { role: Role, data: Vec<u8> },
    ExpectEpochs { role: Role, read: u16, write: u16 },
    SendApplicationData { from: Role, data: Vec<u8> },
    UpdateKeys(Role),
    SendNewSessionTicket,
}

/// What a side surfaced through `poll_output`, apart from packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Connected,
    HandshakeMessage(MessageType),
    ApplicationData(Vec<u8>),
    EarlyData(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("step {step}: expected {expected} packets from {from:?}, found {found}")]
    PacketCount {
        step: usize,
        from: Role,
        expected: usize,
        found: usize,
    },
    #[error("step {step}: {role:?} is not connected ({state:?})")]
    NotConnected {
        step: usize,
        role: Role,
        state: State,
    },
    #[error("step {step}: {role:?} is not idle")]
    NotIdle { step: usize, role: Role },
    #[error("step {step}: expected {expected} from {role:?}, got {got:?}")]
    WrongError {
        step: usize,
        role: Role,
        expected: &'static str,
        got: Option<&'static str>,
    },
    #[error("step {step}: {role:?} did not receive the expected data")]
    MissingData { step: usize, role: Role },
    #[error("step {step}: {role:?} epochs are read {read} write {write}")]
    WrongEpochs {
        step: usize,
        role: Role,
        read: u16,
        write: u16,
    },
    #[error("step {step}: {role:?} failed: {error}")]
    Failed {
        step: usize,
        role: Role,
        error: Error,
    },
    #[error("handshake did not complete in {0} rounds")]
    Stalled(usize),
}

#[derive(Default)]
struct Side {
    queue: VecDeque<Vec<u8>>,
    received: Vec<Received>,
    /// First error not yet claimed by an `ExpectError` step.
    error: Option<Error>,
}

pub struct Pair {
    client: Connection,
    server: Connection,
    now: Instant,
    sides: [Side; 2],
    buf: Vec<u8>,
}

fn index(role: Role) -> usize {
    match role {
        Role::Client => 0,
        Role::Server => 1,
    }
}

impl Pair {
    /// Two connections sharing `config` and keys derived from `key_seed`.
    pub fn new(config: Config, key_seed: u64) -> Pair {
        Self::with_hooks(
            config,
            key_seed,
            Box::new(DefaultHooks),
            Box::new(DefaultHooks),
        )
    }

    pub fn with_hooks(
        config: Config,
        key_seed: u64,
        client_hooks: Box<dyn FlightHooks>,
        server_hooks: Box<dyn FlightHooks>,
    ) -> Pair {
        let config = Arc::new(config);
        let keys = |seed| -> Box<dyn KeySource> { Box::new(StaticKeys::new(seed)) };
        Pair {
            client: Connection::with_hooks(
                config.clone(),
                Role::Client,
                keys(key_seed),
                client_hooks,
            ),
            server: Connection::with_hooks(config, Role::Server, keys(key_seed), server_hooks),
            now: Instant::now(),
            sides: Default::default(),
            buf: vec![0; POLL_BUFFER_LEN],
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn connection(&self, role: Role) -> &Connection {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    fn connection_mut(&mut self, role: Role) -> &mut Connection {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    /// Everything `role` surfaced so far, packets excluded.
    pub fn received(&self, role: Role) -> &[Received] {
        &self.sides[index(role)].received
    }

    /// Datagrams `role` produced that are not yet delivered or dropped.
    pub fn queued(&mut self, role: Role) -> usize {
        self.collect(role);
        self.sides[index(role)].queue.len()
    }

    /// Take the queued datagrams of `role` for manual inspection.
    pub fn take_packets(&mut self, role: Role) -> Vec<Vec<u8>> {
        self.collect(role);
        self.sides[index(role)].queue.drain(..).collect()
    }

    /// Feed a datagram to `to` as if the peer had sent it.
    pub fn inject(&mut self, to: Role, datagram: &[u8]) {
        let now = self.now;
        let result = self.connection_mut(to).handle_packet(datagram, now);
        self.record(to, result);
    }

    /// Poll `role` until it has nothing more to say.
    fn collect(&mut self, role: Role) {
        let Pair {
            client,
            server,
            sides,
            buf,
            ..
        } = self;
        let conn = match role {
            Role::Client => client,
            Role::Server => server,
        };
        let side = &mut sides[index(role)];

        loop {
            match conn.poll_output(buf) {
                Output::Packet(p) => side.queue.push_back(p.to_vec()),
                Output::Connected => side.received.push(Received::Connected),
                Output::HandshakeMessage(t) => side.received.push(Received::HandshakeMessage(t)),
                Output::ApplicationData(d) => {
                    side.received.push(Received::ApplicationData(d.to_vec()))
                }
                Output::EarlyData(d) => side.received.push(Received::EarlyData(d.to_vec())),
                Output::Timeout(_) | Output::Idle => break,
            }
        }
    }

    fn record(&mut self, role: Role, result: Result<(), Error>) {
        if let Err(e) = result {
            debug!("{:?} error: {}", role, e);
            let side = &mut self.sides[index(role)];
            if side.error.is_none() {
                side.error = Some(e);
            }
        }
    }

    fn tick(&mut self) {
        let now = self.now;
        let result = self.client.handle_timeout(now);
        self.record(Role::Client, result);
        let result = self.server.handle_timeout(now);
        self.record(Role::Server, result);
    }

    fn deliver(&mut self, from: Role, datagrams: Vec<Vec<u8>>) {
        let to = from.peer();
        for d in datagrams {
            self.inject(to, &d);
        }
        self.collect(to);
    }

    fn take(&mut self, from: Role, count: Option<usize>) -> Vec<Vec<u8>> {
        self.collect(from);
        let queue = &mut self.sides[index(from)].queue;
        let n = count.unwrap_or(queue.len()).min(queue.len());
        queue.drain(..n).collect()
    }

    /// Exchange everything in both directions until both sides are
    /// connected. When nothing is in flight the clock jumps to the earliest
    /// armed timer.
    pub fn handshake(&mut self) -> Result<(), ScriptError> {
        self.tick();
        for _ in 0..MAX_ROUNDS {
            let sent = self.exchange();
            self.check_errors()?;

            if self.client.is_connected() && self.server.is_connected() {
                // Settle trailing ACKs and tickets.
                for _ in 0..MAX_ROUNDS {
                    if self.exchange() == 0 {
                        break;
                    }
                }
                return self.check_errors();
            }

            if sent == 0 {
                let next = [&self.client, &self.server]
                    .iter()
                    .filter_map(|c| c.next_timeout())
                    .min();
                let Some(next) = next else {
                    break;
                };
                self.now = self.now.max(next);
                self.tick();
            }
        }
        Err(ScriptError::Stalled(MAX_ROUNDS))
    }

    /// Deliver everything queued, client first. Returns the number of
    /// datagrams moved.
    fn exchange(&mut self) -> usize {
        let mut sent = 0;
        for from in [Role::Client, Role::Server] {
            let datagrams = self.take(from, None);
            sent += datagrams.len();
            self.deliver(from, datagrams);
        }
        sent
    }

    fn check_errors(&mut self) -> Result<(), ScriptError> {
        for role in [Role::Client, Role::Server] {
            if let Some(error) = self.sides[index(role)].error.take() {
                return Err(ScriptError::Failed {
                    step: 0,
                    role,
                    error,
                });
            }
        }
        Ok(())
    }

    pub fn run(&mut self, steps: impl IntoIterator<Item = Step>) -> Result<(), ScriptError> {
        let mut count = 0;
        for (step, s) in steps.into_iter().enumerate() {
            trace!("Step {}: {:?}", step, s);
            self.step(step, s)?;
            count = step + 1;
        }

        for role in [Role::Client, Role::Server] {
            if let Some(error) = self.sides[index(role)].error.take() {
                return Err(ScriptError::Failed {
                    step: count,
                    role,
                    error,
                });
            }
        }
        Ok(())
    }

    fn step(&mut self, step: usize, s: Step) -> Result<(), ScriptError> {
        match s {
            Step::Start => self.tick(),
            Step::Deliver { from, count } => {
                let datagrams = self.take(from, count);
                self.deliver(from, datagrams);
            }
            Step::DeliverReversed { from } => {
                let mut datagrams = self.take(from, None);
                datagrams.reverse();
                self.deliver(from, datagrams);
            }
            Step::Drop { from, count } => {
                let dropped = self.take(from, count);
                debug!("Drop {} datagrams from {:?}", dropped.len(), from);
            }
            Step::Advance(d) => {
                self.now += d;
                self.tick();
            }
            Step::ExpectPackets { from, count } => {
                let found = self.queued(from);
                if found != count {
                    return Err(ScriptError::PacketCount {
                        step,
                        from,
                        expected: count,
                        found,
                    });
                }
            }
            Step::ExpectConnected(role) => {
                self.collect(role);
                self.check_error(step, role)?;
                let conn = self.connection(role);
                if !conn.is_connected() {
                    return Err(ScriptError::NotConnected {
                        step,
                        role,
                        state: conn.state().clone(),
                    });
                }
            }
            Step::ExpectIdle(role) => {
                let queued = self.queued(role);
                if queued > 0 || self.connection(role).next_timeout().is_some() {
                    return Err(ScriptError::NotIdle { step, role });
                }
            }
            Step::ExpectError { role, code } => {
                let got = self.sides[index(role)].error.take();
                let got = got.as_ref().map(|e| e.code());
                if got != Some(code) {
                    return Err(ScriptError::WrongError {
                        step,
                        role,
                        expected: code,
                        got,
                    });
                }
            }
            Step::ExpectApplicationData { role, data } => {
                self.collect(role);
                let found = self.sides[index(role)]
                    .received
                    .iter()
                    .any(|r| *r == Received::ApplicationData(data.clone()));
                if !found {
                    return Err(ScriptError::MissingData { step, role });
                }
            }
            Step::ExpectEpochs { role, read, write } => {
                let conn = self.connection(role);
                if conn.read_epoch() != read || conn.write_epoch() != write {
                    return Err(ScriptError::WrongEpochs {
                        step,
                        role,
                        read: conn.read_epoch(),
                        write: conn.write_epoch(),
                    });
                }
            }
            Step::SendApplicationData { from, data } => {
                let now = self.now;
                let result = self.connection_mut(from).send_application_data(&data, now);
                self.call(step, from, result)?;
            }
            Step::UpdateKeys(role) => {
                let now = self.now;
                let result = self.connection_mut(role).update_keys(now);
                self.call(step, role, result)?;
            }
            Step::SendNewSessionTicket => {
                let now = self.now;
                let result = self.server.send_new_session_ticket(now);
                self.call(step, Role::Server, result)?;
            }
        }
        Ok(())
    }

    fn check_error(&mut self, step: usize, role: Role) -> Result<(), ScriptError> {
        match self.sides[index(role)].error.take() {
            Some(error) => Err(ScriptError::Failed { step, role, error }),
            None => Ok(()),
        }
    }

    /// API calls made by a step must succeed.
    fn call(&mut self, step: usize, role: Role, result: Result<(), Error>) -> Result<(), ScriptError> {
        result.map_err(|error| ScriptError::Failed { step, role, error })?;
        self.collect(role);
        Ok(())
    }
}

impl std::fmt::Debug for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("client", &self.client)
            .field("server", &self.server)
            .finish()
    }
}
