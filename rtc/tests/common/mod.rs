//! A loopback network of two endpoints with a plaintext stand-in for DTLS.
#![allow(dead_code)]

mod turn_server;

pub use turn_server::*;

use bytes::BytesMut;
use rtc::dtls_transport::{TlsEngine, TlsSession, certificate_fingerprint};
use rtc::endpoint::Endpoint;
use rtc::endpoint::endpoint_config::EndpointConfig;
use rtc::endpoint::endpoint_handler::{Commands, Flow, Handler};
use rtc::sansio::Protocol;
use rtc::shared::error::{Error, Result};
use rtc::shared::{SlotHandle, TransportContext, TransportMessage, TransportProtocol};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;

pub const TICK: Duration = Duration::from_millis(10);

pub fn addr_a() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 5000))
}

pub fn addr_b() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 5000))
}

/// Records keep their content type byte but carry no protection at all.
#[derive(Default)]
pub struct PlainTls {
    pub sessions_created: usize,
}

impl TlsEngine for PlainTls {
    type Session = PlainSession;

    fn new_session(&mut self, is_client: bool, remote_fingerprint: &[u8]) -> Result<PlainSession> {
        if remote_fingerprint.is_empty() {
            return Err(Error::ErrTlsEngine("missing remote fingerprint".to_owned()));
        }
        self.sessions_created += 1;
        Ok(PlainSession {
            is_client,
            complete: false,
            closed: false,
            out: VecDeque::new(),
        })
    }
}

pub struct PlainSession {
    is_client: bool,
    complete: bool,
    closed: bool,
    out: VecDeque<BytesMut>,
}

impl TlsSession for PlainSession {
    fn start_handshake(&mut self, _now: Instant) -> Result<()> {
        self.out
            .push_back(BytesMut::from(&[CONTENT_HANDSHAKE, CLIENT_HELLO][..]));
        Ok(())
    }

    fn handle_ciphertext(&mut self, _now: Instant, data: &[u8]) -> Result<Vec<BytesMut>> {
        match data.first().copied() {
            Some(CONTENT_HANDSHAKE) => {
                match (self.is_client, data.get(1).copied()) {
                    (true, Some(SERVER_HELLO)) => self.complete = true,
                    (false, Some(CLIENT_HELLO)) => {
                        self.complete = true;
                        self.out
                            .push_back(BytesMut::from(&[CONTENT_HANDSHAKE, SERVER_HELLO][..]));
                    }
                    _ => {}
                }
                Ok(vec![])
            }
            Some(CONTENT_APPLICATION_DATA) if self.complete => {
                Ok(vec![BytesMut::from(&data[1..])])
            }
            Some(CONTENT_APPLICATION_DATA) => Ok(vec![]),
            Some(CONTENT_ALERT) => {
                self.closed = true;
                Ok(vec![])
            }
            _ => Err(Error::ErrTlsEngine("unexpected record".to_owned())),
        }
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<()> {
        if !self.complete {
            return Err(Error::ErrDtlsNotConnected);
        }
        let mut record = BytesMut::with_capacity(data.len() + 1);
        record.extend_from_slice(&[CONTENT_APPLICATION_DATA]);
        record.extend_from_slice(data);
        self.out.push_back(record);
        Ok(())
    }

    fn poll_ciphertext(&mut self) -> Option<BytesMut> {
        self.out.pop_front()
    }

    fn is_handshake_complete(&self) -> bool {
        self.complete
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.closed {
            self.out.push_back(BytesMut::from(&[CONTENT_ALERT, 0][..]));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(SlotHandle),
    Disconnected(SlotHandle),
    Data {
        session: SlotHandle,
        stream_id: u16,
        is_string: bool,
        data: Vec<u8>,
    },
    SendOk(SlotHandle),
    Channel {
        session: SlotHandle,
        stream_id: u16,
        label: String,
        protocol: String,
    },
    Ack {
        session: SlotHandle,
        stream_id: u16,
    },
    Closed {
        session: SlotHandle,
        stream_id: u16,
    },
}

/// Remembers every callback and optionally reacts to data.
#[derive(Default)]
pub struct Recorder {
    pub seen: Vec<Seen>,
    pub echo: bool,
    pub suppress_acks: bool,
    pub pause_after: Option<usize>,
    pub disconnect_on_data: bool,
}

impl Recorder {
    pub fn connected(&self) -> Option<SlotHandle> {
        self.seen.iter().find_map(|s| match s {
            Seen::Connected(session) => Some(*session),
            _ => None,
        })
    }

    pub fn disconnected(&self) -> bool {
        self.seen
            .iter()
            .any(|s| matches!(s, Seen::Disconnected(_)))
    }

    pub fn received(&self) -> Vec<(u16, bool, Vec<u8>)> {
        self.seen
            .iter()
            .filter_map(|s| match s {
                Seen::Data {
                    stream_id,
                    is_string,
                    data,
                    ..
                } => Some((*stream_id, *is_string, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn has(&self, seen: &Seen) -> bool {
        self.seen.contains(seen)
    }
}

impl Handler for Recorder {
    fn on_connect(&mut self, _cmds: &mut Commands, session: SlotHandle, connected: bool) {
        self.seen.push(if connected {
            Seen::Connected(session)
        } else {
            Seen::Disconnected(session)
        });
    }

    fn on_data(
        &mut self,
        cmds: &mut Commands,
        session: SlotHandle,
        stream_id: u16,
        is_string: bool,
        data: &[u8],
    ) -> Flow {
        self.seen.push(Seen::Data {
            session,
            stream_id,
            is_string,
            data: data.to_vec(),
        });
        if self.echo {
            cmds.send(session, stream_id, is_string, data);
        }
        if self.disconnect_on_data {
            cmds.disconnect(session);
        }
        match self.pause_after {
            Some(n) if self.received().len() == n => Flow::Pause,
            _ => Flow::Continue,
        }
    }

    fn on_send_ok(&mut self, _cmds: &mut Commands, session: SlotHandle) {
        self.seen.push(Seen::SendOk(session));
    }

    fn on_data_channel(
        &mut self,
        _cmds: &mut Commands,
        session: SlotHandle,
        stream_id: u16,
        label: &str,
        protocol: &str,
    ) -> bool {
        self.seen.push(Seen::Channel {
            session,
            stream_id,
            label: label.to_owned(),
            protocol: protocol.to_owned(),
        });
        self.suppress_acks
    }

    fn on_data_channel_ack(&mut self, _cmds: &mut Commands, session: SlotHandle, stream_id: u16) {
        self.seen.push(Seen::Ack { session, stream_id });
    }

    fn on_data_channel_closed(
        &mut self,
        _cmds: &mut Commands,
        session: SlotHandle,
        stream_id: u16,
    ) {
        self.seen.push(Seen::Closed { session, stream_id });
    }
}

pub type TestEndpoint = Endpoint<PlainTls, Recorder>;

pub fn config(addr: SocketAddr, cert: &[u8]) -> EndpointConfig {
    EndpointConfig::default()
        .with_local_addr(addr)
        .with_local_candidates(vec![addr])
        .with_fingerprint(certificate_fingerprint(cert))
}

/// Endpoint `a` offers, `b` answers; datagrams move between them, and through the
/// TURN server when there is one, without loss unless a direction is cut.
pub struct Net {
    pub now: Instant,
    pub a: TestEndpoint,
    pub b: TestEndpoint,
    pub relay: Option<TurnServer>,
    pub cut_to_a: bool,
    pub cut_to_b: bool,
}

impl Net {
    pub fn new(config_a: EndpointConfig, config_b: EndpointConfig) -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let now = Instant::now();
        Ok(Self {
            now,
            a: Endpoint::new(config_a, PlainTls::default(), Recorder::default(), now)?,
            b: Endpoint::new(config_b, PlainTls::default(), Recorder::default(), now)?,
            relay: None,
            cut_to_a: false,
            cut_to_b: false,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(config(addr_a(), b"cert-a"), config(addr_b(), b"cert-b"))
    }

    /// Like [Net::new], with a TURN server reachable by both endpoints.
    pub fn with_relay(config_a: EndpointConfig, config_b: EndpointConfig) -> Result<Self> {
        let mut net = Self::new(config_a, config_b)?;
        net.relay = Some(TurnServer::default());
        Ok(net)
    }

    /// Runs the out-of-band offer exchange and returns the slots of `a` and `b`.
    pub fn negotiate(&mut self) -> Result<(SlotHandle, SlotHandle)> {
        let now = self.now;
        let (offered, offer) = self.a.generate_offer(now)?;
        let (slot_b, answer) = self.b.set_offer(now, &offer, None)?;
        let (user, key) = self
            .a
            .local_credentials(offered)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        let (slot_a, _) = self.a.set_offer(now, &answer, Some((&user, &key)))?;
        self.exchange()?;
        Ok((slot_a, slot_b))
    }

    /// Moves datagrams until both sides are quiet.
    pub fn exchange(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut moved = 0;
            while let Some(msg) = self.a.poll_write() {
                moved += self.route(msg)?;
            }
            while let Some(msg) = self.b.poll_write() {
                moved += self.route(msg)?;
            }
            while let Some(msg) = self.relay.as_mut().and_then(|relay| relay.poll_write()) {
                moved += self.route(msg)?;
            }
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    fn route(&mut self, msg: TransportMessage<BytesMut>) -> Result<usize> {
        let to = msg.transport.peer_addr;
        if to == addr_b() {
            if self.cut_to_b {
                return Ok(0);
            }
            self.b.handle_read(arrive(self.now, msg))?;
        } else if to == addr_a() {
            if self.cut_to_a {
                return Ok(0);
            }
            self.a.handle_read(arrive(self.now, msg))?;
        } else if let Some(relay) = self.relay.as_mut()
            && relay.serves(&to)
        {
            relay.handle_read(arrive(self.now, msg))?;
        } else {
            return Ok(0);
        }
        Ok(1)
    }

    /// Advances the clock by one tick, fires due timers and delivers the result.
    pub fn step(&mut self) -> Result<()> {
        self.now += TICK;
        let now = self.now;
        if self.a.poll_timeout().is_some_and(|t| t <= now) {
            self.a.handle_timeout(now)?;
        }
        if self.b.poll_timeout().is_some_and(|t| t <= now) {
            self.b.handle_timeout(now)?;
        }
        self.exchange()?;
        Ok(())
    }

    /// Steps until `done` holds or `limit` of simulated time passed.
    pub fn run_until(&mut self, limit: Duration, done: impl Fn(&Net) -> bool) -> Result<bool> {
        let end = self.now + limit;
        while self.now < end {
            if done(self) {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(done(self))
    }

    /// Negotiates and runs until both associations are up. Returns the sessions of
    /// `a` and `b`.
    pub fn connect(&mut self) -> Result<(SlotHandle, SlotHandle)> {
        self.negotiate()?;
        let up = self.run_until(Duration::from_secs(10), |net| {
            net.a.handler().connected().is_some() && net.b.handler().connected().is_some()
        })?;
        assert!(up, "endpoints did not connect");
        match (self.a.handler().connected(), self.b.handler().connected()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::ErrDtlsNotConnected),
        }
    }
}

fn arrive(now: Instant, msg: TransportMessage<BytesMut>) -> TransportMessage<BytesMut> {
    TransportMessage {
        now,
        transport: TransportContext {
            local_addr: msg.transport.peer_addr,
            peer_addr: msg.transport.local_addr,
            transport_protocol: TransportProtocol::UDP,
        },
        message: msg.message,
    }
}
