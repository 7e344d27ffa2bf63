#[cfg(test)]
mod association_test;

pub mod association_config;
mod association_proto;
mod association_receive;
mod association_reconfig;
mod association_retransmit;
pub mod association_stream;

use crate::chunk::{
    Chunk, chunk_init::ChunkInit, chunk_payload_data::*, chunk_selective_ack::*, chunk_type::*,
};
use crate::packet::Packet;
use crate::param::Param;
use crate::util::*;
use association_config::*;
use association_reconfig::{LocalReset, PendingReconfig};
use association_retransmit::OutboundChunk;
use association_stream::*;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use rand::{Rng, rng};
use shared::error::{Error, Result};
use shared::time::MonotonicClock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Association lifecycle, from the initiator's or responder's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AssociationState {
    /// Waiting for the peer's INIT, or for `connect`.
    #[default]
    Idle,
    /// INIT sent.
    CookieWait,
    /// COOKIE-ECHO sent.
    CookieEchoed,
    Established,
    Closed,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Idle => "Idle",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of [`Association::send`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// Every fragment went out.
    Complete,
    /// Some fragments wait on credit; [`AssociationEvent::SendReady`] follows once they leave.
    Incomplete,
}

/// Outcome of [`Association::close_streams`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseStatus {
    Ok,
    AlreadyPending,
    NotSupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEvent {
    Connected,
    /// The holding queue drained after a send returned [`SendStatus::Incomplete`].
    SendReady,
    /// Streams closed by a completed or forced stream reset.
    StreamsReset { stream_ids: Vec<u16> },
    /// ABORT, SHUTDOWN, ERROR or heartbeat timeout.
    Closed,
}

/// A decrypted SCTP packet together with the instant it arrived.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub now: Instant,
    pub payload: BytesMut,
}

#[derive(Debug)]
struct HandshakeRetransmit {
    chunk: Chunk,
    verification_tag: u32,
    due: Instant,
}

/// Association represents an SCTP association carried over a DTLS session.
///
/// It performs no I/O: decrypted packets go in through `handle_read`, packets to encrypt
/// come out of `poll_write`, reassembled messages out of `poll_read`.
pub struct Association {
    config: AssociationConfig,
    clock: MonotonicClock,
    state: AssociationState,

    source_port: u16,
    destination_port: u16,
    my_verification_tag: u32,
    peer_verification_tag: u32,
    max_streams: u16,
    peer_extensions: Vec<ChunkType>,

    // outbound
    pub(crate) next_tsn: u32,
    cumulative_tsn_ack_point: u32,
    pub(crate) receiver_credits: usize,
    pub(crate) sender_credits: usize,
    pub(crate) cwnd: usize,
    pub(crate) ssthresh: usize,
    pub(crate) partial_bytes_acked: usize,
    srtt: f64,
    rttvar: f64,
    pub(crate) rto: u64,
    rtt_measured: bool,
    pub(crate) pending: VecDeque<OutboundChunk>,
    pub(crate) holding: VecDeque<OutboundChunk>,
    pub(crate) t3_start: Option<Instant>,
    pub(crate) fast_recovery_exit: Option<u32>,
    last_retransmit: Option<Instant>,
    handshake: Option<HandshakeRetransmit>,
    cookie_echo_sent_at: Option<Instant>,

    // inbound
    pub(crate) in_tsn: u32,
    pub(crate) user_tsn: u32,
    pub(crate) receive_hold: VecDeque<ChunkPayloadData>,
    pub(crate) held_bytes: usize,
    paused: bool,

    streams: HashMap<u16, StreamMeta>,

    reconfig_request_seq: u32,
    reconfig_response_seq: u32,
    pub(crate) local_reset: Option<LocalReset>,
    pub(crate) peer_reset: PendingReconfig,

    pub(crate) tick_count: u32,
    next_tick: Instant,

    reads: VecDeque<StreamMessage>,
    transmits: VecDeque<BytesMut>,
    events: VecDeque<AssociationEvent>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("state", &self.state)
            .field("my_verification_tag", &self.my_verification_tag)
            .field("peer_verification_tag", &self.peer_verification_tag)
            .field("next_tsn", &self.next_tsn)
            .field("in_tsn", &self.in_tsn)
            .field("user_tsn", &self.user_tsn)
            .field("cwnd", &self.cwnd)
            .field("ssthresh", &self.ssthresh)
            .field("rto", &self.rto)
            .field("pending", &self.pending.len())
            .field("holding", &self.holding.len())
            .finish()
    }
}

impl Association {
    pub fn new(config: AssociationConfig, now: Instant) -> Self {
        let mut r = rng();
        let my_verification_tag = r.random_range(1..=u32::MAX);
        let next_tsn: u32 = r.random();
        let mtu = config.mtu();

        Association {
            source_port: config.source_port(),
            destination_port: config.destination_port(),
            max_streams: config.max_streams(),
            clock: MonotonicClock::new(now),
            state: AssociationState::Idle,
            my_verification_tag,
            peer_verification_tag: 0,
            peer_extensions: vec![],

            next_tsn,
            cumulative_tsn_ack_point: next_tsn.wrapping_sub(1),
            receiver_credits: config.max_receive_window(),
            sender_credits: 4 * mtu,
            cwnd: 4 * mtu,
            ssthresh: 4 * mtu,
            partial_bytes_acked: 0,
            srtt: 0.0,
            rttvar: 0.0,
            rto: RTO_INITIAL,
            rtt_measured: false,
            pending: VecDeque::new(),
            holding: VecDeque::new(),
            t3_start: None,
            fast_recovery_exit: None,
            last_retransmit: None,
            handshake: None,
            cookie_echo_sent_at: None,

            in_tsn: 0,
            user_tsn: 0,
            receive_hold: VecDeque::new(),
            held_bytes: 0,
            paused: false,

            streams: HashMap::new(),

            reconfig_request_seq: next_tsn,
            reconfig_response_seq: 0,
            local_reset: None,
            peer_reset: PendingReconfig::None,

            tick_count: 0,
            next_tick: now + TICK_INTERVAL,

            reads: VecDeque::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            config,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    /// Number of outbound streams agreed in the handshake.
    pub fn max_streams(&self) -> u16 {
        self.max_streams
    }

    /// Whether the peer announced `typ` in its supported-extensions parameter.
    pub fn peer_supports(&self, typ: ChunkType) -> bool {
        self.peer_extensions.contains(&typ)
    }

    /// Bytes waiting on the holding queue for credit.
    pub fn pending_bytes_to_send(&self) -> usize {
        self.holding.iter().map(|c| c.len).sum()
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_stream_reliability(&mut self, stream_id: u16, reliability: StreamReliability) {
        self.streams.entry(stream_id).or_default().reliability = reliability;
    }

    pub fn stream_reliability(&self, stream_id: u16) -> Option<StreamReliability> {
        self.streams.get(&stream_id).map(|s| s.reliability)
    }

    /// Starts the handshake by sending INIT.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != AssociationState::Idle {
            trace!("connect ignored in state {}", self.state);
            return Ok(());
        }

        let init = Chunk::Init(self.init_chunk(false, vec![]));
        self.state = AssociationState::CookieWait;
        self.handshake = Some(HandshakeRetransmit {
            chunk: init.clone(),
            verification_tag: 0,
            due: now + Duration::from_millis(self.rto),
        });
        debug!("association state: {}", self.state);
        self.send_packet(0, vec![init])
    }

    /// Sends `payload` on `stream_id`, fragmenting it into DATA chunks.
    ///
    /// Fragments that the peer window or congestion window cannot take yet wait on the
    /// holding queue, and [`SendStatus::Incomplete`] is returned.
    pub fn send(
        &mut self,
        now: Instant,
        stream_id: u16,
        ppi: PayloadProtocolIdentifier,
        payload: &[u8],
    ) -> Result<SendStatus> {
        if self.state != AssociationState::Established {
            return Err(Error::ErrPayloadDataStateNotExist);
        }
        if payload.is_empty() {
            return Err(Error::ErrEmptyPayload);
        }
        if stream_id >= self.max_streams {
            return Err(Error::ErrStreamIdOutOfRange(stream_id));
        }

        let stream = self.streams.entry(stream_id).or_default();
        let stream_sequence_number = stream.next_sequence_number();
        let unordered = stream.reliability.unordered;

        let count = payload.len().div_ceil(MAX_FRAGMENT_SIZE);
        for (i, fragment) in payload.chunks(MAX_FRAGMENT_SIZE).enumerate() {
            let tsn = self.next_tsn;
            self.next_tsn = self.next_tsn.wrapping_add(1);

            let data = ChunkPayloadData {
                unordered,
                beginning_fragment: i == 0,
                ending_fragment: i + 1 == count,
                tsn,
                stream_identifier: stream_id,
                stream_sequence_number,
                payload_type: ppi,
                user_data: Bytes::copy_from_slice(fragment),
            };
            let packet = self.packet(self.peer_verification_tag, vec![Chunk::PayloadData(data)])?;
            let chunk = OutboundChunk::new(tsn, fragment.len(), packet.freeze(), now);

            if !self.holding.is_empty()
                || self.receiver_credits < chunk.len
                || self.sender_credits < chunk.len
            {
                self.holding.push_back(chunk);
            } else {
                self.transmit_new(now, chunk);
            }
        }

        Ok(if self.holding.is_empty() {
            SendStatus::Complete
        } else {
            SendStatus::Incomplete
        })
    }

    fn init_chunk(&self, is_ack: bool, mut params: Vec<Param>) -> ChunkInit {
        params.push(Param::SupportedExtensions(vec![CT_RECONFIG]));
        ChunkInit {
            is_ack,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.config.max_receive_window() as u32,
            num_outbound_streams: self.config.max_streams(),
            num_inbound_streams: self.config.max_streams(),
            initial_tsn: self.next_tsn,
            params,
        }
    }

    fn packet(&self, verification_tag: u32, chunks: Vec<Chunk>) -> Result<BytesMut> {
        Packet {
            source_port: self.source_port,
            destination_port: self.destination_port,
            verification_tag,
            chunks,
        }
        .marshal()
    }

    fn send_packet(&mut self, verification_tag: u32, chunks: Vec<Chunk>) -> Result<()> {
        for chunk in &chunks {
            trace!("send {chunk}");
        }
        let raw = self.packet(verification_tag, chunks)?;
        self.transmits.push_back(raw);
        Ok(())
    }

    pub(crate) fn send_chunks(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        self.send_packet(self.peer_verification_tag, chunks)
    }

    pub(crate) fn handle_packet(&mut self, now: Instant, raw: Bytes) -> Result<()> {
        if self.state == AssociationState::Closed {
            trace!("drop packet on closed association");
            return Ok(());
        }

        let packet = Packet::unmarshal(&raw)?;
        if packet.verification_tag != self.my_verification_tag && packet.verification_tag != 0 {
            trace!(
                "drop packet with verification tag {:#010x}",
                packet.verification_tag
            );
            return Ok(());
        }

        let ports = (packet.source_port, packet.destination_port);
        let mut reply = vec![];
        let mut sack_needed = false;

        for chunk in packet.chunks {
            trace!("recv {chunk}");
            match chunk {
                Chunk::Init(init) if init.is_ack => self.handle_init_ack(now, init, &mut reply),
                Chunk::Init(init) => self.handle_init(now, ports, init, &mut reply),
                Chunk::CookieEcho(cookie) => self.handle_cookie_echo(now, &cookie, &mut reply),
                Chunk::CookieAck => self.handle_cookie_ack(now),
                Chunk::PayloadData(data) if self.is_established() => {
                    self.handle_data(data);
                    sack_needed = true;
                }
                Chunk::SelectiveAck(sack) if self.is_established() => {
                    self.handle_sack(now, &sack);
                }
                Chunk::Heartbeat { is_ack: false, info } => {
                    self.tick_count = 0;
                    reply.push(Chunk::Heartbeat { is_ack: true, info });
                }
                Chunk::Heartbeat { is_ack: true, .. } => self.tick_count = 0,
                Chunk::Reconfig(params) if self.is_established() => {
                    self.handle_reconfig(now, params, &mut reply);
                }
                Chunk::Abort | Chunk::Shutdown | Chunk::ShutdownAck | Chunk::Error => {
                    self.close_with("peer ended the association");
                    return Ok(());
                }
                other => trace!("ignore {} in state {}", other.chunk_type(), self.state),
            }
        }

        if let Some(param) = self.check_deferred_peer_reset() {
            reply.push(Chunk::Reconfig(vec![param]));
        }
        if sack_needed {
            reply.push(Chunk::SelectiveAck(self.build_sack()));
        }
        if !reply.is_empty() {
            self.send_chunks(reply)?;
        }
        Ok(())
    }

    fn handle_init(
        &mut self,
        now: Instant,
        (source_port, destination_port): (u16, u16),
        init: ChunkInit,
        reply: &mut Vec<Chunk>,
    ) {
        if !matches!(
            self.state,
            AssociationState::Idle | AssociationState::CookieWait
        ) {
            trace!("ignore INIT in state {}", self.state);
            return;
        }
        if init.initiate_tag == 0 {
            trace!("ignore INIT with zero initiate tag");
            return;
        }

        self.peer_verification_tag = init.initiate_tag;
        self.source_port = destination_port;
        self.destination_port = source_port;
        self.apply_peer_init(&init);

        let cookie = self.clock.millis(now).to_be_bytes();
        let params = vec![Param::StateCookie(Bytes::copy_from_slice(&cookie))];
        reply.push(Chunk::Init(self.init_chunk(true, params)));
    }

    fn handle_init_ack(&mut self, now: Instant, init: ChunkInit, reply: &mut Vec<Chunk>) {
        if self.state != AssociationState::CookieWait {
            trace!("ignore INIT-ACK in state {}", self.state);
            return;
        }
        let Some(cookie) = init.state_cookie().cloned() else {
            debug!("{}", Error::ErrInitAckNoCookie);
            return;
        };
        if init.initiate_tag == 0 {
            trace!("ignore INIT-ACK with zero initiate tag");
            return;
        }

        self.peer_verification_tag = init.initiate_tag;
        self.apply_peer_init(&init);

        let echo = Chunk::CookieEcho(cookie);
        self.state = AssociationState::CookieEchoed;
        self.cookie_echo_sent_at = Some(now);
        self.handshake = Some(HandshakeRetransmit {
            chunk: echo.clone(),
            verification_tag: self.peer_verification_tag,
            due: now + Duration::from_millis(self.rto),
        });
        debug!("association state: {}", self.state);
        reply.push(echo);
    }

    fn apply_peer_init(&mut self, init: &ChunkInit) {
        self.receiver_credits = init.advertised_receiver_window_credit as usize;
        self.in_tsn = init.initial_tsn.wrapping_sub(1);
        self.user_tsn = self.in_tsn;
        self.reconfig_response_seq = self.in_tsn;
        self.max_streams = self
            .config
            .max_streams()
            .min(init.num_outbound_streams)
            .min(init.num_inbound_streams);
        self.peer_extensions = init.supported_extensions();
    }

    fn handle_cookie_echo(&mut self, now: Instant, cookie: &Bytes, reply: &mut Vec<Chunk>) {
        if self.peer_verification_tag == 0 {
            trace!("ignore COOKIE-ECHO before INIT");
            return;
        }

        if let Ok(raw) = <[u8; 8]>::try_from(&cookie[..]) {
            let sent = u64::from_be_bytes(raw);
            self.update_rto(self.clock.millis(now).saturating_sub(sent));
        }
        self.ssthresh = 4 * self.config.mtu();
        reply.push(Chunk::CookieAck);

        if self.state != AssociationState::Established {
            self.on_established();
        }
    }

    fn handle_cookie_ack(&mut self, now: Instant) {
        if self.state != AssociationState::CookieEchoed {
            trace!("ignore COOKIE-ACK in state {}", self.state);
            return;
        }
        if let Some(sent) = self.cookie_echo_sent_at.take() {
            self.update_rto(now.saturating_duration_since(sent).as_millis() as u64);
        }
        self.on_established();
    }

    fn on_established(&mut self) {
        self.state = AssociationState::Established;
        self.handshake = None;
        self.tick_count = 0;
        debug!(
            "association state: {}, rto={}ms, max_streams={}",
            self.state, self.rto, self.max_streams
        );
        self.events.push_back(AssociationEvent::Connected);
    }

    /// Tears the association down locally. Queued packets stay available to `poll_write`.
    pub(crate) fn close_with(&mut self, reason: &str) {
        if self.state == AssociationState::Closed {
            return;
        }
        debug!("association closed: {reason}");
        self.state = AssociationState::Closed;
        self.t3_start = None;
        self.handshake = None;
        self.local_reset = None;
        self.pending.clear();
        self.holding.clear();
        self.events.push_back(AssociationEvent::Closed);
    }

    pub(crate) fn handle_timers(&mut self, now: Instant) -> Result<()> {
        if self.state == AssociationState::Closed {
            return Ok(());
        }

        if now >= self.next_tick {
            self.next_tick = now + TICK_INTERVAL;
            self.on_tick()?;
            if self.state == AssociationState::Closed {
                return Ok(());
            }
        }

        if let Some(handshake) = &mut self.handshake
            && now >= handshake.due
        {
            self.rto = (self.rto * 2).min(RTO_MAX);
            handshake.due = now + Duration::from_millis(self.rto);
            let (tag, chunk) = (handshake.verification_tag, handshake.chunk.clone());
            debug!("retransmit {}", chunk.chunk_type());
            self.send_packet(tag, vec![chunk])?;
        }

        if self.is_established() {
            self.check_t3(now);
            self.check_reconfig_retry(now)?;
        }
        Ok(())
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        if self.state == AssociationState::Closed {
            return None;
        }
        let t3 = self
            .t3_start
            .filter(|_| !self.pending.is_empty())
            .map(|start| start + Duration::from_millis(self.rto));
        [
            Some(self.next_tick),
            t3,
            self.handshake.as_ref().map(|h| h.due),
            self.local_reset.as_ref().map(|l| l.retry_at),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
