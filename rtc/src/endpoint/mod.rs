
pub mod endpoint_config;
pub mod endpoint_handler;
mod endpoint_proto;

use bytes::{Bytes, BytesMut};
use datachannel::{DataChannelConfig, DataChannelEvent, DataChannelMessage};
use ice::agent::{Agent, IceEvent};
use log::{debug, trace, warn};
use sansio::Protocol;
use sctp::{Association, AssociationEvent, CloseStatus, Datagram, SendStatus};
use shared::error::{Error, Result};
use shared::time::MonotonicClock;
use shared::{
    RoutedMessage, SlotHandle, SlotTable, TaggedBytesMut, TransportContext, TransportMessage,
    TransportPath, TransportProtocol,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;
use stun::message::TransactionId;
use turn::client::{Client as TurnClient, Event as TurnEvent};
use turn::proto::channum::ChannelNumber;

use crate::demuxer::{DatagramKind, demux};
use crate::dtls_transport::{ConsentFreshness, DtlsSession, DtlsState, TlsEngine, TlsSession};
use endpoint_config::EndpointConfig;
use endpoint_handler::{Command, Commands, Flow, Handler};

/// Relay channels are numbered from here by DTLS session index.
const TURN_CHANNEL_BASE: u16 = 0x4000;

/// Endpoint ties the ICE agent, the TURN client and every DTLS session with its SCTP
/// association and data channels to one UDP socket.
///
/// It performs no I/O: datagrams go in through `handle_read`, come out of `poll_write`,
/// and time only advances through `handle_timeout`.
pub struct Endpoint<E: TlsEngine, H: Handler> {
    config: EndpointConfig,
    clock: MonotonicClock,

    agent: Agent,
    turn: Option<TurnClient>,
    permission_requests: HashMap<TransactionId, SlotHandle>,
    /// Slots that asked for permissions before the allocation existed.
    deferred_permissions: Vec<(SlotHandle, Vec<SocketAddr>)>,

    engine: E,
    sessions: SlotTable<DtlsSession<E::Session>>,

    handler: H,
    commands: Commands,
    pending_disconnects: Vec<SlotHandle>,

    last_now: Instant,
    transmits: VecDeque<TaggedBytesMut>,
}

impl<E: TlsEngine, H: Handler> Endpoint<E, H> {
    /// Creates an endpoint. With TURN enabled the allocation request is queued right
    /// away; it leaves through `poll_write` once the control connection is up.
    pub fn new(mut config: EndpointConfig, engine: E, handler: H, now: Instant) -> Result<Self> {
        let agent = Agent::new(config.agent.clone())?;
        let sessions = SlotTable::new(config.agent.max_slots);

        let turn = if config.turn_enabled() {
            config.turn.take().map(TurnClient::new)
        } else {
            None
        };

        let mut endpoint = Self {
            config,
            clock: MonotonicClock::new(now),
            agent,
            turn,
            permission_requests: HashMap::new(),
            deferred_permissions: vec![],
            engine,
            sessions,
            handler,
            commands: Commands::default(),
            pending_disconnects: vec![],
            last_now: now,
            transmits: VecDeque::new(),
        };

        if let Some(turn) = endpoint.turn.as_mut() {
            turn.allocate(now)?;
        }

        Ok(endpoint)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn session(&self, session: SlotHandle) -> Option<&DtlsSession<E::Session>> {
        self.sessions.get(session)
    }

    pub fn sessions(&self) -> Vec<SlotHandle> {
        self.sessions.handles()
    }

    /// The relayed transport address, once the TURN allocation succeeded.
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.turn.as_ref().and_then(|t| t.relayed_addr())
    }

    /// Username and key handed out on `slot`.
    pub fn local_credentials(&self, slot: SlotHandle) -> Option<(String, String)> {
        self.agent
            .slot(slot)
            .map(|s| (s.local_username().to_owned(), s.local_key().to_owned()))
    }

    pub fn generate_offer(&mut self, now: Instant) -> Result<(SlotHandle, Bytes)> {
        self.last_now = now;
        let offer = self.agent.generate_offer(now)?;
        self.process_agent(now);
        Ok(offer)
    }

    /// Applies a remote offer, or the answer to one of ours when `local_credentials`
    /// names the credentials we handed out. Returns our answer block.
    pub fn set_offer(
        &mut self,
        now: Instant,
        block: &[u8],
        local_credentials: Option<(&str, &str)>,
    ) -> Result<(SlotHandle, Bytes)> {
        self.last_now = now;
        let answer = self.agent.set_offer(now, block, local_credentials)?;
        self.process_agent(now);
        self.apply_commands(now);
        Ok(answer)
    }

    pub fn set_remote_parameters(
        &mut self,
        now: Instant,
        local_username: &str,
        remote_username: &str,
        remote_key: &str,
        fingerprint: &[u8],
        remote_is_dtls_server: bool,
    ) -> Result<SlotHandle> {
        self.last_now = now;
        let slot = self.agent.set_remote_parameters(
            now,
            local_username,
            remote_username,
            remote_key,
            fingerprint,
            remote_is_dtls_server,
        )?;
        self.process_agent(now);
        self.apply_commands(now);
        Ok(slot)
    }

    pub fn add_remote_candidate(
        &mut self,
        now: Instant,
        local_username: &str,
        addr: SocketAddr,
    ) -> Result<()> {
        self.last_now = now;
        self.agent.add_remote_candidate(now, local_username, addr)?;
        self.process_agent(now);
        self.apply_commands(now);
        Ok(())
    }

    /// Starts a DTLS client session on `slot` towards `path`, bypassing nomination.
    pub fn initiate_dtls(
        &mut self,
        now: Instant,
        slot: SlotHandle,
        path: TransportPath,
    ) -> Result<SlotHandle> {
        self.last_now = now;
        let session = self.allocate_session(now, slot, path, true)?;
        self.apply_commands(now);
        Ok(session)
    }

    /// Sends one message on an acknowledged channel.
    pub fn send(
        &mut self,
        now: Instant,
        session: SlotHandle,
        stream_id: u16,
        is_string: bool,
        data: &[u8],
    ) -> Result<SendStatus> {
        self.last_now = now;
        let status = self.send_message(now, session, stream_id, is_string, data);
        self.apply_commands(now);
        status
    }

    /// Opens a data channel and returns its stream id. The channel accepts data once
    /// the peer acknowledged it.
    pub fn open_channel(
        &mut self,
        now: Instant,
        session: SlotHandle,
        config: DataChannelConfig,
    ) -> Result<u16> {
        self.last_now = now;
        let stream_id = self.open_data_channel(now, session, config);
        self.apply_commands(now);
        stream_id
    }

    /// Resets the outgoing streams of the given channels.
    pub fn close_channels(
        &mut self,
        now: Instant,
        session: SlotHandle,
        stream_ids: &[u16],
    ) -> Result<CloseStatus> {
        self.last_now = now;
        let status = self.close_data_channels(now, session, stream_ids);
        self.apply_commands(now);
        status
    }

    /// Stops delivering data to `Handler::on_data` on `session`.
    pub fn pause(&mut self, session: SlotHandle) -> Result<()> {
        self.association_mut(session)?.pause();
        Ok(())
    }

    pub fn resume(&mut self, now: Instant, session: SlotHandle) -> Result<()> {
        self.last_now = now;
        let result = self.resume_delivery(now, session);
        self.apply_commands(now);
        result
    }

    /// Closes the DTLS session and frees its ICE slot. Disconnecting a session that is
    /// already gone is a no-op.
    pub fn disconnect(&mut self, now: Instant, session: SlotHandle) {
        self.last_now = now;
        self.teardown(now, session);
        self.apply_commands(now);
    }

    /// Bytes the association holds back for lack of credit.
    pub fn pending_bytes_to_send(&self, session: SlotHandle) -> Result<usize> {
        let s = self
            .sessions
            .get(session)
            .ok_or(Error::ErrDtlsSessionNotExisted)?;
        Ok(s.association
            .as_ref()
            .map(|a| a.pending_bytes_to_send())
            .unwrap_or_default())
    }

    fn connected_session(
        &mut self,
        session: SlotHandle,
    ) -> Result<&mut DtlsSession<E::Session>> {
        let s = self
            .sessions
            .get_mut(session)
            .ok_or(Error::ErrDtlsSessionNotExisted)?;
        if s.state != DtlsState::Connected || s.association.is_none() {
            return Err(Error::ErrDtlsNotConnected);
        }
        Ok(s)
    }

    fn association_mut(&mut self, session: SlotHandle) -> Result<&mut Association> {
        self.connected_session(session)?
            .association
            .as_mut()
            .ok_or(Error::ErrDtlsNotConnected)
    }

    fn send_message(
        &mut self,
        now: Instant,
        session: SlotHandle,
        stream_id: u16,
        is_string: bool,
        data: &[u8],
    ) -> Result<SendStatus> {
        let s = self.connected_session(session)?;
        s.channels
            .handle_write(DataChannelMessage::new(stream_id, is_string, data))?;
        let status = s.send_channel_writes(now)?;
        self.pump(now, session);
        Ok(status)
    }

    fn open_data_channel(
        &mut self,
        now: Instant,
        session: SlotHandle,
        config: DataChannelConfig,
    ) -> Result<u16> {
        let s = self.connected_session(session)?;
        if !s.association.as_ref().is_some_and(|a| a.is_established()) {
            return Err(Error::ErrPayloadDataStateNotExist);
        }
        let stream_id = s.channels.open(config)?;
        // OPEN leaves ordered and reliable; the channel's own mode applies afterwards
        s.send_channel_writes(now)?;
        let reliability = s.channels.get(stream_id).map(|c| c.reliability());
        if let (Some(association), Some(reliability)) = (s.association.as_mut(), reliability) {
            association.set_stream_reliability(stream_id, reliability);
        }
        debug!("dtls session {session}: opening data channel {stream_id}");
        self.pump(now, session);
        Ok(stream_id)
    }

    fn close_data_channels(
        &mut self,
        now: Instant,
        session: SlotHandle,
        stream_ids: &[u16],
    ) -> Result<CloseStatus> {
        let status = self.association_mut(session)?.close_streams(now, stream_ids)?;
        self.pump(now, session);
        Ok(status)
    }

    fn resume_delivery(&mut self, now: Instant, session: SlotHandle) -> Result<()> {
        self.association_mut(session)?.resume()?;
        self.pump(now, session);
        Ok(())
    }

    /// Runs what callbacks queued. Commands queued while applying run in the same pass.
    fn apply_commands(&mut self, now: Instant) {
        while let Some(command) = self.commands.pop() {
            let result = match command {
                Command::Send {
                    session,
                    stream_id,
                    is_string,
                    data,
                } => self
                    .send_message(now, session, stream_id, is_string, &data)
                    .map(|_| ()),
                Command::OpenChannel { session, config } => {
                    self.open_data_channel(now, session, config).map(|_| ())
                }
                Command::CloseChannels {
                    session,
                    stream_ids,
                } => self
                    .close_data_channels(now, session, &stream_ids)
                    .map(|_| ()),
                Command::Pause(session) => self.pause(session),
                Command::Resume(session) => self.resume_delivery(now, session),
                Command::Disconnect(session) => {
                    if !self.pending_disconnects.contains(&session) {
                        self.pending_disconnects.push(session);
                    }
                    Ok(())
                }
            };
            if let Err(err) = result {
                debug!("command failed: {err}");
            }
        }
    }

    fn transmit(&mut self, now: Instant, path: TransportPath, message: BytesMut) -> Result<()> {
        match path {
            TransportPath::Direct(peer_addr) => {
                self.transmits.push_back(TransportMessage {
                    now,
                    transport: TransportContext {
                        local_addr: self.config.local_addr,
                        peer_addr,
                        transport_protocol: TransportProtocol::UDP,
                    },
                    message,
                });
                Ok(())
            }
            TransportPath::RelayIndication(peer) | TransportPath::RelayChannel { peer, .. } => {
                let turn = self.turn.as_mut().ok_or(Error::ErrNoAllocation)?;
                turn.relay()?.send_to(now, peer, &message)
            }
        }
    }

    fn flush_agent(&mut self, now: Instant) {
        while let Some(msg) = self.agent.poll_write() {
            if let Err(err) = self.transmit(now, msg.path, msg.message) {
                debug!("drop STUN to {}: {err}", msg.path.peer_addr());
            }
        }
    }

    fn process_agent(&mut self, now: Instant) {
        loop {
            self.flush_agent(now);
            let Some(event) = self.agent.poll_event() else {
                break;
            };
            match event {
                IceEvent::CreatePermissions { slot, peers } => {
                    self.request_permissions(now, slot, peers);
                }
                IceEvent::Nominated {
                    slot,
                    path,
                    initiate_dtls,
                } => {
                    trace!("slot {slot}: nominated {}", path.peer_addr());
                    if initiate_dtls && let Err(err) = self.allocate_session(now, slot, path, true)
                    {
                        warn!("slot {slot}: cannot start dtls: {err}");
                    }
                }
                IceEvent::ConsentResponse {
                    session,
                    transaction_id,
                } => {
                    if let Some(s) = self.sessions.get_mut(session)
                        && let Some(consent) = s.consent.as_mut()
                    {
                        consent.record_response(now);
                        trace!(
                            "dtls session {session}: consent confirmed {:?}",
                            ConsentFreshness::parse_transaction_id(&transaction_id)
                        );
                    }
                }
            }
        }
    }

    fn request_permissions(&mut self, now: Instant, slot: SlotHandle, peers: Vec<SocketAddr>) {
        let Some(turn) = self.turn.as_mut() else {
            if let Err(err) = self.agent.start_checks(now, slot) {
                debug!("slot {slot}: {err}");
            }
            return;
        };
        if turn.relayed_addr().is_none() {
            self.deferred_permissions.push((slot, peers));
            return;
        }
        match turn.relay().and_then(|mut relay| relay.create_permissions(now, &peers)) {
            Ok(tid) => {
                self.permission_requests.insert(tid, slot);
            }
            Err(err) => {
                warn!("slot {slot}: relay permissions failed: {err}");
                if let Err(err) = self.agent.start_checks(now, slot) {
                    debug!("slot {slot}: {err}");
                }
            }
        }
    }

    fn process_turn(&mut self, now: Instant) {
        loop {
            let Some(event) = self.turn.as_mut().and_then(|t| t.poll_event()) else {
                break;
            };
            match event {
                TurnEvent::AllocateResponse(_, relayed) => {
                    debug!("relayed address {relayed}");
                    if let Err(err) = self.agent.set_relayed_address(Some(relayed)) {
                        warn!("relayed address {relayed} rejected: {err}");
                    }
                    for (slot, peers) in std::mem::take(&mut self.deferred_permissions) {
                        self.request_permissions(now, slot, peers);
                    }
                }
                TurnEvent::AllocateError(_, err) => {
                    warn!("allocation failed: {err}");
                    for (slot, _) in std::mem::take(&mut self.deferred_permissions) {
                        if let Err(err) = self.agent.start_checks(now, slot) {
                            debug!("slot {slot}: {err}");
                        }
                    }
                }
                TurnEvent::CreatePermissionResponse(tid) => {
                    if let Some(slot) = self.permission_requests.remove(&tid)
                        && let Err(err) = self.agent.start_checks(now, slot)
                    {
                        debug!("slot {slot}: {err}");
                    }
                }
                TurnEvent::CreatePermissionError(tid, err) => {
                    if let Some(slot) = self.permission_requests.remove(&tid) {
                        warn!("slot {slot}: relay permissions failed: {err}");
                    }
                }
                TurnEvent::ChannelBindResponse(_, number, peer) => {
                    let bound = self
                        .sessions
                        .iter_mut()
                        .find(|(_, s)| s.turn_channel == Some(number.0));
                    let Some((handle, s)) = bound else {
                        continue;
                    };
                    debug!("dtls session {handle}: relay channel {:#x} ready", number.0);
                    s.switch_path(TransportPath::RelayChannel {
                        channel: number.0,
                        peer,
                    });
                    if s.channel_bind.take().is_some() {
                        if let Err(err) = self.start_association(now, handle) {
                            warn!("dtls session {handle}: {err}");
                            self.teardown(now, handle);
                            continue;
                        }
                        self.pump(now, handle);
                    }
                }
                TurnEvent::ChannelBindError(tid, number, err) => {
                    warn!("relay channel {:#x} not bound: {err}", number.0);
                    if let Some(handle) = self.session_by_channel_bind(&tid) {
                        self.teardown(now, handle);
                    }
                }
                TurnEvent::TransactionTimeout(tid) => {
                    if let Some(slot) = self.permission_requests.remove(&tid) {
                        warn!("slot {slot}: relay permissions timed out");
                    } else if let Some(handle) = self.session_by_channel_bind(&tid) {
                        warn!("dtls session {handle}: relay channel bind timed out");
                        self.teardown(now, handle);
                    } else {
                        debug!("TURN transaction {tid:?} timed out");
                    }
                }
                TurnEvent::DataIndicationOrChannelData(number, peer, data) => {
                    let path = match number {
                        Some(ChannelNumber(channel)) => TransportPath::RelayChannel { channel, peer },
                        None => TransportPath::RelayIndication(peer),
                    };
                    self.handle_datagram(now, path, data);
                }
            }
        }
    }

    /// Dispatches one peer datagram by its first byte.
    fn handle_datagram(&mut self, now: Instant, path: TransportPath, data: BytesMut) {
        match demux(&data) {
            DatagramKind::Stun => {
                if let Err(err) = self.agent.handle_read(RoutedMessage {
                    now,
                    path,
                    message: data,
                }) {
                    trace!("drop STUN from {}: {err}", path.peer_addr());
                }
                self.process_agent(now);
            }
            DatagramKind::Dtls => self.handle_dtls(now, path, &data),
            DatagramKind::Unknown => {
                trace!("drop {} bytes from {}", data.len(), path.peer_addr());
            }
        }
    }

    fn session_by_peer(&self, peer: &SocketAddr) -> Option<SlotHandle> {
        self.sessions
            .iter()
            .find(|(_, s)| s.path.peer_addr() == *peer)
            .map(|(handle, _)| handle)
    }

    /// Finds the session a DTLS datagram belongs to, accepting a new one when the sender
    /// passed connectivity checks on a slot that has none yet.
    fn resolve_session(
        &mut self,
        now: Instant,
        path: TransportPath,
    ) -> Result<Option<SlotHandle>> {
        let peer = path.peer_addr();
        if let Some(handle) = self.session_by_peer(&peer) {
            return Ok(Some(handle));
        }
        if let Some(handle) = self.agent.session_for_candidate(&peer)
            && let Some(s) = self.sessions.get_mut(handle)
        {
            s.switch_path(path);
            return Ok(Some(handle));
        }
        if let Some(slot) = self.agent.accept_dtls_from(&peer) {
            return self.allocate_session(now, slot, path, false).map(Some);
        }
        Ok(None)
    }

    fn handle_dtls(&mut self, now: Instant, path: TransportPath, data: &[u8]) {
        let handle = match self.resolve_session(now, path) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                trace!("drop DTLS from unverified {}", path.peer_addr());
                return;
            }
            Err(err) => {
                warn!("drop DTLS from {}: {err}", path.peer_addr());
                return;
            }
        };

        let Some(s) = self.sessions.get_mut(handle) else {
            return;
        };
        let records = match s.tls.handle_ciphertext(now, data) {
            Ok(records) => records,
            Err(err) => {
                warn!("dtls session {handle}: {err}");
                self.teardown(now, handle);
                return;
            }
        };
        let completed = s.state == DtlsState::Handshaking && s.tls.is_handshake_complete();
        let closed = s.tls.is_closed();

        if completed && let Err(err) = self.handshake_complete(now, handle) {
            warn!("dtls session {handle}: {err}");
            self.teardown(now, handle);
            return;
        }

        if let Some(association) = self
            .sessions
            .get_mut(handle)
            .and_then(|s| s.association.as_mut())
        {
            for payload in records {
                if let Err(err) = association.handle_read(Datagram { now, payload }) {
                    trace!("dtls session {handle}: drop SCTP packet: {err}");
                }
            }
        }
        self.pump(now, handle);

        if closed {
            debug!("dtls session {handle}: closed by peer");
            self.teardown(now, handle);
        }
    }

    fn allocate_session(
        &mut self,
        now: Instant,
        slot: SlotHandle,
        path: TransportPath,
        is_client: bool,
    ) -> Result<SlotHandle> {
        let fingerprint = self
            .agent
            .slot(slot)
            .and_then(|s| s.remote())
            .map(|remote| remote.fingerprint.clone())
            .ok_or(Error::ErrIceSlotNotExisted)?;
        let tls = self.engine.new_session(is_client, &fingerprint)?;
        let session = DtlsSession::new(slot, tls, is_client, path, self.config.sctp.max_streams());
        let handle = self
            .sessions
            .insert(session)
            .map_err(|_| Error::ErrDtlsNoFreeSlot)?;
        if let Err(err) = self.agent.bind_dtls(slot, handle) {
            self.sessions.remove(handle);
            return Err(err);
        }
        debug!(
            "dtls session {handle}: {} {} on slot {slot}",
            if is_client { "connecting to" } else { "accepting" },
            path.peer_addr()
        );

        if is_client {
            if let Some(s) = self.sessions.get_mut(handle) {
                s.tls.start_handshake(now)?;
            }
            self.flush_session(now, handle);
        }
        Ok(handle)
    }

    fn handshake_complete(&mut self, now: Instant, handle: SlotHandle) -> Result<()> {
        let consent = self.config.consent_freshness.then(|| {
            ConsentFreshness::new(
                now + self.config.consent_start_delay,
                self.config.consent_interval,
                self.config.consent_timeout,
            )
        });

        let s = self
            .sessions
            .get_mut(handle)
            .ok_or(Error::ErrDtlsSessionNotExisted)?;
        s.state = DtlsState::Connected;
        s.consent = consent;
        let path = s.path;
        debug!("dtls session {handle}: handshake complete");

        if !path.is_relayed() {
            return self.start_association(now, handle);
        }

        // SCTP waits for the relay channel
        let number = TURN_CHANNEL_BASE | handle.index() as u16;
        let tid = self.turn.as_mut().ok_or(Error::ErrNoAllocation).and_then(|t| {
            t.relay()?
                .create_channel_binding(now, ChannelNumber(number), path.peer_addr())
        })?;
        if let Some(s) = self.sessions.get_mut(handle) {
            s.turn_channel = Some(number);
            s.channel_bind = Some(tid);
        }
        Ok(())
    }

    /// Creates the session's association; the DTLS client sends INIT.
    fn start_association(&mut self, now: Instant, handle: SlotHandle) -> Result<()> {
        let s = self
            .sessions
            .get_mut(handle)
            .ok_or(Error::ErrDtlsSessionNotExisted)?;
        if s.association.is_some() {
            return Ok(());
        }
        let mut association = Association::new(self.config.sctp.clone(), now);
        if s.is_client {
            association.connect(now)?;
        }
        s.association = Some(association);
        Ok(())
    }

    fn session_by_channel_bind(&self, tid: &TransactionId) -> Option<SlotHandle> {
        self.sessions
            .iter()
            .find(|(_, s)| s.channel_bind.as_ref() == Some(tid))
            .map(|(handle, _)| handle)
    }

    /// Encrypts queued SCTP packets and sends every pending datagram of the session.
    fn flush_session(&mut self, now: Instant, handle: SlotHandle) {
        let Some(s) = self.sessions.get_mut(handle) else {
            return;
        };
        if let Err(err) = s.flush_association() {
            warn!("dtls session {handle}: {err}");
        }
        let path = s.path;
        for datagram in s.drain_ciphertext() {
            if let Err(err) = self.transmit(now, path, datagram) {
                debug!("dtls session {handle}: drop datagram: {err}");
            }
        }
    }

    /// Moves data between the association, the channels and the handler until the
    /// session has nothing more to say.
    fn pump(&mut self, now: Instant, handle: SlotHandle) {
        let mut association_events = vec![];
        let mut channel_events = vec![];
        {
            let Some(s) = self.sessions.get_mut(handle) else {
                return;
            };
            if s.association.is_none() {
                self.flush_session(now, handle);
                return;
            }
            if let Err(err) = s.send_channel_writes(now) {
                debug!("dtls session {handle}: {err}");
            }
            if let Some(association) = s.association.as_mut() {
                while let Some(msg) = association.poll_read() {
                    if let Err(err) = s.channels.handle_read(msg.into()) {
                        debug!("dtls session {handle}: {err}");
                    }
                }
                while let Some(event) = association.poll_event() {
                    match &event {
                        AssociationEvent::Connected => {
                            s.channels.set_max_streams(association.max_streams());
                        }
                        AssociationEvent::StreamsReset { stream_ids } => {
                            s.channels.streams_reset(stream_ids);
                        }
                        _ => {}
                    }
                    association_events.push(event);
                }
            }
            while let Some(event) = s.channels.poll_event() {
                channel_events.push(event);
            }
        }

        let mut closed = false;
        for event in association_events {
            match event {
                AssociationEvent::Connected => {
                    debug!("dtls session {handle}: association established");
                    self.handler.on_connect(&mut self.commands, handle, true);
                }
                AssociationEvent::SendReady => {
                    self.handler.on_send_ok(&mut self.commands, handle);
                }
                AssociationEvent::StreamsReset { stream_ids } => {
                    trace!("dtls session {handle}: streams {stream_ids:?} reset");
                }
                AssociationEvent::Closed => closed = true,
            }
        }

        for event in channel_events {
            match event {
                DataChannelEvent::Open {
                    stream_id,
                    label,
                    protocol,
                } => {
                    let suppress = self.handler.on_data_channel(
                        &mut self.commands,
                        handle,
                        stream_id,
                        &label,
                        &protocol,
                    );
                    self.accept_channel(now, handle, stream_id, !suppress);
                }
                DataChannelEvent::Ack { stream_id } => {
                    self.handler
                        .on_data_channel_ack(&mut self.commands, handle, stream_id);
                }
                DataChannelEvent::Closed { stream_id } => {
                    self.handler
                        .on_data_channel_closed(&mut self.commands, handle, stream_id);
                }
            }
        }

        self.deliver(handle);
        self.flush_session(now, handle);

        if closed {
            debug!("dtls session {handle}: association closed");
            self.teardown(now, handle);
        }
    }

    fn accept_channel(&mut self, now: Instant, handle: SlotHandle, stream_id: u16, ack: bool) {
        let Some(s) = self.sessions.get_mut(handle) else {
            return;
        };
        if ack {
            if let Err(err) = s.channels.acknowledge(stream_id) {
                debug!("dtls session {handle}: {err}");
            }
            if let Err(err) = s.send_channel_writes(now) {
                debug!("dtls session {handle}: {err}");
            }
        }
        let reliability = s.channels.get(stream_id).map(|c| c.reliability());
        if let (Some(association), Some(reliability)) = (s.association.as_mut(), reliability) {
            association.set_stream_reliability(stream_id, reliability);
        }
    }

    /// Hands received messages to the handler until it pauses the session.
    fn deliver(&mut self, handle: SlotHandle) {
        loop {
            let Some(s) = self.sessions.get_mut(handle) else {
                return;
            };
            if s.association.as_ref().is_some_and(|a| a.is_paused()) {
                return;
            }
            let Some(msg) = s.channels.poll_read() else {
                return;
            };
            let flow = self.handler.on_data(
                &mut self.commands,
                handle,
                msg.stream_id,
                msg.is_string(),
                &msg.payload,
            );
            if flow == Flow::Pause
                && let Some(association) = self
                    .sessions
                    .get_mut(handle)
                    .and_then(|s| s.association.as_mut())
            {
                association.pause();
            }
        }
    }

    /// Shuts the session down, flushing what it still has to send, and frees its ICE
    /// slot. Safe to call on a session that is already gone.
    fn teardown(&mut self, now: Instant, handle: SlotHandle) {
        self.pending_disconnects.retain(|h| *h != handle);
        let Some(s) = self.sessions.get_mut(handle) else {
            return;
        };
        if s.state == DtlsState::Disconnecting {
            return;
        }
        debug!("dtls session {handle}: disconnecting from {}", s.state);
        s.state = DtlsState::Disconnecting;

        let mut stream_ids = s.channels.stream_ids();
        stream_ids.sort_unstable();
        if let Some(association) = s.association.as_mut()
            && !stream_ids.is_empty()
            && let Err(err) = association.close_streams(now, &stream_ids)
        {
            debug!("dtls session {handle}: {err}");
        }
        if let Err(err) = s.flush_association() {
            debug!("dtls session {handle}: {err}");
        }
        if let Err(err) = s.tls.shutdown() {
            debug!("dtls session {handle}: {err}");
        }
        s.channels.streams_reset(&stream_ids);
        let mut closed = vec![];
        while let Some(event) = s.channels.poll_event() {
            if let DataChannelEvent::Closed { stream_id } = event {
                closed.push(stream_id);
            }
        }
        self.flush_session(now, handle);

        if let Some(s) = self.sessions.remove(handle) {
            self.agent.clear_slot(s.ice_slot);
        }
        for stream_id in closed {
            self.handler
                .on_data_channel_closed(&mut self.commands, handle, stream_id);
        }
        self.handler.on_connect(&mut self.commands, handle, false);
    }

    fn session_timeout(&mut self, now: Instant, handle: SlotHandle) {
        let Some(s) = self.sessions.get_mut(handle) else {
            return;
        };
        if let Err(err) = s.tls.handle_timeout(now) {
            warn!("dtls session {handle}: {err}");
            self.teardown(now, handle);
            return;
        }
        if let Some(association) = s.association.as_mut()
            && let Err(err) = association.handle_timeout(now)
        {
            debug!("dtls session {handle}: {err}");
        }

        if s.consent.as_ref().is_some_and(|c| c.is_expired(now)) {
            warn!("dtls session {handle}: consent expired");
            self.teardown(now, handle);
            return;
        }
        let (slot, path) = (s.ice_slot, s.path);
        if s.consent.as_mut().is_some_and(|c| c.probe_due(now)) {
            let tid = ConsentFreshness::transaction_id(handle.index(), self.clock.millis(now));
            if let Err(err) = self.agent.send_consent_request(now, slot, path, tid) {
                debug!("dtls session {handle}: consent probe failed: {err}");
            }
            self.flush_agent(now);
        }

        self.pump(now, handle);
    }
}
