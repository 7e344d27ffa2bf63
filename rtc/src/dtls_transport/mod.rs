
use bytes::BytesMut;
use datachannel::DataChannels;
use ice::agent::{CONSENT_PREFIX, consent_transaction_id};
use log::debug;
use ring::digest;
use sansio::Protocol;
use sctp::{Association, SendStatus};
use shared::error::{Error, Result};
use shared::{SlotHandle, TransportPath};
use std::fmt;
use std::time::{Duration, Instant};
use stun::message::TransactionId;

/// The cryptographic engine DTLS sessions are created from.
///
/// Certificates, cipher suites and fingerprint verification are the engine's business;
/// sessions only move records in and out.
pub trait TlsEngine {
    type Session: TlsSession;

    /// Creates a session in client (connect) or server (accept) mode. The remote
    /// certificate must match `remote_fingerprint` once the handshake completes.
    fn new_session(&mut self, is_client: bool, remote_fingerprint: &[u8]) -> Result<Self::Session>;
}

/// One DTLS session, driven without I/O.
pub trait TlsSession {
    /// Sends the first flight. Only called on client sessions.
    fn start_handshake(&mut self, now: Instant) -> Result<()>;

    /// Consumes one datagram from the peer and returns the application records it held.
    fn handle_ciphertext(&mut self, now: Instant, data: &[u8]) -> Result<Vec<BytesMut>>;

    /// Encrypts one application record.
    fn write_plaintext(&mut self, data: &[u8]) -> Result<()>;

    /// Returns datagrams to send to the peer.
    fn poll_ciphertext(&mut self) -> Option<BytesMut>;

    fn is_handshake_complete(&self) -> bool;

    /// The peer sent close_notify or a fatal alert.
    fn is_closed(&self) -> bool;

    /// Queues close_notify.
    fn shutdown(&mut self) -> Result<()>;

    /// Handshake retransmission timer.
    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }
}

/// SHA-256 of a DER certificate, the form fingerprints take in offer blocks.
pub fn certificate_fingerprint(der: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, der).as_ref().to_vec()
}

/// DtlsState indicates the DTLS session state.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DtlsState {
    #[default]
    Free,
    Handshaking,
    Connected,
    Disconnecting,
}

impl fmt::Display for DtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DtlsState::Free => "free",
            DtlsState::Handshaking => "handshaking",
            DtlsState::Connected => "connected",
            DtlsState::Disconnecting => "disconnecting",
        };
        write!(f, "{s}")
    }
}

/// Consent freshness (RFC 7675) for one connected session.
#[derive(Debug, Clone)]
pub struct ConsentFreshness {
    interval: Duration,
    timeout: Duration,
    next_probe: Instant,
    last_response: Instant,
}

impl ConsentFreshness {
    /// Probing starts at `start`; consent counts as fresh until then.
    pub fn new(start: Instant, interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_probe: start,
            last_response: start,
        }
    }

    pub fn poll_timeout(&self) -> Instant {
        self.next_probe.min(self.last_response + self.timeout)
    }

    /// Consent was not confirmed in time.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.last_response + self.timeout
    }

    /// Whether a probe is due; reschedules the next one when it is.
    pub fn probe_due(&mut self, now: Instant) -> bool {
        if now < self.next_probe {
            return false;
        }
        self.next_probe = now + self.interval;
        true
    }

    pub fn record_response(&mut self, now: Instant) {
        self.last_response = now;
    }

    /// The transaction id of a probe for session `index` sent at `timestamp_ms`.
    pub fn transaction_id(index: usize, timestamp_ms: u64) -> TransactionId {
        consent_transaction_id(index, timestamp_ms)
    }

    /// Recovers the session index and send timestamp from a probe's transaction id.
    pub fn parse_transaction_id(tid: &TransactionId) -> Option<(usize, u64)> {
        let prefix = tid.0[0];
        if prefix & CONSENT_PREFIX == 0 {
            return None;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&tid.0[1..9]);
        Some(((prefix ^ CONSENT_PREFIX) as usize, u64::from_be_bytes(ts)))
    }
}

/// A DTLS session bound to one ICE slot, carrying the SCTP association and its data
/// channels once the handshake is done.
pub struct DtlsSession<S> {
    pub(crate) ice_slot: SlotHandle,
    pub(crate) state: DtlsState,
    pub(crate) tls: S,
    pub(crate) is_client: bool,
    pub(crate) path: TransportPath,
    pub(crate) association: Option<Association>,
    pub(crate) channels: DataChannels,
    pub(crate) consent: Option<ConsentFreshness>,
    pub(crate) turn_channel: Option<u16>,
    /// ChannelBind request the association waits on before it starts.
    pub(crate) channel_bind: Option<TransactionId>,
}

impl<S: TlsSession> DtlsSession<S> {
    pub(crate) fn new(
        ice_slot: SlotHandle,
        tls: S,
        is_client: bool,
        path: TransportPath,
        max_streams: u16,
    ) -> Self {
        Self {
            ice_slot,
            state: DtlsState::Handshaking,
            tls,
            is_client,
            path,
            association: None,
            channels: DataChannels::new(is_client, max_streams),
            consent: None,
            turn_channel: None,
            channel_bind: None,
        }
    }

    pub fn state(&self) -> DtlsState {
        self.state
    }

    /// The ICE slot this session was created for. Resolves to nothing once the slot
    /// was cleared or reused.
    pub fn ice_slot(&self) -> SlotHandle {
        self.ice_slot
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn path(&self) -> TransportPath {
        self.path
    }

    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    pub fn channels(&self) -> &DataChannels {
        &self.channels
    }

    /// Moves the session to another route, as when the peer switched candidates.
    pub(crate) fn switch_path(&mut self, path: TransportPath) {
        if self.path != path {
            debug!(
                "dtls session path {} -> {}",
                self.path.peer_addr(),
                path.peer_addr()
            );
            self.path = path;
        }
    }

    /// Hands queued channel messages to the association.
    pub(crate) fn send_channel_writes(&mut self, now: Instant) -> Result<SendStatus> {
        let association = self
            .association
            .as_mut()
            .ok_or(Error::ErrDtlsNotConnected)?;
        let mut status = SendStatus::Complete;
        while let Some(m) = self.channels.poll_write() {
            status = association.send(now, m.stream_id, m.ppi, &m.payload)?;
        }
        Ok(status)
    }

    /// Encrypts whatever the association queued.
    pub(crate) fn flush_association(&mut self) -> Result<()> {
        if let Some(association) = self.association.as_mut() {
            while let Some(packet) = association.poll_write() {
                self.tls.write_plaintext(&packet)?;
            }
        }
        Ok(())
    }

    pub(crate) fn drain_ciphertext(&mut self) -> Vec<BytesMut> {
        let mut out = vec![];
        while let Some(datagram) = self.tls.poll_ciphertext() {
            out.push(datagram);
        }
        out
    }

    pub(crate) fn poll_timeout(&mut self) -> Option<Instant> {
        [
            self.tls.poll_timeout(),
            self.association.as_mut().and_then(|a| a.poll_timeout()),
            self.consent.as_ref().map(|c| c.poll_timeout()),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
