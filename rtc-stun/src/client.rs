
use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::addr::*;
use crate::attributes::*;
use crate::change::*;
use crate::fingerprint::*;
use crate::message::*;
use crate::xoraddr::*;
use shared::error::*;
use shared::{TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// First transaction id byte of every discovery request. Inbound STUN responses whose
/// transaction id starts with this value belong to the discovery client.
pub const DISCOVERY_TRANSACTION_PREFIX: u8 = 255;
// Last transaction id byte when the flight runs RFC 5780 mapping detection.
const MAPPING_DETECTION_MARK: u8 = 255;

/// is_discovery_response reports whether `buf` is a STUN message addressed to the
/// NAT discovery client.
pub fn is_discovery_response(buf: &[u8]) -> bool {
    is_message(buf) && buf[8] == DISCOVERY_TRANSACTION_PREFIX
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NatType {
    /// The server never answered the first probe.
    Unknown,
    /// The mapped address is one of our own interface addresses.
    NoNat,
    /// Plain STUN was requested, only the public interface is known.
    PublicInterface,
    FullCone,
    Restricted,
    PortRestricted,
    Symmetric,
    /// The server does not advertise an alternate address.
    Rfc5780NotImplemented,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            NatType::Unknown => "Unknown",
            NatType::NoNat => "No NAT",
            NatType::PublicInterface => "Public Interface",
            NatType::FullCone => "Full Cone",
            NatType::Restricted => "Restricted",
            NatType::PortRestricted => "Port Restricted",
            NatType::Symmetric => "Symmetric",
            NatType::Rfc5780NotImplemented => "RFC 5780 Not Implemented",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NatResult {
    pub nat_type: NatType,
    pub public_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NatTypeDetected(NatResult),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NatState {
    Idle,
    CheckingUdp,
    CheckingFullCone,
    CheckingSymmetric,
    CheckingFiltering,
    CheckingRestricted,
    Complete,
}

impl fmt::Display for NatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            NatState::Idle => "Idle",
            NatState::CheckingUdp => "CheckingUdp",
            NatState::CheckingFullCone => "CheckingFullCone",
            NatState::CheckingSymmetric => "CheckingSymmetric",
            NatState::CheckingFiltering => "CheckingFiltering",
            NatState::CheckingRestricted => "CheckingRestricted",
            NatState::Complete => "Complete",
        };
        write!(f, "{s}")
    }
}

/// Starts one discovery flight against `server`. Without mapping detection the flight
/// stops after the first response and reports the public interface.
#[derive(Debug, Copy, Clone)]
pub struct DiscoveryRequest {
    pub now: Instant,
    pub server: SocketAddr,
    pub mapping_detection: bool,
}

pub struct ClientBuilder {
    local_addr: SocketAddr,
    local_ips: Vec<IpAddr>,
    timeout: Duration,
    filtering_check: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            local_ips: vec![],
            timeout: DEFAULT_TIMEOUT,
            filtering_check: false,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// with_local_addr sets the socket address probes are sent from.
    pub fn with_local_addr(mut self, local_addr: SocketAddr) -> Self {
        self.local_addr = local_addr;
        self
    }

    /// with_local_ips sets the interface addresses compared against the mapped address.
    pub fn with_local_ips(mut self, local_ips: Vec<IpAddr>) -> Self {
        self.local_ips = local_ips;
        self
    }

    /// with_timeout sets how long each probe waits for its response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// with_filtering_check enables the RFC 5780 filtering tests once the mapping is
    /// found to be endpoint independent, so that restricted and port restricted cones
    /// are told apart from full cones.
    pub fn with_filtering_check(mut self, enabled: bool) -> Self {
        self.filtering_check = enabled;
        self
    }

    pub fn build(self) -> Client {
        let mut local_ips = self.local_ips;
        if local_ips.is_empty() && !self.local_addr.ip().is_unspecified() {
            local_ips.push(self.local_addr.ip());
        }
        Client {
            local_addr: self.local_addr,
            local_ips,
            timeout: self.timeout,
            filtering_check: self.filtering_check,
            state: NatState::Idle,
            flight: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }
}

struct Flight {
    server: SocketAddr,
    mapping_detection: bool,
    transaction_id: TransactionId,
    deadline: Instant,
    public: Option<SocketAddr>,
    public2: Option<SocketAddr>,
    other: Option<SocketAddr>,
}

/// Client classifies the NAT in front of the local socket with a sequence of binding
/// requests carrying CHANGE-REQUEST. One flight runs at a time.
pub struct Client {
    local_addr: SocketAddr,
    local_ips: Vec<IpAddr>,
    timeout: Duration,
    filtering_check: bool,
    state: NatState,
    flight: Option<Flight>,
    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<Event>,
}

impl Client {
    pub fn state(&self) -> NatState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        self.flight.is_some()
    }

    /// perform_stun asks `server` for our public mapping only.
    pub fn perform_stun(&mut self, now: Instant, server: SocketAddr) -> Result<()> {
        self.start(DiscoveryRequest {
            now,
            server,
            mapping_detection: false,
        })
    }

    /// perform_nat_behavior_discovery runs the full mapping classification against `server`.
    pub fn perform_nat_behavior_discovery(&mut self, now: Instant, server: SocketAddr) -> Result<()> {
        self.start(DiscoveryRequest {
            now,
            server,
            mapping_detection: true,
        })
    }

    fn start(&mut self, req: DiscoveryRequest) -> Result<()> {
        if self.flight.is_some() {
            return Err(Error::ErrNatDiscoveryInProgress);
        }
        self.flight = Some(Flight {
            server: req.server,
            mapping_detection: req.mapping_detection,
            transaction_id: TransactionId::default(),
            deadline: req.now,
            public: None,
            public2: None,
            other: None,
        });
        self.probe(
            req.now,
            NatState::CheckingUdp,
            req.server,
            ChangeRequest::default(),
        )
    }

    fn probe(
        &mut self,
        now: Instant,
        state: NatState,
        to: SocketAddr,
        change: ChangeRequest,
    ) -> Result<()> {
        let flight = self.flight.as_mut().ok_or(Error::ErrTransactionNotExists)?;

        let mut transaction_id = TransactionId::with_prefix(DISCOVERY_TRANSACTION_PREFIX);
        transaction_id.0[TRANSACTION_ID_SIZE - 1] = if flight.mapping_detection {
            MAPPING_DETECTION_MARK
        } else {
            0
        };

        let mut m = Message::new();
        m.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(transaction_id),
            Box::new(change),
            Box::new(FINGERPRINT),
        ])?;

        flight.transaction_id = transaction_id;
        flight.deadline = now + self.timeout;
        debug!("nat discovery {} -> {} probing {}", self.state, state, to);
        self.state = state;

        self.transmits.push_back(TransportMessage {
            now,
            transport: TransportContext {
                local_addr: self.local_addr,
                peer_addr: to,
                transport_protocol: TransportProtocol::UDP,
            },
            message: BytesMut::from(&m.raw[..]),
        });
        Ok(())
    }

    fn complete(&mut self, nat_type: NatType) {
        let public_addr = self.flight.take().and_then(|f| f.public);
        debug!("nat discovery {} -> Complete: {}", self.state, nat_type);
        self.state = NatState::Complete;
        self.events.push_back(Event::NatTypeDetected(NatResult {
            nat_type,
            public_addr,
        }));
    }

    fn handle_response(&mut self, now: Instant, m: &Message) -> Result<()> {
        let mapped = mapped_address(m)?;
        let Some(flight) = self.flight.as_mut() else {
            return Ok(());
        };

        match self.state {
            NatState::CheckingUdp => {
                flight.public = Some(mapped);
                if self.local_ips.contains(&mapped.ip()) {
                    self.complete(NatType::NoNat);
                } else if !flight.mapping_detection {
                    self.complete(NatType::PublicInterface);
                } else {
                    let mut other = OtherAddress::default();
                    if other.get_from(m).is_ok() {
                        let other = SocketAddr::from(&other.0);
                        flight.other = Some(other);
                        let to = SocketAddr::new(other.ip(), flight.server.port());
                        self.probe(
                            now,
                            NatState::CheckingFullCone,
                            to,
                            ChangeRequest::default(),
                        )?;
                    } else {
                        self.complete(NatType::Rfc5780NotImplemented);
                    }
                }
            }
            NatState::CheckingFullCone => {
                flight.public2 = Some(mapped);
                let same_port = flight.public.map(|p| p.port()) == Some(mapped.port());
                if !same_port {
                    let to = flight.other.ok_or(Error::ErrAttributeNotFound)?;
                    self.probe(
                        now,
                        NatState::CheckingSymmetric,
                        to,
                        ChangeRequest::default(),
                    )?;
                } else if self.filtering_check {
                    let to = flight.server;
                    self.probe(
                        now,
                        NatState::CheckingFiltering,
                        to,
                        ChangeRequest::new(true, true),
                    )?;
                } else {
                    self.complete(NatType::FullCone);
                }
            }
            NatState::CheckingSymmetric => {
                if flight.public2.map(|p| p.port()) == Some(mapped.port()) {
                    self.complete(NatType::Restricted);
                } else {
                    self.complete(NatType::Symmetric);
                }
            }
            NatState::CheckingFiltering => self.complete(NatType::FullCone),
            NatState::CheckingRestricted => self.complete(NatType::Restricted),
            NatState::Idle | NatState::Complete => {}
        }
        Ok(())
    }

    fn handle_probe_timeout(&mut self, now: Instant) -> Result<()> {
        warn!("nat discovery probe timed out in {}", self.state);
        match self.state {
            NatState::CheckingUdp => self.complete(NatType::Unknown),
            NatState::CheckingFullCone => self.complete(NatType::Rfc5780NotImplemented),
            NatState::CheckingSymmetric => self.complete(NatType::Symmetric),
            NatState::CheckingFiltering => {
                let to = self
                    .flight
                    .as_ref()
                    .map(|f| f.server)
                    .ok_or(Error::ErrTransactionNotExists)?;
                self.probe(
                    now,
                    NatState::CheckingRestricted,
                    to,
                    ChangeRequest::new(false, true),
                )?;
            }
            NatState::CheckingRestricted => self.complete(NatType::PortRestricted),
            NatState::Idle | NatState::Complete => {
                self.flight = None;
            }
        }
        Ok(())
    }
}

// mapped_address prefers XOR-MAPPED-ADDRESS and falls back to MAPPED-ADDRESS.
fn mapped_address(m: &Message) -> Result<SocketAddr> {
    let mut xor = XorMappedAddress::default();
    if xor.get_from(m).is_ok() {
        return Ok(SocketAddr::from(&xor));
    }
    let mut mapped = MappedAddress::default();
    mapped.get_from(m)?;
    Ok(SocketAddr::from(&mapped))
}

impl sansio::Protocol<TaggedBytesMut, DiscoveryRequest, ()> for Client {
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = Event;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        let mut m = Message::new();
        m.unmarshal_binary(&msg.message)?;

        let expected = match self.flight.as_ref() {
            Some(flight) => flight.transaction_id,
            None => {
                trace!("nat discovery: no flight for {}", m);
                return Ok(());
            }
        };
        if m.transaction_id != expected || m.typ.class != CLASS_SUCCESS_RESPONSE {
            trace!("nat discovery: ignoring {} from {}", m, msg.transport.peer_addr);
            return Ok(());
        }
        if m.contains(ATTR_FINGERPRINT) {
            FINGERPRINT.check(&m)?;
        }

        self.handle_response(msg.now, &m)
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, req: DiscoveryRequest) -> Result<()> {
        self.start(req)
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.transmits.pop_front()
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        match self.flight.as_ref() {
            Some(flight) if flight.deadline <= now => self.handle_probe_timeout(now),
            _ => Ok(()),
        }
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.flight.as_ref().map(|f| f.deadline)
    }

    fn close(&mut self) -> Result<()> {
        self.flight = None;
        self.state = NatState::Idle;
        self.transmits.clear();
        Ok(())
    }
}
