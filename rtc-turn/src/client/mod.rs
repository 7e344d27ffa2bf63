#[cfg(test)]
mod client_test;

mod binding;
pub mod framing;
mod permission;
mod proto;
pub mod relay;
mod transaction;

use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;

use binding::*;
use framing::StreamDecoder;
use relay::{Relay, RelayState};
use transaction::*;

use crate::proto::PROTO_UDP;
use crate::proto::chandata::*;
use crate::proto::channum::ChannelNumber;
use crate::proto::data::*;
use crate::proto::lifetime::{DEFAULT_LIFETIME, Lifetime};
use crate::proto::peeraddr::*;
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqtrans::RequestedTransport;
use shared::error::{Error, Result};
use shared::{TransportContext, TransportMessage, TransportProtocol};

pub(crate) const DEFAULT_RTO_IN_MS: u64 = 200;

pub type RelayedAddr = SocketAddr;
pub type PeerAddr = SocketAddr;

#[derive(Debug)]
pub enum Event {
    TransactionTimeout(TransactionId),

    AllocateResponse(TransactionId, RelayedAddr),
    AllocateError(TransactionId, Error),

    CreatePermissionResponse(TransactionId),
    CreatePermissionError(TransactionId, Error),

    ChannelBindResponse(TransactionId, ChannelNumber, PeerAddr),
    ChannelBindError(TransactionId, ChannelNumber, Error),

    DataIndicationOrChannelData(Option<ChannelNumber>, PeerAddr, BytesMut),
}

//              interval [msec]
// 0: 0 ms      +200
// 1: 200 ms    +400
// 2: 600 ms    +800
// 3: 1400 ms   +1600
// 4: 3000 ms   +1600
// 5: 4600 ms   +1600
// 6: 6200 ms   +1600
// -: 7800 ms   failed

/// ClientConfig is a bag of config parameters for Client.
pub struct ClientConfig {
    pub turn_serv_addr: Option<SocketAddr>,
    pub local_addr: SocketAddr,
    /// transport of the control connection; TCP in the usual deployment
    pub transport_protocol: TransportProtocol,
    pub username: String,
    pub password: String,
    pub software: String,
    pub rto_in_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            turn_serv_addr: None,
            local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            transport_protocol: TransportProtocol::TCP,
            username: String::new(),
            password: String::new(),
            software: String::new(),
            rto_in_ms: DEFAULT_RTO_IN_MS,
        }
    }
}

/// Client is a TURN client holding at most one allocation.
pub struct Client {
    turn_serv_addr: Option<SocketAddr>,
    local_addr: SocketAddr,
    transport_protocol: TransportProtocol,
    username: Username,
    password: String,
    realm: Realm,
    integrity: MessageIntegrity,
    software: Software,
    tr_map: TransactionMap,
    binding_mgr: BindingManager,
    rto_in_ms: u64,
    decoder: StreamDecoder,
    allocating: Option<TransactionId>,

    relay: Option<RelayState>,
    transmits: VecDeque<TransportMessage<BytesMut>>,
    events: VecDeque<Event>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Client {
            turn_serv_addr: config.turn_serv_addr,
            local_addr: config.local_addr,
            transport_protocol: config.transport_protocol,
            username: Username::new(ATTR_USERNAME, config.username),
            password: config.password,
            realm: Realm::new(ATTR_REALM, String::new()),
            software: Software::new(ATTR_SOFTWARE, config.software),
            tr_map: TransactionMap::new(),
            binding_mgr: BindingManager::new(),
            rto_in_ms: if config.rto_in_ms != 0 {
                config.rto_in_ms
            } else {
                DEFAULT_RTO_IN_MS
            },
            decoder: StreamDecoder::new(),
            allocating: None,
            integrity: MessageIntegrity::new_short_term_integrity(String::new()),

            relay: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn turn_server_addr(&self) -> Result<SocketAddr> {
        self.turn_serv_addr.ok_or(Error::ErrTurnServerAddressNotSet)
    }

    pub fn relayed_addr(&self) -> Option<RelayedAddr> {
        self.relay.as_ref().map(|r| r.relayed_addr)
    }

    /// is_from_server reports whether a datagram or stream segment came over the
    /// control connection.
    pub fn is_from_server(&self, transport: &TransportContext) -> bool {
        self.turn_serv_addr == Some(transport.peer_addr)
            && transport.transport_protocol == self.transport_protocol
    }

    /// channel_for returns the ready channel bound to `peer`, if any.
    pub fn channel_for(&self, peer: &SocketAddr) -> Option<ChannelNumber> {
        self.binding_mgr
            .find_by_addr(peer)
            .filter(|b| matches!(b.state(), BindingState::Ready | BindingState::Refresh))
            .map(|b| ChannelNumber(b.number))
    }

    // handle_inbound handles one complete message from the TURN server.
    // Relayed payloads surface as DataIndicationOrChannelData events.
    fn handle_inbound(&mut self, now: Instant, data: &[u8]) -> Result<()> {
        if is_message(data) {
            self.handle_stun_message(now, data)
        } else if ChannelData::is_channel_data(data) {
            self.handle_channel_data(data)
        } else {
            // received from TURN server, but it is not a STUN message
            Err(Error::ErrNonStunmessage)
        }
    }

    fn handle_stream(&mut self, now: Instant, data: &[u8]) -> Result<()> {
        self.decoder.extend_from_slice(data);
        while let Some(packet) = self.decoder.next_packet()? {
            if let Err(err) = self.handle_inbound(now, &packet) {
                warn!("discarding TURN message: {err}");
            }
        }
        Ok(())
    }

    fn handle_stun_message(&mut self, now: Instant, data: &[u8]) -> Result<()> {
        let mut msg = Message::new();
        msg.unmarshal_binary(data)?;

        if msg.typ.class == CLASS_REQUEST {
            return Err(Error::Other(format!(
                "{:?} : {}",
                Error::ErrUnexpectedStunrequestMessage,
                msg
            )));
        }

        if msg.typ.class == CLASS_INDICATION {
            if msg.typ.method == METHOD_DATA {
                let mut peer_addr = PeerAddress::default();
                peer_addr.get_from(&msg)?;
                let from = SocketAddr::from(peer_addr);

                let mut data = Data::default();
                data.get_from(&msg)?;

                trace!("data indication received from {from}");

                self.events.push_back(Event::DataIndicationOrChannelData(
                    None,
                    from,
                    BytesMut::from(&data.0[..]),
                ))
            }

            return Ok(());
        }

        // This is a STUN response message (transactional)
        // The type is either:
        // - stun.ClassSuccessResponse
        // - stun.ClassErrorResponse
        let Some(tr) = self.tr_map.remove(&msg.transaction_id) else {
            // silently discard
            debug!("no transaction for {msg}");
            return Ok(());
        };

        match msg.typ.method {
            METHOD_ALLOCATE => self.handle_allocate_response(now, msg, tr.transaction_type)?,
            METHOD_CREATE_PERMISSION => {
                if let TransactionType::CreatePermissionRequest(peers, retried) =
                    tr.transaction_type
                    && let Ok(mut relay) = self.relay()
                {
                    relay.handle_create_permission_response(now, msg, peers, retried)?;
                }
            }
            METHOD_REFRESH => {
                if let TransactionType::RefreshRequest(lifetime, retried) = tr.transaction_type
                    && let Ok(mut relay) = self.relay()
                {
                    relay.handle_refresh_allocation_response(now, msg, lifetime, retried)?;
                }
            }
            METHOD_CHANNEL_BIND => {
                if let TransactionType::ChannelBindRequest(number, peer, retried) =
                    tr.transaction_type
                    && let Ok(mut relay) = self.relay()
                {
                    relay.handle_channel_bind_response(now, msg, number, peer, retried)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_channel_data(&mut self, data: &[u8]) -> Result<()> {
        let mut ch_data = ChannelData {
            raw: data.to_vec(),
            ..Default::default()
        };
        ch_data.decode()?;

        let addr = self
            .find_addr_by_channel_number(ch_data.number.0)
            .ok_or(Error::ErrChannelBindNotFound)?;

        trace!(
            "channel data received from {} (ch={})",
            addr, ch_data.number.0
        );

        self.events.push_back(Event::DataIndicationOrChannelData(
            Some(ch_data.number),
            addr,
            BytesMut::from(&ch_data.data[..]),
        ));

        Ok(())
    }

    pub fn relay(&mut self) -> Result<Relay<'_>> {
        match self.relay.as_ref() {
            Some(state) => Ok(Relay {
                relayed_addr: state.relayed_addr,
                client: self,
            }),
            None => Err(Error::ErrNoAllocation),
        }
    }

    // find_addr_by_channel_number returns a peer address associated with the
    // channel number
    fn find_addr_by_channel_number(&self, ch_num: u16) -> Option<SocketAddr> {
        self.binding_mgr.find_by_number(ch_num).map(|b| b.addr)
    }

    /* https://datatracker.ietf.org/doc/html/rfc8656#section-20
    TURN                                 TURN          Peer         Peer
    client                               server         A            B
      |                                    |            |            |
      |--- Allocate request -------------->|            |            |
      |    REQUESTED-TRANSPORT=17 (UDP)    |            |            |
      |                                    |            |            |
      |<-- Allocate error response --------|            |            |
      |    ERROR-CODE=401 (Unauthorized)   |            |            |
      |    REALM="example.com"             |            |            |
      |    NONCE="obMatJos2gAAAadl7W7PeDU4hKE72jda"     |            |
      |                                    |            |            |
      |--- Allocate request -------------->|            |            |
      |    REQUESTED-TRANSPORT=17 (UDP)    |            |            |
      |    USERNAME="George"               |            |            |
      |    REALM="example.com"             |            |            |
      |    NONCE="obMatJos2gAAAadl7W7PeDU4hKE72jda"     |            |
      |    MESSAGE-INTEGRITY=...           |            |            |
      |                                    |            |            |
      |<-- Allocate success response ------|            |            |
      |    LIFETIME=1200 (20 minutes)      |            |            |
      |    XOR-RELAYED-ADDRESS=192.0.2.15:50000         |            |
      |    XOR-MAPPED-ADDRESS=192.0.2.1:7000            |            |
    */
    /// allocate sends a TURN allocation request to the TURN server. Only one
    /// allocation may exist or be in progress at a time.
    pub fn allocate(&mut self, now: Instant) -> Result<TransactionId> {
        if self.relay.is_some() {
            return Err(Error::ErrAlreadyAllocated);
        }
        if self.allocating.is_some() {
            return Err(Error::ErrOneAllocateOnly);
        }

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
            Box::new(RequestedTransport {
                protocol: PROTO_UDP,
            }),
        ];
        if !self.software.text.is_empty() {
            setters.push(Box::new(self.software.clone()));
        }
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;

        debug!("allocate: anonymous attempt");
        let tid = self.perform_transaction(now, &msg, TransactionType::AllocateAttempt)?;
        self.allocating = Some(tid);
        Ok(tid)
    }

    fn handle_allocate_response(
        &mut self,
        now: Instant,
        response: Message,
        allocate_state: TransactionType,
    ) -> Result<()> {
        if response.typ.class == CLASS_SUCCESS_RESPONSE {
            let nonce = match allocate_state {
                TransactionType::AllocateRequest(nonce) => nonce,
                _ => Nonce::new(ATTR_NONCE, String::new()),
            };
            return self.accept_allocation(now, response, nonce);
        }

        match allocate_state {
            TransactionType::AllocateAttempt => {
                // Anonymous allocate failed, trying to authenticate once.
                let challenge = Nonce::get_from_as(&response, ATTR_NONCE)
                    .and_then(|nonce| Ok((nonce, Realm::get_from_as(&response, ATTR_REALM)?)));
                let (nonce, realm) = match challenge {
                    Ok(challenge) => challenge,
                    Err(_) => {
                        self.allocating = None;
                        self.events.push_back(Event::AllocateError(
                            response.transaction_id,
                            Error::ErrAllocateChallengeMissing,
                        ));
                        return Ok(());
                    }
                };
                self.realm = realm;

                self.integrity = MessageIntegrity::new_long_term_integrity(
                    self.username.text.clone(),
                    self.realm.text.clone(),
                    self.password.clone(),
                );

                let mut msg = Message::new();
                msg.build(&[
                    Box::new(TransactionId::new()),
                    Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
                    Box::new(RequestedTransport {
                        protocol: PROTO_UDP,
                    }),
                    Box::new(self.username.clone()),
                    Box::new(self.realm.clone()),
                    Box::new(nonce.clone()),
                    Box::new(self.integrity.clone()),
                    Box::new(FINGERPRINT),
                ])?;

                debug!("allocate: authenticated attempt in realm {}", self.realm);
                let tid =
                    self.perform_transaction(now, &msg, TransactionType::AllocateRequest(nonce))?;
                self.allocating = Some(tid);
            }
            _ => {
                self.allocating = None;
                let mut code = ErrorCodeAttribute::default();
                let err = if code.get_from(&response).is_err() {
                    Error::Other(format!("{}", response.typ))
                } else {
                    Error::Other(format!("{} (error {})", response.typ, code))
                };
                self.events
                    .push_back(Event::AllocateError(response.transaction_id, err));
            }
        }
        Ok(())
    }

    fn accept_allocation(&mut self, now: Instant, response: Message, nonce: Nonce) -> Result<()> {
        self.allocating = None;

        // Getting relayed addresses from response.
        let mut relayed = RelayedAddress::default();
        if let Err(err) = relayed.get_from(&response) {
            self.events
                .push_back(Event::AllocateError(response.transaction_id, err));
            return Ok(());
        }
        let relayed_addr = RelayedAddr::from(relayed);

        // Getting lifetime from response
        let mut lifetime = Lifetime(DEFAULT_LIFETIME);
        if lifetime.get_from(&response).is_err() {
            lifetime = Lifetime(DEFAULT_LIFETIME);
        }

        debug!("allocated relay {relayed_addr} for {lifetime}");
        self.relay = Some(RelayState::new(relayed_addr, nonce, lifetime.0, now));
        self.events.push_back(Event::AllocateResponse(
            response.transaction_id,
            relayed_addr,
        ));
        Ok(())
    }

    // authenticated builds a request carrying the long-term credentials of the
    // current allocation.
    pub(crate) fn authenticated(
        &self,
        typ: MessageType,
        mut setters: Vec<Box<dyn Setter>>,
    ) -> Result<Message> {
        let nonce = self
            .relay
            .as_ref()
            .map(|r| r.nonce.clone())
            .ok_or(Error::ErrNoAllocation)?;

        let mut all: Vec<Box<dyn Setter>> = vec![Box::new(TransactionId::new()), Box::new(typ)];
        all.append(&mut setters);
        all.push(Box::new(self.username.clone()));
        all.push(Box::new(self.realm.clone()));
        all.push(Box::new(nonce));
        all.push(Box::new(self.integrity.clone()));
        all.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&all)?;
        Ok(msg)
    }

    // write_to queues data for the TURN server.
    fn write_to(&mut self, now: Instant, data: &[u8]) -> Result<()> {
        let peer_addr = self.turn_server_addr()?;
        self.transmits.push_back(TransportMessage {
            now,
            transport: TransportContext {
                local_addr: self.local_addr,
                peer_addr,
                transport_protocol: self.transport_protocol,
            },
            message: BytesMut::from(data),
        });
        Ok(())
    }

    // perform_transaction sends msg to the TURN server and tracks its answer
    fn perform_transaction(
        &mut self,
        now: Instant,
        msg: &Message,
        transaction_type: TransactionType,
    ) -> Result<TransactionId> {
        let request = TransportMessage {
            now,
            transport: TransportContext {
                local_addr: self.local_addr,
                peer_addr: self.turn_server_addr()?,
                transport_protocol: self.transport_protocol,
            },
            message: BytesMut::from(&msg.raw[..]),
        };
        trace!(
            "start {} transaction {:?} to {}",
            msg.typ, msg.transaction_id, request.transport.peer_addr
        );

        self.transmits.push_back(request.clone());
        self.tr_map.insert(
            msg.transaction_id,
            Transaction::new(
                transaction_type,
                request,
                Duration::from_millis(self.rto_in_ms),
            ),
        );

        Ok(msg.transaction_id)
    }
}
