//! A TURN server holding one UDP allocation, enough to relay a single client.
use bytes::BytesMut;
use rtc::shared::error::Result;
use rtc::shared::{TaggedBytesMut, TransportContext, TransportProtocol};
use rtc::stun::attributes::*;
use rtc::stun::error_code::*;
use rtc::stun::fingerprint::FINGERPRINT;
use rtc::stun::message::*;
use rtc::stun::textattrs::*;
use rtc::turn::client::ClientConfig;
use rtc::turn::proto::chandata::ChannelData;
use rtc::turn::proto::channum::ChannelNumber;
use rtc::turn::proto::data::Data;
use rtc::turn::proto::lifetime::Lifetime;
use rtc::turn::proto::peeraddr::PeerAddress;
use rtc::turn::proto::relayaddr::RelayedAddress;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

const REALM: &str = "example.org";
const NONCE: &str = "f8e6d3f2a1b0";

pub fn turn_server_addr() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 10], 3478))
}

pub fn relayed_addr() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 10], 61000))
}

/// Credentials and transport for a client of [TurnServer].
pub fn turn_client_config(local_addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        turn_serv_addr: Some(turn_server_addr()),
        local_addr,
        transport_protocol: TransportProtocol::UDP,
        username: "user".to_owned(),
        password: "pass".to_owned(),
        ..Default::default()
    }
}

/// How the client handed a peer datagram to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relayed {
    Indication(Vec<u8>),
    Channel(u16, Vec<u8>),
}

/// Answers Allocate (after one 401 challenge), CreatePermission, ChannelBind and
/// Refresh, and moves peer datagrams between the client and its relayed address.
#[derive(Default)]
pub struct TurnServer {
    client: Option<SocketAddr>,
    permissions: Vec<IpAddr>,
    channels: Vec<(u16, SocketAddr)>,
    /// Answer ChannelBind with 403 (Forbidden).
    pub refuse_channel_bind: bool,
    /// Every payload the client relayed towards a peer, in order.
    pub from_client: Vec<Relayed>,
    out: VecDeque<TaggedBytesMut>,
}

impl TurnServer {
    /// Whether datagrams addressed to `addr` land here.
    pub fn serves(&self, addr: &SocketAddr) -> bool {
        *addr == turn_server_addr() || *addr == relayed_addr()
    }

    pub fn channel_bound(&self) -> bool {
        !self.channels.is_empty()
    }

    pub fn poll_write(&mut self) -> Option<TaggedBytesMut> {
        self.out.pop_front()
    }

    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        let now = msg.now;
        let from = msg.transport.peer_addr;
        if msg.transport.local_addr == relayed_addr() {
            self.from_peer(now, from, &msg.message);
            return Ok(());
        }

        self.client = Some(from);
        if is_message(&msg.message) {
            let mut m = Message::new();
            m.unmarshal_binary(&msg.message)?;
            return self.handle_stun(now, &m);
        }
        if ChannelData::is_channel_data(&msg.message) {
            let mut ch_data = ChannelData {
                raw: msg.message.to_vec(),
                ..Default::default()
            };
            ch_data.decode()?;
            let number = ch_data.number.0;
            self.from_client
                .push(Relayed::Channel(number, ch_data.data.clone()));
            if let Some(peer) = self.peer_of(number) {
                self.to_peer(now, peer, &ch_data.data);
            }
        }
        Ok(())
    }

    fn handle_stun(&mut self, now: Instant, m: &Message) -> Result<()> {
        if m.typ == MessageType::new(METHOD_SEND, CLASS_INDICATION) {
            let mut peer = PeerAddress::default();
            peer.get_from(m)?;
            let mut data = Data::default();
            data.get_from(m)?;
            self.from_client.push(Relayed::Indication(data.0.clone()));
            self.to_peer(now, SocketAddr::from(peer), &data.0);
            return Ok(());
        }
        if m.typ.class != CLASS_REQUEST {
            return Ok(());
        }

        match m.typ.method {
            METHOD_ALLOCATE if !m.contains(ATTR_USERNAME) => self.respond(
                now,
                m,
                CLASS_ERROR_RESPONSE,
                vec![
                    Box::new(CODE_UNAUTHORIZED),
                    Box::new(Realm::new(ATTR_REALM, REALM.to_owned())),
                    Box::new(Nonce::new(ATTR_NONCE, NONCE.to_owned())),
                ],
            ),
            METHOD_ALLOCATE => {
                let relayed = relayed_addr();
                self.respond(
                    now,
                    m,
                    CLASS_SUCCESS_RESPONSE,
                    vec![
                        Box::new(RelayedAddress {
                            ip: relayed.ip(),
                            port: relayed.port(),
                        }),
                        Box::new(Lifetime(Duration::from_secs(600))),
                    ],
                )
            }
            METHOD_CREATE_PERMISSION => {
                let mut peer = PeerAddress::default();
                peer.get_from(m)?;
                self.permit(SocketAddr::from(peer).ip());
                self.respond(now, m, CLASS_SUCCESS_RESPONSE, vec![])
            }
            METHOD_CHANNEL_BIND if self.refuse_channel_bind => {
                self.respond(now, m, CLASS_ERROR_RESPONSE, vec![Box::new(CODE_FORBIDDEN)])
            }
            METHOD_CHANNEL_BIND => {
                let mut number = ChannelNumber::default();
                number.get_from(m)?;
                let mut peer = PeerAddress::default();
                peer.get_from(m)?;
                let peer = SocketAddr::from(peer);
                self.permit(peer.ip());
                self.channels.retain(|(n, _)| *n != number.0);
                self.channels.push((number.0, peer));
                self.respond(now, m, CLASS_SUCCESS_RESPONSE, vec![])
            }
            METHOD_REFRESH => self.respond(
                now,
                m,
                CLASS_SUCCESS_RESPONSE,
                vec![Box::new(Lifetime(Duration::from_secs(600)))],
            ),
            _ => self.respond(now, m, CLASS_ERROR_RESPONSE, vec![Box::new(CODE_BAD_REQUEST)]),
        }
    }

    fn from_peer(&mut self, now: Instant, peer: SocketAddr, data: &[u8]) {
        if !self.permissions.contains(&peer.ip()) {
            return;
        }
        let channel = self
            .channels
            .iter()
            .find(|(_, addr)| *addr == peer)
            .map(|(n, _)| *n);
        match channel {
            Some(number) => {
                let mut ch_data = ChannelData {
                    data: data.to_vec(),
                    number: ChannelNumber(number),
                    ..Default::default()
                };
                ch_data.encode();
                self.to_client(now, &ch_data.raw);
            }
            None => {
                let mut m = Message::new();
                let built = m.build(&[
                    Box::new(TransactionId::new()),
                    Box::new(MessageType::new(METHOD_DATA, CLASS_INDICATION)),
                    Box::new(Data(data.to_vec())),
                    Box::new(PeerAddress::from(peer)),
                    Box::new(FINGERPRINT),
                ]);
                if built.is_ok() {
                    self.to_client(now, &m.raw);
                }
            }
        }
    }

    fn respond(
        &mut self,
        now: Instant,
        request: &Message,
        class: MessageClass,
        mut setters: Vec<Box<dyn Setter>>,
    ) -> Result<()> {
        let mut all: Vec<Box<dyn Setter>> = vec![
            Box::new(request.transaction_id),
            Box::new(MessageType::new(request.typ.method, class)),
        ];
        all.append(&mut setters);
        all.push(Box::new(FINGERPRINT));

        let mut m = Message::new();
        m.build(&all)?;
        self.to_client(now, &m.raw);
        Ok(())
    }

    fn permit(&mut self, ip: IpAddr) {
        if !self.permissions.contains(&ip) {
            self.permissions.push(ip);
        }
    }

    fn peer_of(&self, number: u16) -> Option<SocketAddr> {
        self.channels
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, peer)| *peer)
    }

    fn to_client(&mut self, now: Instant, raw: &[u8]) {
        let Some(client) = self.client else {
            return;
        };
        self.out.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: turn_server_addr(),
                peer_addr: client,
                transport_protocol: TransportProtocol::UDP,
            },
            message: BytesMut::from(raw),
        });
    }

    fn to_peer(&mut self, now: Instant, peer: SocketAddr, data: &[u8]) {
        if !self.permissions.contains(&peer.ip()) {
            return;
        }
        self.out.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: relayed_addr(),
                peer_addr: peer,
                transport_protocol: TransportProtocol::UDP,
            },
            message: BytesMut::from(data),
        });
    }
}
