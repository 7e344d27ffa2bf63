use bytes::BytesMut;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Type of transport protocol, either UDP or TCP
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    /// UDP, used for peer datagrams and STUN probes
    #[default]
    UDP,
    /// TCP, used for the TURN control connection
    TCP,
}

/// Transport Context with local address, peer address and protocol
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address
    pub local_addr: SocketAddr,
    /// Peer socket address
    pub peer_addr: SocketAddr,
    /// Type of transport protocol, either UDP or TCP
    pub transport_protocol: TransportProtocol,
}

impl Default for TransportContext {
    fn default() -> Self {
        let unspecified = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        Self {
            local_addr: unspecified,
            peer_addr: unspecified,
            transport_protocol: TransportProtocol::UDP,
        }
    }
}

/// A generic transmit with [TransportContext]
#[derive(Debug, Clone)]
pub struct TransportMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// A transport context with [local_addr](TransportContext::local_addr) and [peer_addr](TransportContext::peer_addr)
    pub transport: TransportContext,
    /// Message body with generic type
    pub message: T,
}

/// BytesMut type transmit with [TransportContext]
pub type TaggedBytesMut = TransportMessage<BytesMut>;

/// A peer datagram together with the route it arrived on or has to leave by
#[derive(Debug, Clone)]
pub struct RoutedMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// Direct or relayed route to the peer
    pub path: TransportPath,
    /// Message body with generic type
    pub message: T,
}

/// BytesMut type peer datagram with [TransportPath]
pub type RoutedBytesMut = RoutedMessage<BytesMut>;

/// The route a peer datagram takes once a candidate has been chosen.
///
/// Relayed routes are carried over the TURN control connection, either wrapped in a
/// Send indication or, once a channel binding exists, in ChannelData framing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportPath {
    /// Plain UDP datagram to the peer
    Direct(SocketAddr),
    /// TURN Send indication towards the peer
    RelayIndication(SocketAddr),
    /// TURN ChannelData on a bound channel
    RelayChannel { channel: u16, peer: SocketAddr },
}

impl TransportPath {
    /// The peer transport address, regardless of how datagrams reach it.
    pub fn peer_addr(&self) -> SocketAddr {
        match *self {
            TransportPath::Direct(addr) => addr,
            TransportPath::RelayIndication(addr) => addr,
            TransportPath::RelayChannel { peer, .. } => peer,
        }
    }

    pub fn is_relayed(&self) -> bool {
        !matches!(self, TransportPath::Direct(_))
    }
}
