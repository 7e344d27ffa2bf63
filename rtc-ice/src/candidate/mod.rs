
use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use shared::error::{Error, Result};
use shared::marshal::*;

/// Wire size of a candidate: IPv4 address followed by the port, both in network order.
pub const CANDIDATE_SIZE: usize = 6;

/// A host candidate the peer can be reached on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Candidate(SocketAddrV4);

impl Candidate {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Candidate(SocketAddrV4::new(ip, port))
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }

    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(v4) => *v4 == self.0,
            SocketAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddrV4> for Candidate {
    fn from(addr: SocketAddrV4) -> Self {
        Candidate(addr)
    }
}

impl TryFrom<SocketAddr> for Candidate {
    type Error = Error;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(Candidate(v4)),
            SocketAddr::V6(_) => Err(Error::ErrIceCandidateNotIpv4),
        }
    }
}

impl MarshalSize for Candidate {
    fn marshal_size(&self) -> usize {
        CANDIDATE_SIZE
    }
}

impl Marshal for Candidate {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < CANDIDATE_SIZE {
            return Err(Error::ErrBufferShort);
        }
        buf.put_slice(&self.0.ip().octets());
        buf.put_u16(self.0.port());
        Ok(CANDIDATE_SIZE)
    }
}

impl Unmarshal for Candidate {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < CANDIDATE_SIZE {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CANDIDATE_SIZE,
                actual: buf.remaining(),
            });
        }
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        Ok(Candidate::new(ip, port))
    }
}
