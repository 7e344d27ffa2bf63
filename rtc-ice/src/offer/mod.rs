#[cfg(test)]
mod offer_test;

use bytes::{Buf, BufMut};

use crate::candidate::*;
use shared::error::{Error, Result};
use shared::marshal::*;

/// Only version of the offer block in use.
pub const OFFER_VERSION: u16 = 1;
/// Set when the sender of the block acts as DTLS server.
pub const FLAG_DTLS_SERVER: u32 = 0x2;
/// Most candidates an offer block advertises.
pub const MAX_CANDIDATES: usize = 8;

const OFFER_HEADER_SIZE: usize = 6;
const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// The offer/answer block exchanged out of band to set up a peer connection.
///
/// ```text
/// version u16 | flags u32 | ulen u8 | username | klen u8 | key | fplen u8 | fingerprint |
/// count u8 | count x (addr u32, port u16) | [ relay_len u8 | relay (addr u32, port u16) ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceOffer {
    pub flags: u32,
    pub username: String,
    pub key: String,
    pub fingerprint: Vec<u8>,
    pub candidates: Vec<Candidate>,
    /// TURN relayed transport address, present when the sender relays.
    pub relay: Option<Candidate>,
}

impl IceOffer {
    pub fn is_dtls_server(&self) -> bool {
        self.flags & FLAG_DTLS_SERVER != 0
    }

    fn check_fields(&self) -> Result<()> {
        if self.username.len() > MAX_FIELD_LEN
            || self.key.len() > MAX_FIELD_LEN
            || self.fingerprint.len() > MAX_FIELD_LEN
        {
            return Err(Error::ErrIceOfferFieldTooLong);
        }
        if self.candidates.len() > MAX_CANDIDATES {
            return Err(Error::ErrIceTooManyCandidates(MAX_CANDIDATES));
        }
        Ok(())
    }
}

impl MarshalSize for IceOffer {
    fn marshal_size(&self) -> usize {
        let relay = if self.relay.is_some() {
            1 + CANDIDATE_SIZE
        } else {
            0
        };
        OFFER_HEADER_SIZE
            + 1
            + self.username.len()
            + 1
            + self.key.len()
            + 1
            + self.fingerprint.len()
            + 1
            + self.candidates.len() * CANDIDATE_SIZE
            + relay
    }
}

impl Marshal for IceOffer {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        self.check_fields()?;
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }

        buf.put_u16(OFFER_VERSION);
        buf.put_u32(self.flags);
        for field in [
            self.username.as_bytes(),
            self.key.as_bytes(),
            self.fingerprint.as_slice(),
        ] {
            buf.put_u8(field.len() as u8);
            buf.put_slice(field);
        }

        buf.put_u8(self.candidates.len() as u8);
        for c in &self.candidates {
            let n = c.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        if let Some(relay) = &self.relay {
            buf.put_u8(CANDIDATE_SIZE as u8);
            relay.marshal_to(buf)?;
        }

        Ok(size)
    }
}

fn get_field<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 1 {
        return Err(Error::UnexpectedEndOfBuffer {
            expected: 1,
            actual: 0,
        });
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(Error::UnexpectedEndOfBuffer {
            expected: len,
            actual: buf.remaining(),
        });
    }
    let mut field = vec![0u8; len];
    buf.copy_to_slice(&mut field);
    Ok(field)
}

impl Unmarshal for IceOffer {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < OFFER_HEADER_SIZE {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: OFFER_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }

        let version = buf.get_u16();
        if version != OFFER_VERSION {
            return Err(Error::ErrIceOfferVersion(version));
        }
        let flags = buf.get_u32();

        let username = String::from_utf8(get_field(buf)?)?;
        let key = String::from_utf8(get_field(buf)?)?;
        let fingerprint = get_field(buf)?;

        if buf.remaining() < 1 {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: 1,
                actual: 0,
            });
        }
        let count = buf.get_u8() as usize;
        if count > MAX_CANDIDATES {
            return Err(Error::ErrIceTooManyCandidates(MAX_CANDIDATES));
        }
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            candidates.push(Candidate::unmarshal(buf)?);
        }

        // trailing relay record; anything that is not an IPv4 record is skipped
        let mut relay = None;
        if buf.has_remaining() {
            let record = get_field(buf)?;
            if record.len() == CANDIDATE_SIZE {
                relay = Some(Candidate::unmarshal(&mut record.as_slice())?);
            }
        }

        Ok(IceOffer {
            flags,
            username,
            key,
            fingerprint,
            candidates,
            relay,
        })
    }
}
