
pub mod chunk_header;
pub mod chunk_init;
pub mod chunk_payload_data;
pub mod chunk_selective_ack;
pub mod chunk_type;

use crate::param::*;
use bytes::{Buf, Bytes};
use chunk_header::*;
use chunk_init::*;
use chunk_payload_data::*;
use chunk_selective_ack::*;
use chunk_type::*;
use shared::error::{Error, Result};
use shared::marshal::*;
use shared::util::pad4;
use std::fmt;

/// A single chunk of an SCTP packet.
///
/// Chunks whose value the association never looks at (ABORT, SHUTDOWN, ERROR and
/// friends) keep only their type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    PayloadData(ChunkPayloadData),
    Init(ChunkInit),
    SelectiveAck(ChunkSelectiveAck),
    /// HEARTBEAT or HEARTBEAT-ACK; the info is echoed back untouched.
    Heartbeat { is_ack: bool, info: Bytes },
    CookieEcho(Bytes),
    CookieAck,
    Reconfig(Vec<Param>),
    Abort,
    Shutdown,
    ShutdownAck,
    Error,
    Unknown(ChunkHeader),
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::PayloadData(d) => write!(
                f,
                "{} tsn={} sid={} ssn={} len={}",
                CT_PAYLOAD_DATA,
                d.tsn,
                d.stream_identifier,
                d.stream_sequence_number,
                d.user_data.len()
            ),
            Chunk::SelectiveAck(s) => write!(
                f,
                "{} cum={} a_rwnd={} gaps={}",
                CT_SACK,
                s.cumulative_tsn_ack,
                s.advertised_receiver_window_credit,
                s.gap_ack_blocks.len()
            ),
            _ => write!(f, "{}", self.chunk_type()),
        }
    }
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::PayloadData(_) => CT_PAYLOAD_DATA,
            Chunk::Init(init) if init.is_ack => CT_INIT_ACK,
            Chunk::Init(_) => CT_INIT,
            Chunk::SelectiveAck(_) => CT_SACK,
            Chunk::Heartbeat { is_ack: true, .. } => CT_HEARTBEAT_ACK,
            Chunk::Heartbeat { .. } => CT_HEARTBEAT,
            Chunk::CookieEcho(_) => CT_COOKIE_ECHO,
            Chunk::CookieAck => CT_COOKIE_ACK,
            Chunk::Reconfig(_) => CT_RECONFIG,
            Chunk::Abort => CT_ABORT,
            Chunk::Shutdown => CT_SHUTDOWN,
            Chunk::ShutdownAck => CT_SHUTDOWN_ACK,
            Chunk::Error => CT_ERROR,
            Chunk::Unknown(header) => header.typ,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Chunk::PayloadData(d) => d.flags(),
            Chunk::Unknown(header) => header.flags,
            _ => 0,
        }
    }

    fn value_size(&self) -> usize {
        match self {
            Chunk::PayloadData(d) => d.marshal_size(),
            Chunk::Init(init) => init.marshal_size(),
            Chunk::SelectiveAck(sack) => sack.marshal_size(),
            Chunk::Heartbeat { info, .. } => info.len(),
            Chunk::CookieEcho(cookie) => cookie.len(),
            Chunk::Reconfig(params) => params_size(params),
            _ => 0,
        }
    }
}

impl MarshalSize for Chunk {
    fn marshal_size(&self) -> usize {
        pad4(CHUNK_HEADER_SIZE + self.value_size())
    }
}

impl Marshal for Chunk {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrBufferShort);
        }
        let header = ChunkHeader {
            typ: self.chunk_type(),
            flags: self.flags(),
            value_length: self.value_size() as u16,
        };
        header.marshal_to(buf)?;

        let value = &mut buf[CHUNK_HEADER_SIZE..];
        let n = match self {
            Chunk::PayloadData(d) => d.marshal_to(value)?,
            Chunk::Init(init) => init.marshal_to(value)?,
            Chunk::SelectiveAck(sack) => sack.marshal_to(value)?,
            Chunk::Heartbeat { info: bytes, .. } | Chunk::CookieEcho(bytes) => {
                value[..bytes.len()].copy_from_slice(bytes);
                bytes.len()
            }
            Chunk::Reconfig(params) => marshal_params(params, value)?,
            _ => 0,
        };
        value[n..size - CHUNK_HEADER_SIZE].fill(0);
        Ok(size)
    }
}

impl Unmarshal for Chunk {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = ChunkHeader::unmarshal(buf)?;
        let mut value = buf.copy_to_bytes(header.value_length());
        let length = CHUNK_HEADER_SIZE + header.value_length();
        let padding = (pad4(length) - length).min(buf.remaining());
        buf.advance(padding);

        Ok(match header.typ {
            CT_PAYLOAD_DATA => Chunk::PayloadData(ChunkPayloadData::unmarshal_value(
                header.flags,
                &mut value,
            )?),
            CT_INIT => Chunk::Init(ChunkInit::unmarshal_value(false, &mut value)?),
            CT_INIT_ACK => Chunk::Init(ChunkInit::unmarshal_value(true, &mut value)?),
            CT_SACK => Chunk::SelectiveAck(ChunkSelectiveAck::unmarshal(&mut value)?),
            CT_HEARTBEAT => Chunk::Heartbeat {
                is_ack: false,
                info: value,
            },
            CT_HEARTBEAT_ACK => Chunk::Heartbeat {
                is_ack: true,
                info: value,
            },
            CT_COOKIE_ECHO => Chunk::CookieEcho(value),
            CT_COOKIE_ACK => Chunk::CookieAck,
            CT_RECONFIG => Chunk::Reconfig(unmarshal_params(&mut value)?),
            CT_ABORT => Chunk::Abort,
            CT_SHUTDOWN => Chunk::Shutdown,
            CT_SHUTDOWN_ACK => Chunk::ShutdownAck,
            CT_ERROR => Chunk::Error,
            _ => Chunk::Unknown(header),
        })
    }
}
