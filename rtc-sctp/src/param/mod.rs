
pub mod param_reconfig_response;
pub mod param_reset_request;

use crate::chunk::chunk_type::ChunkType;
use bytes::{Buf, BufMut, Bytes};
use param_reconfig_response::*;
use param_reset_request::*;
use shared::error::{Error, Result};
use shared::marshal::*;
use shared::util::pad4;

pub(crate) const PARAM_HEADER_SIZE: usize = 4;

pub const PT_HEARTBEAT_INFO: u16 = 1;
pub const PT_STATE_COOKIE: u16 = 7;
pub const PT_OUTGOING_RESET_REQUEST: u16 = 13;
pub const PT_INCOMING_RESET_REQUEST: u16 = 14;
pub const PT_RECONFIG_RESPONSE: u16 = 16;
pub const PT_SUPPORTED_EXTENSIONS: u16 = 0x8008;
pub const PT_FORWARD_TSN_SUPPORTED: u16 = 0xC000;

/// A TLV parameter carried by INIT, INIT-ACK and RECONFIG chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    StateCookie(Bytes),
    SupportedExtensions(Vec<ChunkType>),
    ForwardTsnSupported,
    OutgoingResetRequest(ParamOutgoingResetRequest),
    IncomingResetRequest(ParamIncomingResetRequest),
    ReconfigResponse(ParamReconfigResponse),
    Unknown { typ: u16, value: Bytes },
}

impl Param {
    pub fn param_type(&self) -> u16 {
        match self {
            Param::StateCookie(_) => PT_STATE_COOKIE,
            Param::SupportedExtensions(_) => PT_SUPPORTED_EXTENSIONS,
            Param::ForwardTsnSupported => PT_FORWARD_TSN_SUPPORTED,
            Param::OutgoingResetRequest(_) => PT_OUTGOING_RESET_REQUEST,
            Param::IncomingResetRequest(_) => PT_INCOMING_RESET_REQUEST,
            Param::ReconfigResponse(_) => PT_RECONFIG_RESPONSE,
            Param::Unknown { typ, .. } => *typ,
        }
    }

    fn value_size(&self) -> usize {
        match self {
            Param::StateCookie(cookie) => cookie.len(),
            Param::SupportedExtensions(types) => types.len(),
            Param::ForwardTsnSupported => 0,
            Param::OutgoingResetRequest(p) => p.marshal_size(),
            Param::IncomingResetRequest(p) => p.marshal_size(),
            Param::ReconfigResponse(p) => p.marshal_size(),
            Param::Unknown { value, .. } => value.len(),
        }
    }
}

impl MarshalSize for Param {
    fn marshal_size(&self) -> usize {
        pad4(PARAM_HEADER_SIZE + self.value_size())
    }
}

impl Marshal for Param {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u16(self.param_type());
        buf.put_u16((PARAM_HEADER_SIZE + self.value_size()) as u16);

        let n = match self {
            Param::StateCookie(cookie) => {
                buf[..cookie.len()].copy_from_slice(cookie);
                cookie.len()
            }
            Param::SupportedExtensions(types) => {
                for (i, t) in types.iter().enumerate() {
                    buf[i] = t.0;
                }
                types.len()
            }
            Param::ForwardTsnSupported => 0,
            Param::OutgoingResetRequest(p) => p.marshal_to(buf)?,
            Param::IncomingResetRequest(p) => p.marshal_to(buf)?,
            Param::ReconfigResponse(p) => p.marshal_to(buf)?,
            Param::Unknown { value, .. } => {
                buf[..value.len()].copy_from_slice(value);
                value.len()
            }
        };
        buf[n..size - PARAM_HEADER_SIZE].fill(0);
        Ok(size)
    }
}

impl Unmarshal for Param {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < PARAM_HEADER_SIZE {
            return Err(Error::ErrParamHeaderTooShort);
        }
        let typ = buf.get_u16();
        let len = buf.get_u16() as usize;
        if len < PARAM_HEADER_SIZE {
            return Err(Error::ErrParamHeaderTooShort);
        }
        let value_len = len - PARAM_HEADER_SIZE;
        if buf.remaining() < value_len {
            return Err(Error::ErrParamHeaderSelfReportedLengthLonger);
        }
        let mut value = buf.copy_to_bytes(value_len);
        let padding = (pad4(len) - len).min(buf.remaining());
        buf.advance(padding);

        Ok(match typ {
            PT_STATE_COOKIE => Param::StateCookie(value),
            PT_SUPPORTED_EXTENSIONS => {
                Param::SupportedExtensions(value.iter().map(|t| ChunkType(*t)).collect())
            }
            PT_FORWARD_TSN_SUPPORTED => Param::ForwardTsnSupported,
            PT_OUTGOING_RESET_REQUEST => {
                Param::OutgoingResetRequest(ParamOutgoingResetRequest::unmarshal(&mut value)?)
            }
            PT_INCOMING_RESET_REQUEST => {
                Param::IncomingResetRequest(ParamIncomingResetRequest::unmarshal(&mut value)?)
            }
            PT_RECONFIG_RESPONSE => {
                Param::ReconfigResponse(ParamReconfigResponse::unmarshal(&mut value)?)
            }
            _ => Param::Unknown { typ, value },
        })
    }
}

/// Parses every parameter left in `buf`.
pub(crate) fn unmarshal_params<B: Buf>(buf: &mut B) -> Result<Vec<Param>> {
    let mut params = vec![];
    while buf.remaining() >= PARAM_HEADER_SIZE {
        params.push(Param::unmarshal(buf)?);
    }
    Ok(params)
}

pub(crate) fn params_size(params: &[Param]) -> usize {
    params.iter().map(|p| p.marshal_size()).sum()
}

pub(crate) fn marshal_params(params: &[Param], buf: &mut [u8]) -> Result<usize> {
    let mut offset = 0;
    for p in params {
        offset += p.marshal_to(&mut buf[offset..])?;
    }
    Ok(offset)
}
