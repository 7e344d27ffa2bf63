use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::*;

pub(crate) const OUTGOING_RESET_REQUEST_HEADER_SIZE: usize = 12;
pub(crate) const INCOMING_RESET_REQUEST_HEADER_SIZE: usize = 4;

///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Parameter Type = 13       | Parameter Length = 16 + 2 * N |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Re-configuration Request Sequence Number            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Re-configuration Response Sequence Number           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                Sender's Last Assigned TSN                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Stream Number 1 (optional)   |    Stream Number 2 (optional) |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
///
/// An empty stream list resets every stream.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ParamOutgoingResetRequest {
    pub reconfig_request_sequence_number: u32,
    pub reconfig_response_sequence_number: u32,
    pub sender_last_tsn: u32,
    pub stream_identifiers: Vec<u16>,
}

impl MarshalSize for ParamOutgoingResetRequest {
    fn marshal_size(&self) -> usize {
        OUTGOING_RESET_REQUEST_HEADER_SIZE + self.stream_identifiers.len() * 2
    }
}

impl Marshal for ParamOutgoingResetRequest {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u32(self.reconfig_request_sequence_number);
        buf.put_u32(self.reconfig_response_sequence_number);
        buf.put_u32(self.sender_last_tsn);
        for sid in &self.stream_identifiers {
            buf.put_u16(*sid);
        }
        Ok(self.marshal_size())
    }
}

impl Unmarshal for ParamOutgoingResetRequest {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < OUTGOING_RESET_REQUEST_HEADER_SIZE {
            return Err(Error::ErrSsnResetRequestParamTooShort);
        }
        let reconfig_request_sequence_number = buf.get_u32();
        let reconfig_response_sequence_number = buf.get_u32();
        let sender_last_tsn = buf.get_u32();
        let stream_identifiers = read_stream_identifiers(buf);

        Ok(ParamOutgoingResetRequest {
            reconfig_request_sequence_number,
            reconfig_response_sequence_number,
            sender_last_tsn,
            stream_identifiers,
        })
    }
}

///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Parameter Type = 14       |  Parameter Length = 8 + 2 * N |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Re-configuration Request Sequence Number             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Stream Number 1 (optional)   |    Stream Number 2 (optional) |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ParamIncomingResetRequest {
    pub reconfig_request_sequence_number: u32,
    pub stream_identifiers: Vec<u16>,
}

impl MarshalSize for ParamIncomingResetRequest {
    fn marshal_size(&self) -> usize {
        INCOMING_RESET_REQUEST_HEADER_SIZE + self.stream_identifiers.len() * 2
    }
}

impl Marshal for ParamIncomingResetRequest {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u32(self.reconfig_request_sequence_number);
        for sid in &self.stream_identifiers {
            buf.put_u16(*sid);
        }
        Ok(self.marshal_size())
    }
}

impl Unmarshal for ParamIncomingResetRequest {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < INCOMING_RESET_REQUEST_HEADER_SIZE {
            return Err(Error::ErrSsnResetRequestParamTooShort);
        }
        let reconfig_request_sequence_number = buf.get_u32();
        let stream_identifiers = read_stream_identifiers(buf);

        Ok(ParamIncomingResetRequest {
            reconfig_request_sequence_number,
            stream_identifiers,
        })
    }
}

fn read_stream_identifiers<B: Buf>(buf: &mut B) -> Vec<u16> {
    let mut stream_identifiers = Vec::with_capacity(buf.remaining() / 2);
    while buf.remaining() >= 2 {
        stream_identifiers.push(buf.get_u16());
    }
    stream_identifiers
}
