use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::*;
use std::fmt;

pub(crate) const RECONFIG_RESPONSE_SIZE: usize = 8;

/// Result codes of a re-configuration response (RFC 6525 section 4.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ReconfigResult {
    SuccessNop,
    SuccessPerformed,
    #[default]
    Denied,
    ErrorWrongSsn,
    ErrorRequestAlreadyInProgress,
    ErrorBadSequenceNumber,
    InProgress,
    Unknown(u32),
}

impl fmt::Display for ReconfigResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ReconfigResult::SuccessNop => write!(f, "Success - Nothing to do"),
            ReconfigResult::SuccessPerformed => write!(f, "Success - Performed"),
            ReconfigResult::Denied => write!(f, "Denied"),
            ReconfigResult::ErrorWrongSsn => write!(f, "Error - Wrong SSN"),
            ReconfigResult::ErrorRequestAlreadyInProgress => {
                write!(f, "Error - Request already in progress")
            }
            ReconfigResult::ErrorBadSequenceNumber => {
                write!(f, "Error - Bad Sequence Number")
            }
            ReconfigResult::InProgress => write!(f, "In progress"),
            ReconfigResult::Unknown(v) => write!(f, "Unknown ReconfigResult: {v}"),
        }
    }
}

impl From<u32> for ReconfigResult {
    fn from(v: u32) -> Self {
        match v {
            0 => ReconfigResult::SuccessNop,
            1 => ReconfigResult::SuccessPerformed,
            2 => ReconfigResult::Denied,
            3 => ReconfigResult::ErrorWrongSsn,
            4 => ReconfigResult::ErrorRequestAlreadyInProgress,
            5 => ReconfigResult::ErrorBadSequenceNumber,
            6 => ReconfigResult::InProgress,
            _ => ReconfigResult::Unknown(v),
        }
    }
}

impl From<ReconfigResult> for u32 {
    fn from(r: ReconfigResult) -> u32 {
        match r {
            ReconfigResult::SuccessNop => 0,
            ReconfigResult::SuccessPerformed => 1,
            ReconfigResult::Denied => 2,
            ReconfigResult::ErrorWrongSsn => 3,
            ReconfigResult::ErrorRequestAlreadyInProgress => 4,
            ReconfigResult::ErrorBadSequenceNumber => 5,
            ReconfigResult::InProgress => 6,
            ReconfigResult::Unknown(v) => v,
        }
    }
}

///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Parameter Type = 16       |      Parameter Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Re-configuration Response Sequence Number             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Result                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ParamReconfigResponse {
    pub reconfig_response_sequence_number: u32,
    pub result: ReconfigResult,
}

impl MarshalSize for ParamReconfigResponse {
    fn marshal_size(&self) -> usize {
        RECONFIG_RESPONSE_SIZE
    }
}

impl Marshal for ParamReconfigResponse {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < RECONFIG_RESPONSE_SIZE {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u32(self.reconfig_response_sequence_number);
        buf.put_u32(self.result.into());
        Ok(RECONFIG_RESPONSE_SIZE)
    }
}

impl Unmarshal for ParamReconfigResponse {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < RECONFIG_RESPONSE_SIZE {
            return Err(Error::ErrReconfigRespParamTooShort);
        }
        let reconfig_response_sequence_number = buf.get_u32();
        let result = buf.get_u32().into();

        Ok(ParamReconfigResponse {
            reconfig_response_sequence_number,
            result,
        })
    }
}
