use super::chunk_type::ChunkType;
use crate::param::*;
use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::*;

pub(crate) const INIT_CHUNK_MIN_LENGTH: usize = 16;

///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 1/2  |  Chunk Flags  |      Chunk Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Initiate Tag                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Advertised Receiver Window Credit (a_rwnd)          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Number of Outbound Streams   |  Number of Inbound Streams    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Initial TSN                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// \                                                               \
/// /              Optional/Variable-Length Parameters              /
/// \                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
///
/// INIT and INIT-ACK share this layout; `is_ack` picks the chunk type.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ChunkInit {
    pub is_ack: bool,
    pub initiate_tag: u32,
    pub advertised_receiver_window_credit: u32,
    pub num_outbound_streams: u16,
    pub num_inbound_streams: u16,
    pub initial_tsn: u32,
    pub params: Vec<Param>,
}

impl ChunkInit {
    pub(crate) fn unmarshal_value<B: Buf>(is_ack: bool, buf: &mut B) -> Result<Self> {
        if buf.remaining() < INIT_CHUNK_MIN_LENGTH {
            return Err(Error::ErrChunkValueNotLongEnough);
        }

        let initiate_tag = buf.get_u32();
        let advertised_receiver_window_credit = buf.get_u32();
        let num_outbound_streams = buf.get_u16();
        let num_inbound_streams = buf.get_u16();
        let initial_tsn = buf.get_u32();
        let params = unmarshal_params(buf)?;

        Ok(ChunkInit {
            is_ack,
            initiate_tag,
            advertised_receiver_window_credit,
            num_outbound_streams,
            num_inbound_streams,
            initial_tsn,
            params,
        })
    }

    /// The state cookie an INIT-ACK carries.
    pub fn state_cookie(&self) -> Option<&Bytes> {
        self.params.iter().find_map(|p| match p {
            Param::StateCookie(cookie) => Some(cookie),
            _ => None,
        })
    }

    /// Chunk types the sender announced in its supported-extensions parameter.
    pub fn supported_extensions(&self) -> Vec<ChunkType> {
        self.params
            .iter()
            .filter_map(|p| match p {
                Param::SupportedExtensions(types) => Some(types.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl MarshalSize for ChunkInit {
    fn marshal_size(&self) -> usize {
        INIT_CHUNK_MIN_LENGTH + params_size(&self.params)
    }
}

impl Marshal for ChunkInit {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u32(self.initiate_tag);
        buf.put_u32(self.advertised_receiver_window_credit);
        buf.put_u16(self.num_outbound_streams);
        buf.put_u16(self.num_inbound_streams);
        buf.put_u32(self.initial_tsn);
        let n = marshal_params(&self.params, buf)?;
        Ok(INIT_CHUNK_MIN_LENGTH + n)
    }
}
