use super::chunk_type::*;
use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::*;

pub(crate) const CHUNK_HEADER_SIZE: usize = 4;

///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Chunk Type  | Chunk  Flags  |        Chunk Length           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
///
/// Chunk Length counts the header and the value, never the trailing padding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub typ: ChunkType,
    pub flags: u8,
    pub value_length: u16,
}

impl ChunkHeader {
    pub fn value_length(&self) -> usize {
        self.value_length as usize
    }
}

impl MarshalSize for ChunkHeader {
    fn marshal_size(&self) -> usize {
        CHUNK_HEADER_SIZE
    }
}

impl Marshal for ChunkHeader {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < CHUNK_HEADER_SIZE {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u8(self.typ.0);
        buf.put_u8(self.flags);
        buf.put_u16(self.value_length + CHUNK_HEADER_SIZE as u16);
        Ok(CHUNK_HEADER_SIZE)
    }
}

impl Unmarshal for ChunkHeader {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderTooSmall);
        }

        let typ = ChunkType(buf.get_u8());
        let flags = buf.get_u8();
        let length = buf.get_u16();

        if (length as usize) < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderInvalidLength);
        }
        let value_length = length - CHUNK_HEADER_SIZE as u16;
        if buf.remaining() < value_length as usize {
            return Err(Error::ErrChunkHeaderNotEnoughSpace);
        }

        Ok(ChunkHeader {
            typ,
            flags,
            value_length,
        })
    }
}
