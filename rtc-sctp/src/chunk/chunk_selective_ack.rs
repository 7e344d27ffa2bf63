use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::*;
use std::fmt;

pub(crate) const SELECTIVE_ACK_HEADER_SIZE: usize = 12;

///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 3    |Chunk  Flags   |      Chunk Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Cumulative TSN Ack                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Advertised Receiver Window Credit (a_rwnd)           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Number of Gap Ack Blocks = N  |  Number of Duplicate TSNs = X |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Gap Ack Block #1 Start       |   Gap Ack Block #1 End        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// /                                                               /
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Duplicate TSN 1                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GapAckBlock {
    /// Offset of the first acknowledged TSN from the cumulative ack.
    pub start: u16,
    /// Offset of the last acknowledged TSN from the cumulative ack.
    pub end: u16,
}

impl fmt::Display for GapAckBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ChunkSelectiveAck {
    pub cumulative_tsn_ack: u32,
    pub advertised_receiver_window_credit: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsn: Vec<u32>,
}

impl ChunkSelectiveAck {
    /// Gap blocks as absolute, inclusive TSN ranges.
    pub fn gap_ranges(&self) -> Vec<(u32, u32)> {
        self.gap_ack_blocks
            .iter()
            .map(|b| {
                (
                    self.cumulative_tsn_ack.wrapping_add(b.start as u32),
                    self.cumulative_tsn_ack.wrapping_add(b.end as u32),
                )
            })
            .collect()
    }
}

impl MarshalSize for ChunkSelectiveAck {
    fn marshal_size(&self) -> usize {
        SELECTIVE_ACK_HEADER_SIZE + self.gap_ack_blocks.len() * 4 + self.duplicate_tsn.len() * 4
    }
}

impl Marshal for ChunkSelectiveAck {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }
        buf.put_u32(self.cumulative_tsn_ack);
        buf.put_u32(self.advertised_receiver_window_credit);
        buf.put_u16(self.gap_ack_blocks.len() as u16);
        buf.put_u16(self.duplicate_tsn.len() as u16);
        for g in &self.gap_ack_blocks {
            buf.put_u16(g.start);
            buf.put_u16(g.end);
        }
        for t in &self.duplicate_tsn {
            buf.put_u32(*t);
        }
        Ok(self.marshal_size())
    }
}

impl Unmarshal for ChunkSelectiveAck {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < SELECTIVE_ACK_HEADER_SIZE {
            return Err(Error::ErrSackSizeNotLargeEnoughInfo);
        }

        let cumulative_tsn_ack = buf.get_u32();
        let advertised_receiver_window_credit = buf.get_u32();
        let num_gaps = buf.get_u16() as usize;
        let num_dups = buf.get_u16() as usize;

        if buf.remaining() < num_gaps * 4 + num_dups * 4 {
            return Err(Error::ErrSackSizeNotLargeEnoughInfo);
        }

        let gap_ack_blocks = (0..num_gaps)
            .map(|_| GapAckBlock {
                start: buf.get_u16(),
                end: buf.get_u16(),
            })
            .collect();
        let duplicate_tsn = (0..num_dups).map(|_| buf.get_u32()).collect();

        Ok(ChunkSelectiveAck {
            cumulative_tsn_ack,
            advertised_receiver_window_credit,
            gap_ack_blocks,
            duplicate_tsn,
        })
    }
}
