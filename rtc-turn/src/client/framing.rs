#[cfg(test)]
mod framing_test;

use crate::proto::chandata::ChannelData;
use shared::error::{Error, Result};
use stun::message::MESSAGE_HEADER_SIZE;

/// Reassembles STUN messages and ChannelData messages from the TURN control
/// stream. On TCP both are sent back to back without an outer length prefix:
/// a STUN message is 20 bytes plus its header length, a ChannelData message is
/// 4 bytes plus its length rounded up to a multiple of 4.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// next_packet returns the next complete message, `Ok(None)` while more bytes
    /// are needed. A leading byte that starts neither message kind poisons the
    /// stream; the buffer is dropped and an error returned.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };

        let frame_len = match first {
            0x00..=0x3F => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                MESSAGE_HEADER_SIZE + u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize
            }
            0x40..=0x7F => match ChannelData::framed_len(&self.buffer) {
                Some(l) => l,
                None => return Ok(None),
            },
            _ => {
                self.buffer.clear();
                return Err(Error::ErrNonStunmessage);
            }
        };

        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let rest = self.buffer.split_off(frame_len);
        Ok(Some(std::mem::replace(&mut self.buffer, rest)))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
