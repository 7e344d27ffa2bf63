
pub mod message_channel_open;

use bytes::{Buf, BufMut};
use message_channel_open::*;
use shared::error::{Error, Result};
use shared::marshal::*;

const MESSAGE_TYPE_ACK: u8 = 0x02;
const MESSAGE_TYPE_OPEN: u8 = 0x03;

/// A DataChannel Establishment Protocol message, carried on PPI 50.
///
/// Every message starts with a one-byte type. An ACK is that byte alone.
///
/// ```plain
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |  Message Type |  0x02 ACK, 0x03 OPEN
/// +-+-+-+-+-+-+-+-+
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Message {
    DataChannelAck,
    DataChannelOpen(DataChannelOpen),
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Self::DataChannelAck => MESSAGE_TYPE_ACK,
            Self::DataChannelOpen(_) => MESSAGE_TYPE_OPEN,
        }
    }
}

impl MarshalSize for Message {
    fn marshal_size(&self) -> usize {
        1 + match self {
            Self::DataChannelAck => 0,
            Self::DataChannelOpen(open) => open.marshal_size(),
        }
    }
}

impl Marshal for Message {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: size,
                actual: buf.remaining_mut(),
            });
        }

        buf.put_u8(self.type_byte());
        if let Self::DataChannelOpen(open) = self {
            open.marshal_to(buf)?;
        }
        Ok(size)
    }
}

impl Unmarshal for Message {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if !buf.has_remaining() {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: 1,
                actual: 0,
            });
        }

        match buf.get_u8() {
            MESSAGE_TYPE_ACK => Ok(Self::DataChannelAck),
            MESSAGE_TYPE_OPEN => Ok(Self::DataChannelOpen(DataChannelOpen::unmarshal(buf)?)),
            typ => Err(Error::InvalidMessageType(typ)),
        }
    }
}
