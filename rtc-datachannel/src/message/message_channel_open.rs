use super::*;
use sctp::{ReliabilityType, StreamReliability};

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_RELIABLE_UNORDERED: u8 = 0x80;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED: u8 = 0x81;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED: u8 = 0x82;
const CHANNEL_TYPE_LEN: usize = 1;

/// ChannelPriority
pub const CHANNEL_PRIORITY_BELOW_NORMAL: u16 = 128;
pub const CHANNEL_PRIORITY_NORMAL: u16 = 256;
pub const CHANNEL_PRIORITY_HIGH: u16 = 512;
pub const CHANNEL_PRIORITY_EXTRA_HIGH: u16 = 1024;

/// ChannelType determines the reliability of the WebRTC DataChannel
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum ChannelType {
    /// The Data Channel provides a reliable in-order bi-directional communication.
    #[default]
    Reliable,
    /// The Data Channel provides a reliable unordered bi-directional communication.
    ReliableUnordered,
    /// The Data Channel provides a partially-reliable in-order bi-directional communication.
    /// User messages will not be retransmitted more times than specified in the Reliability Parameter.
    PartialReliableRexmit,
    /// The Data Channel provides a partial reliable unordered bi-directional communication.
    /// User messages will not be retransmitted more times than specified in the Reliability Parameter.
    PartialReliableRexmitUnordered,
    /// The Data Channel provides a partial reliable in-order bi-directional communication.
    /// User messages might not be transmitted or retransmitted after
    /// a specified life-time given in milli- seconds in the Reliability Parameter.
    PartialReliableTimed,
    /// The Data Channel provides a partial reliable unordered bi-directional communication.
    /// User messages might not be transmitted or retransmitted after
    /// a specified life-time given in milli- seconds in the Reliability Parameter.
    PartialReliableTimedUnordered,
}

impl ChannelType {
    /// How the SCTP stream carrying a channel of this type delivers and retransmits.
    pub fn reliability(&self, reliability_parameter: u32) -> StreamReliability {
        let (unordered, reliability_type) = match self {
            ChannelType::Reliable => (false, ReliabilityType::Reliable),
            ChannelType::ReliableUnordered => (true, ReliabilityType::Reliable),
            ChannelType::PartialReliableRexmit => (false, ReliabilityType::Rexmit),
            ChannelType::PartialReliableRexmitUnordered => (true, ReliabilityType::Rexmit),
            ChannelType::PartialReliableTimed => (false, ReliabilityType::Timed),
            ChannelType::PartialReliableTimedUnordered => (true, ReliabilityType::Timed),
        };
        StreamReliability {
            unordered,
            reliability_type,
            reliability_value: match reliability_type {
                ReliabilityType::Reliable => 0,
                _ => reliability_parameter,
            },
        }
    }
}

impl From<ChannelType> for u8 {
    fn from(t: ChannelType) -> u8 {
        match t {
            ChannelType::Reliable => CHANNEL_TYPE_RELIABLE,
            ChannelType::ReliableUnordered => CHANNEL_TYPE_RELIABLE_UNORDERED,
            ChannelType::PartialReliableRexmit => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            ChannelType::PartialReliableRexmitUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED
            }
            ChannelType::PartialReliableTimed => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
            ChannelType::PartialReliableTimedUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED
            }
        }
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            CHANNEL_TYPE_RELIABLE => Ok(ChannelType::Reliable),
            CHANNEL_TYPE_RELIABLE_UNORDERED => Ok(ChannelType::ReliableUnordered),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => Ok(ChannelType::PartialReliableRexmit),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED => {
                Ok(ChannelType::PartialReliableRexmitUnordered)
            }
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => Ok(ChannelType::PartialReliableTimed),
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED => {
                Ok(ChannelType::PartialReliableTimedUnordered)
            }
            _ => Err(Error::InvalidChannelType(b)),
        }
    }
}

const CHANNEL_OPEN_HEADER_LEN: usize = 11;

/// The data-part of a data-channel OPEN message without the message type.
///
/// # Memory layout
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | (Message Type)|  Channel Type |            Priority           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Reliability Parameter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Label Length          |       Protocol Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                             Label                             |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                            Protocol                           |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: Vec<u8>,
    pub protocol: Vec<u8>,
}

impl MarshalSize for DataChannelOpen {
    fn marshal_size(&self) -> usize {
        CHANNEL_OPEN_HEADER_LEN + self.label.len() + self.protocol.len()
    }
}

impl Marshal for DataChannelOpen {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let required_len = self.marshal_size();
        if buf.remaining_mut() < required_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: required_len,
                actual: buf.remaining_mut(),
            });
        }

        buf.put_u8(self.channel_type.into());
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_parameter);
        buf.put_u16(self.label.len() as u16);
        buf.put_u16(self.protocol.len() as u16);
        buf.put_slice(self.label.as_slice());
        buf.put_slice(self.protocol.as_slice());
        Ok(required_len)
    }
}

impl Unmarshal for DataChannelOpen {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < CHANNEL_OPEN_HEADER_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_OPEN_HEADER_LEN,
                actual: buf.remaining(),
            });
        }

        let channel_type = ChannelType::try_from(buf.get_u8())?;
        let priority = buf.get_u16();
        let reliability_parameter = buf.get_u32();
        let label_len = buf.get_u16() as usize;
        let protocol_len = buf.get_u16() as usize;

        if buf.remaining() < label_len + protocol_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: label_len + protocol_len,
                actual: buf.remaining(),
            });
        }

        let mut label = vec![0; label_len];
        let mut protocol = vec![0; protocol_len];
        buf.copy_to_slice(&mut label[..]);
        buf.copy_to_slice(&mut protocol[..]);

        Ok(Self {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }
}
