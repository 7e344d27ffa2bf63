use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use bytes::BytesMut;
use std::fmt;

/// ReliabilityType is the partial reliability policy a stream was opened with.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum ReliabilityType {
    /// ReliabilityTypeReliable is used for reliable transmission
    #[default]
    Reliable = 0,
    /// ReliabilityTypeRexmit is used for partial reliability by retransmission count
    Rexmit = 1,
    /// ReliabilityTypeTimed is used for partial reliability by retransmission duration
    Timed = 2,
}

impl fmt::Display for ReliabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReliabilityType::Reliable => "Reliable",
            ReliabilityType::Rexmit => "Rexmit",
            ReliabilityType::Timed => "Timed",
        };
        write!(f, "{s}")
    }
}

/// How a stream wants its messages delivered.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamReliability {
    pub unordered: bool,
    pub reliability_type: ReliabilityType,
    pub reliability_value: u32,
}

/// A message reassembled from one or more DATA chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub stream_id: u16,
    pub ppi: PayloadProtocolIdentifier,
    pub payload: BytesMut,
}

/// Per-stream bookkeeping: the outbound sequence number and the inbound fragment
/// accumulator.
#[derive(Debug, Default)]
pub(crate) struct StreamMeta {
    pub(crate) next_ssn: u16,
    pub(crate) reliability: StreamReliability,
    accumulator: Option<(PayloadProtocolIdentifier, BytesMut)>,
}

impl StreamMeta {
    pub(crate) fn next_sequence_number(&mut self) -> u16 {
        let ssn = self.next_ssn;
        self.next_ssn = self.next_ssn.wrapping_add(1);
        ssn
    }

    /// Feeds one delivered chunk and returns the message it completes, if any.
    ///
    /// A beginning fragment discards whatever was accumulated before it.
    pub(crate) fn reassemble(&mut self, chunk: ChunkPayloadData) -> Option<StreamMessage> {
        let stream_id = chunk.stream_identifier;
        if chunk.beginning_fragment && chunk.ending_fragment {
            self.accumulator = None;
            return Some(StreamMessage {
                stream_id,
                ppi: chunk.payload_type,
                payload: BytesMut::from(&chunk.user_data[..]),
            });
        }

        if chunk.beginning_fragment {
            self.accumulator = Some((chunk.payload_type, BytesMut::from(&chunk.user_data[..])));
            return None;
        }

        let (_, buf) = self.accumulator.as_mut()?;
        buf.extend_from_slice(&chunk.user_data);
        if chunk.ending_fragment {
            let (ppi, payload) = self.accumulator.take()?;
            return Some(StreamMessage {
                stream_id,
                ppi,
                payload,
            });
        }
        None
    }
}
