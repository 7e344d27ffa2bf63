
use crate::message::{message_channel_open::*, *};
use bytes::BytesMut;
use log::{debug, trace};
use sctp::{PayloadProtocolIdentifier, StreamMessage, StreamReliability};
use shared::error::{Error, Result};
use shared::marshal::*;
use std::collections::{BTreeMap, VecDeque};

/// DataChannelConfig is used to configure the data channel.
#[derive(Eq, PartialEq, Default, Clone, Debug)]
pub struct DataChannelConfig {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: String,
    pub protocol: String,
}

impl DataChannelConfig {
    /// Picks the channel type from the W3C style ordered/max-retransmits/max-lifetime triple.
    /// A retransmit limit wins over a lifetime when both are given.
    pub fn new(
        label: &str,
        ordered: bool,
        max_retransmits: Option<u16>,
        max_packet_life_time: Option<u16>,
    ) -> Self {
        let (channel_type, reliability_parameter) = match (max_retransmits, max_packet_life_time) {
            (None, None) if ordered => (ChannelType::Reliable, 0),
            (None, None) => (ChannelType::ReliableUnordered, 0),
            (Some(n), _) if ordered => (ChannelType::PartialReliableRexmit, n as u32),
            (Some(n), _) => (ChannelType::PartialReliableRexmitUnordered, n as u32),
            (None, Some(ms)) if ordered => (ChannelType::PartialReliableTimed, ms as u32),
            (None, Some(ms)) => (ChannelType::PartialReliableTimedUnordered, ms as u32),
        };

        Self {
            channel_type,
            priority: CHANNEL_PRIORITY_NORMAL,
            reliability_parameter,
            label: label.to_owned(),
            protocol: String::new(),
        }
    }
}

/// Where a channel is in the OPEN/ACK exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// We sent DATA_CHANNEL_OPEN and wait for the peer's ACK.
    WaitingForAck,
    /// Both sides know the channel; user data may flow.
    Assigned,
}

/// DataChannelMessage is used to data sent over SCTP
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataChannelMessage {
    pub stream_id: u16,
    pub ppi: PayloadProtocolIdentifier,
    pub payload: BytesMut,
}

impl DataChannelMessage {
    /// Builds a user message, substituting the empty PPIs and a single zero byte for an
    /// empty payload since SCTP can't carry empty user messages.
    pub fn new(stream_id: u16, is_string: bool, data: &[u8]) -> Self {
        let ppi = match (is_string, data.is_empty()) {
            (false, true) => PayloadProtocolIdentifier::BinaryEmpty,
            (false, false) => PayloadProtocolIdentifier::Binary,
            (true, true) => PayloadProtocolIdentifier::StringEmpty,
            (true, false) => PayloadProtocolIdentifier::String,
        };
        let payload = if data.is_empty() {
            BytesMut::from(&[0][..])
        } else {
            BytesMut::from(data)
        };
        Self {
            stream_id,
            ppi,
            payload,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self.ppi,
            PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::StringEmpty
        )
    }
}

impl From<StreamMessage> for DataChannelMessage {
    fn from(m: StreamMessage) -> Self {
        Self {
            stream_id: m.stream_id,
            ppi: m.ppi,
            payload: m.payload,
        }
    }
}

/// Notifications about the channel lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    /// The peer opened a channel. Answer it with [`DataChannels::acknowledge`] unless the
    /// ACK is meant to be withheld.
    Open {
        stream_id: u16,
        label: String,
        protocol: String,
    },
    /// The peer acknowledged a channel we opened.
    Ack { stream_id: u16 },
    /// The channel's stream was reset.
    Closed { stream_id: u16 },
}

/// DataChannel represents a data channel
#[derive(Debug, Clone)]
pub struct DataChannel {
    stream_id: u16,
    config: DataChannelConfig,
    state: ChannelState,
}

impl DataChannel {
    /// StreamIdentifier returns the Stream identifier associated to the stream.
    pub fn stream_identifier(&self) -> u16 {
        self.stream_id
    }

    pub fn config(&self) -> &DataChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn reliability(&self) -> StreamReliability {
        self.config
            .channel_type
            .reliability(self.config.reliability_parameter)
    }
}

/// The data channels of one SCTP association.
///
/// Outbound ids follow the DTLS role: the DTLS client takes even stream ids and the server
/// odd ones, so both sides can open channels without colliding.
#[derive(Debug)]
pub struct DataChannels {
    is_dtls_client: bool,
    max_streams: u16,
    channels: BTreeMap<u16, DataChannel>,

    read_outs: VecDeque<DataChannelMessage>,
    write_outs: VecDeque<DataChannelMessage>,
    events: VecDeque<DataChannelEvent>,

    // stats
    messages_sent: usize,
    messages_received: usize,
    bytes_sent: usize,
    bytes_received: usize,
}

impl DataChannels {
    pub fn new(is_dtls_client: bool, max_streams: u16) -> Self {
        Self {
            is_dtls_client,
            max_streams,
            channels: BTreeMap::new(),
            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            events: VecDeque::new(),
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Caps outbound ids at the stream count agreed in the SCTP handshake.
    pub fn set_max_streams(&mut self, max_streams: u16) {
        self.max_streams = max_streams;
    }

    /// The lowest free stream id of our parity.
    pub fn next_stream_id(&self) -> Result<u16> {
        let first = if self.is_dtls_client { 0 } else { 1 };
        (first..self.max_streams)
            .step_by(2)
            .find(|id| !self.channels.contains_key(id))
            .ok_or(Error::ErrMaxDataChannelID)
    }

    /// Opens a channel on a fresh stream of our parity and queues DATA_CHANNEL_OPEN.
    pub fn open(&mut self, config: DataChannelConfig) -> Result<u16> {
        let stream_id = self.next_stream_id()?;
        self.open_with_id(stream_id, config)?;
        Ok(stream_id)
    }

    /// Opens a channel on `stream_id` and queues DATA_CHANNEL_OPEN.
    pub fn open_with_id(&mut self, stream_id: u16, config: DataChannelConfig) -> Result<()> {
        if stream_id >= self.max_streams {
            return Err(Error::ErrStreamIdOutOfRange(stream_id));
        }
        if self.channels.contains_key(&stream_id) {
            return Err(Error::ErrDataChannelExists(stream_id));
        }

        let raw = Message::DataChannelOpen(DataChannelOpen {
            channel_type: config.channel_type,
            priority: config.priority,
            reliability_parameter: config.reliability_parameter,
            label: config.label.bytes().collect(),
            protocol: config.protocol.bytes().collect(),
        })
        .marshal()?;

        debug!("open data channel {:?} on stream {stream_id}", config.label);
        self.channels.insert(
            stream_id,
            DataChannel {
                stream_id,
                config,
                state: ChannelState::WaitingForAck,
            },
        );
        self.write_outs.push_back(DataChannelMessage {
            stream_id,
            ppi: PayloadProtocolIdentifier::Dcep,
            payload: BytesMut::from(&raw[..]),
        });
        Ok(())
    }

    /// Queues DATA_CHANNEL_ACK for a channel the peer opened.
    pub fn acknowledge(&mut self, stream_id: u16) -> Result<()> {
        if !self.channels.contains_key(&stream_id) {
            return Err(Error::ErrStreamNotAssigned(stream_id));
        }
        let raw = Message::DataChannelAck.marshal()?;
        self.write_outs.push_back(DataChannelMessage {
            stream_id,
            ppi: PayloadProtocolIdentifier::Dcep,
            payload: BytesMut::from(&raw[..]),
        });
        Ok(())
    }

    /// User data may only go out on an assigned channel. DCEP itself is never gated.
    pub fn check_send(&self, stream_id: u16, ppi: PayloadProtocolIdentifier) -> Result<()> {
        if ppi == PayloadProtocolIdentifier::Dcep {
            return Ok(());
        }
        match self.channels.get(&stream_id) {
            Some(channel) if channel.state == ChannelState::Assigned => Ok(()),
            _ => Err(Error::ErrStreamNotAssigned(stream_id)),
        }
    }

    /// Drops the channels whose streams were reset and reports each one.
    pub fn streams_reset(&mut self, stream_ids: &[u16]) {
        for &stream_id in stream_ids {
            if self.channels.remove(&stream_id).is_some() {
                debug!("data channel on stream {stream_id} closed");
                self.events.push_back(DataChannelEvent::Closed { stream_id });
            }
        }
    }

    pub fn get(&self, stream_id: u16) -> Option<&DataChannel> {
        self.channels.get(&stream_id)
    }

    pub fn stream_ids(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    /// MessagesSent returns the number of messages sent
    pub fn messages_sent(&self) -> usize {
        self.messages_sent
    }

    /// MessagesReceived returns the number of messages received
    pub fn messages_received(&self) -> usize {
        self.messages_received
    }

    /// BytesSent returns the number of bytes sent
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// BytesReceived returns the number of bytes received
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    fn handle_dcep(&mut self, stream_id: u16, payload: &[u8]) -> Result<()> {
        let mut buf = payload;
        match Message::unmarshal(&mut buf)? {
            Message::DataChannelOpen(open) => {
                if self.channels.contains_key(&stream_id) {
                    debug!("ignore DATA_CHANNEL_OPEN for known stream {stream_id}");
                    return Ok(());
                }
                let label = String::from_utf8(open.label)?;
                let protocol = String::from_utf8(open.protocol)?;
                debug!("peer opened data channel {label:?} on stream {stream_id}");
                self.channels.insert(
                    stream_id,
                    DataChannel {
                        stream_id,
                        config: DataChannelConfig {
                            channel_type: open.channel_type,
                            priority: open.priority,
                            reliability_parameter: open.reliability_parameter,
                            label: label.clone(),
                            protocol: protocol.clone(),
                        },
                        state: ChannelState::Assigned,
                    },
                );
                self.events.push_back(DataChannelEvent::Open {
                    stream_id,
                    label,
                    protocol,
                });
            }
            Message::DataChannelAck => match self.channels.get_mut(&stream_id) {
                Some(channel) if channel.state == ChannelState::WaitingForAck => {
                    debug!("data channel on stream {stream_id} acknowledged");
                    channel.state = ChannelState::Assigned;
                    self.events.push_back(DataChannelEvent::Ack { stream_id });
                }
                _ => trace!("ignore DATA_CHANNEL_ACK on stream {stream_id}"),
            },
        }
        Ok(())
    }
}

impl sansio::Protocol<DataChannelMessage, DataChannelMessage, ()> for DataChannels {
    type Rout = DataChannelMessage;
    type Wout = DataChannelMessage;
    type Eout = DataChannelEvent;
    type Error = Error;
    type Time = ();

    /// Takes a reassembled SCTP message. DCEP is consumed here, user data is passed on with
    /// the empty PPIs turned back into empty payloads.
    fn handle_read(&mut self, mut msg: DataChannelMessage) -> Result<()> {
        self.messages_received += 1;
        self.bytes_received += msg.payload.len();

        match msg.ppi {
            PayloadProtocolIdentifier::Dcep => self.handle_dcep(msg.stream_id, &msg.payload),
            PayloadProtocolIdentifier::StringEmpty | PayloadProtocolIdentifier::BinaryEmpty => {
                msg.ppi = if msg.ppi == PayloadProtocolIdentifier::StringEmpty {
                    PayloadProtocolIdentifier::String
                } else {
                    PayloadProtocolIdentifier::Binary
                };
                msg.payload.clear();
                self.read_outs.push_back(msg);
                Ok(())
            }
            PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::Binary => {
                self.read_outs.push_back(msg);
                Ok(())
            }
            PayloadProtocolIdentifier::Unknown => {
                trace!("drop message with unknown PPI on stream {}", msg.stream_id);
                Ok(())
            }
        }
    }

    fn poll_read(&mut self) -> Option<DataChannelMessage> {
        self.read_outs.pop_front()
    }

    /// Queues a user message after checking the channel is assigned.
    fn handle_write(&mut self, msg: DataChannelMessage) -> Result<()> {
        self.check_send(msg.stream_id, msg.ppi)?;
        self.messages_sent += 1;
        self.bytes_sent += msg.payload.len();
        self.write_outs.push_back(msg);
        Ok(())
    }

    /// Returns messages to hand to the association
    fn poll_write(&mut self) -> Option<DataChannelMessage> {
        self.write_outs.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<DataChannelEvent> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, _now: ()) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<()> {
        None
    }

    /// Forgets every channel. Closing them on the wire is the association's stream reset.
    fn close(&mut self) -> Result<()> {
        self.channels.clear();
        self.read_outs.clear();
        self.write_outs.clear();
        Ok(())
    }
}
