use datachannel::DataChannelConfig;
use shared::SlotHandle;
use std::collections::VecDeque;

/// What `Handler::on_data` asks of the association.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    /// Stop delivering until `Endpoint::resume`. Incoming data is still acknowledged
    /// and held.
    Pause,
}

/// A request made from inside a callback, applied once the callback returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        session: SlotHandle,
        stream_id: u16,
        is_string: bool,
        data: Vec<u8>,
    },
    OpenChannel {
        session: SlotHandle,
        config: DataChannelConfig,
    },
    CloseChannels {
        session: SlotHandle,
        stream_ids: Vec<u16>,
    },
    Pause(SlotHandle),
    Resume(SlotHandle),
    /// Runs on the next `handle_timeout`.
    Disconnect(SlotHandle),
}

/// Queue handed to every callback.
#[derive(Debug, Default)]
pub struct Commands {
    queue: VecDeque<Command>,
}

impl Commands {
    pub fn send(&mut self, session: SlotHandle, stream_id: u16, is_string: bool, data: &[u8]) {
        self.queue.push_back(Command::Send {
            session,
            stream_id,
            is_string,
            data: data.to_vec(),
        });
    }

    pub fn open_channel(&mut self, session: SlotHandle, config: DataChannelConfig) {
        self.queue
            .push_back(Command::OpenChannel { session, config });
    }

    pub fn close_channels(&mut self, session: SlotHandle, stream_ids: &[u16]) {
        self.queue.push_back(Command::CloseChannels {
            session,
            stream_ids: stream_ids.to_vec(),
        });
    }

    pub fn pause(&mut self, session: SlotHandle) {
        self.queue.push_back(Command::Pause(session));
    }

    pub fn resume(&mut self, session: SlotHandle) {
        self.queue.push_back(Command::Resume(session));
    }

    pub fn disconnect(&mut self, session: SlotHandle) {
        self.queue.push_back(Command::Disconnect(session));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop(&mut self) -> Option<Command> {
        self.queue.pop_front()
    }
}

/// Application callbacks, run synchronously while the endpoint processes input.
///
/// The endpoint is borrowed for the duration of a callback; anything the application
/// wants done in reaction goes through `cmds`.
pub trait Handler {
    /// A session finished its SCTP handshake, or went away (`connected == false`).
    fn on_connect(&mut self, _cmds: &mut Commands, _session: SlotHandle, _connected: bool) {}

    /// A complete message arrived on a data channel.
    fn on_data(
        &mut self,
        _cmds: &mut Commands,
        _session: SlotHandle,
        _stream_id: u16,
        _is_string: bool,
        _data: &[u8],
    ) -> Flow {
        Flow::Continue
    }

    /// Data held back for lack of credit has been sent.
    fn on_send_ok(&mut self, _cmds: &mut Commands, _session: SlotHandle) {}

    /// The peer opened a channel. Returning `true` withholds the ACK.
    fn on_data_channel(
        &mut self,
        _cmds: &mut Commands,
        _session: SlotHandle,
        _stream_id: u16,
        _label: &str,
        _protocol: &str,
    ) -> bool {
        false
    }

    fn on_data_channel_ack(&mut self, _cmds: &mut Commands, _session: SlotHandle, _stream_id: u16) {}

    fn on_data_channel_closed(
        &mut self,
        _cmds: &mut Commands,
        _session: SlotHandle,
        _stream_id: u16,
    ) {
    }
}
