use std::time::Duration;

/// Port both sides use for data channels unless negotiated otherwise.
pub(crate) const DEFAULT_SCTP_PORT: u16 = 5000;
/// initial MTU for outgoing packets (to DTLS)
pub(crate) const DEFAULT_MTU: usize = 1400;
/// Receive window we advertise and cap the out-of-order hold buffer at.
pub(crate) const DEFAULT_MAX_RECEIVE_WINDOW: usize = 100_000;
/// What Chrome and Firefox support.
pub(crate) const DEFAULT_MAX_STREAMS: u16 = 1024;

/// Largest user data carried by one DATA chunk.
pub(crate) const MAX_FRAGMENT_SIZE: usize = 1232;

pub(crate) const RTO_INITIAL: u64 = 3000;
pub(crate) const RTO_MIN: u64 = 1000;
pub(crate) const RTO_MAX: u64 = 6000;
pub(crate) const RTO_ALPHA: f64 = 0.125;
pub(crate) const RTO_BETA: f64 = 0.25;

/// Missing reports after which a chunk is fast-retransmitted.
pub(crate) const FAST_RETRANSMIT_GAP: u8 = 3;

pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Quiet ticks after which a HEARTBEAT goes out.
pub(crate) const HEARTBEAT_TICKS: u32 = 40;
/// Quiet ticks after which the association is declared dead.
pub(crate) const DEAD_TICKS: u32 = 80;

/// Upper bound on the gap block bytes one SACK carries.
pub(crate) const MAX_SACK_GAP_BYTES: usize = 500;

/// AssociationConfig collects the arguments to association construction into
/// a single structure
#[derive(Debug, Clone)]
pub struct AssociationConfig {
    mtu: usize,
    source_port: u16,
    destination_port: u16,
    max_receive_window: usize,
    max_streams: u16,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        AssociationConfig {
            mtu: DEFAULT_MTU,
            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            max_receive_window: DEFAULT_MAX_RECEIVE_WINDOW,
            max_streams: DEFAULT_MAX_STREAMS,
        }
    }
}

impl AssociationConfig {
    pub fn with_mtu(mut self, value: usize) -> Self {
        self.mtu = value;
        self
    }

    pub fn with_source_port(mut self, value: u16) -> Self {
        self.source_port = value;
        self
    }

    pub fn with_destination_port(mut self, value: u16) -> Self {
        self.destination_port = value;
        self
    }

    pub fn with_max_receive_window(mut self, value: usize) -> Self {
        self.max_receive_window = value;
        self
    }

    pub fn with_max_streams(mut self, value: u16) -> Self {
        self.max_streams = value;
        self
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn max_receive_window(&self) -> usize {
        self.max_receive_window
    }

    pub fn max_streams(&self) -> u16 {
        self.max_streams
    }
}
