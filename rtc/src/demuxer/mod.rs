
use shared::util::{match_dtls, match_stun};

/// What a datagram from a peer carries, judged by its first byte as in RFC 7983.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DatagramKind {
    Stun,
    Dtls,
    Unknown,
}

/// STUN is [0..3] and DTLS [20..63]. TURN ChannelData never arrives from a peer
/// directly, it is unwrapped by the TURN client first.
pub(crate) fn demux(buf: &[u8]) -> DatagramKind {
    if match_stun(buf) {
        DatagramKind::Stun
    } else if match_dtls(buf) {
        DatagramKind::Dtls
    } else {
        DatagramKind::Unknown
    }
}
