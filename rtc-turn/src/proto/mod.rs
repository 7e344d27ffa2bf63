pub mod chandata;
pub mod channum;
pub mod data;
pub mod lifetime;
pub mod peeraddr;
pub mod relayaddr;
pub mod reqtrans;

use std::fmt;

// Protocol is IANA assigned protocol number.
#[derive(PartialEq, Eq, Default, Debug, Clone, Copy, Hash)]
pub struct Protocol(pub u8);

// PROTO_TCP is IANA assigned protocol number for TCP.
pub const PROTO_TCP: Protocol = Protocol(6);
// PROTO_UDP is IANA assigned protocol number for UDP.
pub const PROTO_UDP: Protocol = Protocol(17);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("{}", self.0);
        let s = match *self {
            PROTO_UDP => "UDP",
            PROTO_TCP => "TCP",
            _ => others.as_str(),
        };

        write!(f, "{s}")
    }
}
