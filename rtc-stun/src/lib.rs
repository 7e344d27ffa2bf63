#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod addr;
pub mod attributes;
pub mod change;
pub mod checks;
pub mod client;
pub mod error_code;
pub mod fingerprint;
pub mod integrity;
pub mod message;
pub mod textattrs;
pub mod xoraddr;

// IANA assigned ports for "stun" protocol.
pub const DEFAULT_PORT: u16 = 3478;
