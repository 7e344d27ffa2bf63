#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(feature = "marshal")]
pub mod marshal;

pub mod error;
pub mod slot;
pub mod time;
pub(crate) mod transport;
pub mod util;

pub use slot::{SlotHandle, SlotTable};
pub use transport::{
    RoutedBytesMut, RoutedMessage, TaggedBytesMut, TransportContext, TransportMessage,
    TransportPath, TransportProtocol,
};
