#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod association;
pub mod chunk;
pub mod packet;
pub mod param;
pub(crate) mod util;

pub use association::{
    Association, AssociationEvent, AssociationState, CloseStatus, Datagram, SendStatus,
    association_config::AssociationConfig,
    association_stream::{ReliabilityType, StreamMessage, StreamReliability},
};
pub use chunk::chunk_payload_data::PayloadProtocolIdentifier;
pub use chunk::chunk_type::{CT_RECONFIG, ChunkType};
