//! # RTC - Sans-I/O WebRTC Data Channel Endpoint
//!
//! A server-side WebRTC data channel stack (ICE-lite, DTLS, SCTP, DCEP, optional TURN)
//! built on a **sans-I/O architecture**. One [`Endpoint`](endpoint::Endpoint) serves
//! many peers over a single UDP socket: it never touches the network or the clock
//! itself, you feed it datagrams and time and it hands back datagrams to send.
//!
//! ## Layers
//!
//! - [`ice`]: offer/answer blocks, ICE-lite connectivity checks and nomination
//! - [`turn`]: optional relaying through a TURN allocation
//! - [`dtls_transport`]: DTLS sessions on top of a pluggable [`TlsEngine`](dtls_transport::TlsEngine)
//! - [`sctp`]: one association per DTLS session
//! - [`datachannel`]: DCEP channel negotiation on SCTP streams
//!
//! Application code implements [`Handler`](endpoint::endpoint_handler::Handler) and
//! is called back synchronously while the endpoint processes input. Callbacks queue
//! follow-up work through [`Commands`](endpoint::endpoint_handler::Commands).
//!
//! ## Event Loop
//!
//! ```no_run
//! use bytes::BytesMut;
//! use rtc::dtls_transport::TlsEngine;
//! use rtc::endpoint::Endpoint;
//! use rtc::endpoint::endpoint_handler::Handler;
//! use rtc::sansio::Protocol;
//! use rtc::shared::{TaggedBytesMut, TransportContext, TransportProtocol};
//! use std::net::UdpSocket;
//! use std::time::{Duration, Instant};
//!
//! fn run<E: TlsEngine, H: Handler>(
//!     endpoint: &mut Endpoint<E, H>,
//!     socket: &UdpSocket,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let local_addr = socket.local_addr()?;
//!     let mut buf = vec![0u8; 2048];
//!
//!     loop {
//!         // 1. poll_write() - datagrams to send
//!         while let Some(msg) = endpoint.poll_write() {
//!             socket.send_to(&msg.message, msg.transport.peer_addr)?;
//!         }
//!
//!         // 2. poll_timeout() - next timer deadline
//!         let deadline = endpoint
//!             .poll_timeout()
//!             .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));
//!         let wait = deadline.saturating_duration_since(Instant::now());
//!         socket.set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
//!
//!         // 3. handle_read() - datagrams received
//!         if let Ok((n, peer_addr)) = socket.recv_from(&mut buf) {
//!             endpoint.handle_read(TaggedBytesMut {
//!                 now: Instant::now(),
//!                 transport: TransportContext {
//!                     local_addr,
//!                     peer_addr,
//!                     transport_protocol: TransportProtocol::UDP,
//!                 },
//!                 message: BytesMut::from(&buf[..n]),
//!             })?;
//!         }
//!
//!         // 4. handle_timeout() - timers that expired
//!         if endpoint.poll_timeout().is_some_and(|t| t <= Instant::now()) {
//!             endpoint.handle_timeout(Instant::now())?;
//!         }
//!     }
//! }
//! ```
//!
//! Offers are exchanged out of band: the offering side calls
//! [`generate_offer`](endpoint::Endpoint::generate_offer), the answering side
//! [`set_offer`](endpoint::Endpoint::set_offer) with no credentials, and the answer goes
//! back through `set_offer` with the credentials the offer handed out.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub use {datachannel, ice, sansio, sctp, shared, stun, turn};

pub(crate) mod demuxer;
pub mod dtls_transport;
pub mod endpoint;

pub use dtls_transport::{DtlsSession, DtlsState, TlsEngine, TlsSession};
pub use endpoint::Endpoint;
pub use endpoint::endpoint_config::EndpointConfig;
pub use endpoint::endpoint_handler::{Command, Commands, Flow, Handler};
