use crate::client::{Client, Event};
use shared::error::Error;
use shared::{TaggedBytesMut, TransportProtocol};
use std::time::Instant;

/// Reads are the bytes received on the control connection. Writes are peer
/// datagrams: `transport.peer_addr` names the peer and the payload is relayed
/// through the allocation.
impl sansio::Protocol<TaggedBytesMut, TaggedBytesMut, ()> for Client {
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = Event;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<(), Self::Error> {
        if msg.transport.transport_protocol == TransportProtocol::TCP {
            self.handle_stream(msg.now, &msg.message[..])
        } else {
            self.handle_inbound(msg.now, &msg.message[..])
        }
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, msg: TaggedBytesMut) -> Result<(), Self::Error> {
        let mut relay = self.relay()?;
        relay.send_to(msg.now, msg.transport.peer_addr, &msg.message[..])
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        while let Some(transmit) = self.tr_map.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        self.transmits.pop_front()
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        while let Some(event) = self.tr_map.poll_event() {
            if let Event::TransactionTimeout(tid) = &event
                && self.allocating == Some(*tid)
            {
                self.allocating = None;
            }
            self.events.push_back(event);
        }
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), Self::Error> {
        self.tr_map.handle_timeout(now);

        if let Ok(mut relay) = self.relay() {
            relay.handle_timeout(now);
        }

        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        let tr_timeout = self.tr_map.poll_timeout();
        let relay_timeout = self.relay().ok().and_then(|relay| relay.poll_timeout());

        match (tr_timeout, relay_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.tr_map.clear();
        self.decoder.clear();
        self.allocating = None;
        Ok(())
    }
}
