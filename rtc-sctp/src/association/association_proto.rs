use super::*;

impl sansio::Protocol<Datagram, (), ()> for Association {
    type Rout = StreamMessage;
    type Wout = BytesMut;
    type Eout = AssociationEvent;
    type Error = Error;
    type Time = Instant;

    /// Handles one decrypted SCTP packet.
    fn handle_read(&mut self, msg: Datagram) -> std::result::Result<(), Self::Error> {
        self.handle_packet(msg.now, msg.payload.freeze())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.poll_message()
    }

    fn handle_write(&mut self, _msg: ()) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.transmits.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> std::result::Result<(), Self::Error> {
        self.handle_timers(now)
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.next_timeout()
    }

    fn close(&mut self) -> std::result::Result<(), Self::Error> {
        self.close_with("closed locally");
        self.reads.clear();
        self.transmits.clear();
        self.receive_hold.clear();
        self.held_bytes = 0;
        Ok(())
    }
}
