use super::*;

impl sansio::Protocol<RoutedBytesMut, (), ()> for Agent {
    type Rout = ();
    type Wout = RoutedBytesMut;
    type Eout = IceEvent;
    type Error = Error;
    type Time = Instant;

    /// Handles a STUN datagram that arrived on `msg.path`. Replies leave on the same path.
    fn handle_read(&mut self, msg: RoutedBytesMut) -> std::result::Result<(), Self::Error> {
        if !shared::util::match_stun(&msg.message) {
            return Err(Error::ErrNonStunmessage);
        }

        let mut m = Message::new();
        m.unmarshal_binary(&msg.message)?;

        if m.typ == BINDING_REQUEST {
            self.handle_binding_request(msg.now, msg.path, &mut m)
        } else if m.typ == BINDING_SUCCESS {
            self.handle_success_response(msg.path, &mut m)
        } else if m.typ == BINDING_ERROR {
            trace!(
                "binding error from {}, transaction {:?}",
                msg.path.peer_addr(),
                m.transaction_id
            );
            Ok(())
        } else {
            trace!(
                "unhandled STUN {} from {}",
                m.typ,
                msg.path.peer_addr()
            );
            Ok(())
        }
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
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
        self.handle_slot_timeouts(now)
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.slots
            .iter()
            .filter_map(|(_, slot)| slot.poll_timeout())
            .min()
    }

    fn close(&mut self) -> std::result::Result<(), Self::Error> {
        for handle in self.slots.handles() {
            self.slots.remove(handle);
        }
        self.transmits.clear();
        self.events.clear();
        Ok(())
    }
}
