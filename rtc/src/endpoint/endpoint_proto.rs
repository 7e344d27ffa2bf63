use super::*;

/// Reads are datagrams from the UDP socket, or bytes from the TURN control
/// connection. Writes carry their destination in `transport`.
impl<E: TlsEngine, H: Handler> sansio::Protocol<TaggedBytesMut, (), ()> for Endpoint<E, H> {
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = ();
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        let now = msg.now;
        self.last_now = now;

        match self.turn.as_mut() {
            Some(turn) if turn.is_from_server(&msg.transport) => {
                turn.handle_read(msg)?;
                self.process_turn(now);
            }
            _ => {
                self.handle_datagram(now, TransportPath::Direct(msg.transport.peer_addr), msg.message);
            }
        }

        self.apply_commands(now);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }
        self.turn.as_mut().and_then(|turn| turn.poll_write())
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        None
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.last_now = now;

        for handle in std::mem::take(&mut self.pending_disconnects) {
            self.teardown(now, handle);
        }

        if let Err(err) = self.agent.handle_timeout(now) {
            debug!("ice timeout: {err}");
        }
        self.process_agent(now);

        if let Some(turn) = self.turn.as_mut()
            && let Err(err) = turn.handle_timeout(now)
        {
            debug!("turn timeout: {err}");
        }
        self.process_turn(now);

        for handle in self.sessions.handles() {
            self.session_timeout(now, handle);
        }

        self.apply_commands(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        if !self.pending_disconnects.is_empty() {
            return Some(self.last_now);
        }

        let mut next = self.agent.poll_timeout();
        if let Some(turn) = self.turn.as_mut() {
            next = min_instant(next, turn.poll_timeout());
        }
        for (_, s) in self.sessions.iter_mut() {
            next = min_instant(next, s.poll_timeout());
        }
        next
    }

    /// Tears every session down and releases the allocation.
    fn close(&mut self) -> Result<()> {
        let now = self.last_now;
        for handle in self.sessions.handles() {
            self.teardown(now, handle);
        }
        self.commands = Commands::default();
        self.agent.close()?;
        // the zero-lifetime refresh still leaves through poll_write
        if let Some(turn) = self.turn.as_mut()
            && let Ok(mut relay) = turn.relay()
        {
            relay.close(now)?;
        }
        Ok(())
    }
}

fn min_instant(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
