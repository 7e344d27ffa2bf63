use super::*;

impl Association {
    pub(crate) fn handle_data(&mut self, chunk: ChunkPayloadData) {
        let tsn = chunk.tsn;
        if sna32lte(tsn, self.in_tsn) || self.receive_hold.iter().any(|c| c.tsn == tsn) {
            trace!("duplicate DATA tsn={tsn}");
            return;
        }

        // gap blocks address held chunks by a 16-bit offset from the cumulative ack
        if tsn.wrapping_sub(self.in_tsn) > u16::MAX as u32 {
            debug!("DATA tsn={tsn} too far ahead of {}, drop", self.in_tsn);
            return;
        }

        let in_order = tsn == self.in_tsn.wrapping_add(1);
        if in_order && !self.paused && self.user_tsn == self.in_tsn {
            self.in_tsn = tsn;
            self.advance_in_tsn();
            self.user_tsn = tsn;
            self.deliver(chunk);
            self.deliver_held();
            return;
        }

        let len = chunk.user_data.len();
        if self.held_bytes + len > self.config.max_receive_window() {
            debug!(
                "receive window full ({} bytes held), drop DATA tsn={tsn}",
                self.held_bytes
            );
            return;
        }
        self.hold(chunk);
        if in_order {
            self.in_tsn = tsn;
            self.advance_in_tsn();
        }
    }

    /// Moves `in_tsn` over held chunks that are now contiguous with it.
    fn advance_in_tsn(&mut self) {
        for c in &self.receive_hold {
            let next = self.in_tsn.wrapping_add(1);
            if c.tsn == next {
                self.in_tsn = next;
            } else if sna32gt(c.tsn, next) {
                break;
            }
        }
    }

    fn hold(&mut self, chunk: ChunkPayloadData) {
        let index = self
            .receive_hold
            .iter()
            .position(|c| sna32gt(c.tsn, chunk.tsn))
            .unwrap_or(self.receive_hold.len());
        self.held_bytes += chunk.user_data.len();
        self.receive_hold.insert(index, chunk);
    }

    /// Delivers held chunks that follow `user_tsn` and are covered by `in_tsn`.
    pub(crate) fn deliver_held(&mut self) -> bool {
        let mut delivered = false;
        while !self.paused {
            let next = self.user_tsn.wrapping_add(1);
            if !sna32lte(next, self.in_tsn) || self.receive_hold.front().is_none_or(|c| c.tsn != next)
            {
                break;
            }
            let Some(chunk) = self.receive_hold.pop_front() else {
                break;
            };
            self.held_bytes -= chunk.user_data.len();
            self.user_tsn = next;
            self.deliver(chunk);
            delivered = true;
        }
        delivered
    }

    fn deliver(&mut self, chunk: ChunkPayloadData) {
        let stream = self.streams.entry(chunk.stream_identifier).or_default();
        if let Some(message) = stream.reassemble(chunk) {
            self.reads.push_back(message);
        }
    }

    /// SACK for what we hold: cumulative ack at `in_tsn`, gap blocks for the chunks held
    /// beyond it, and the window left in the hold buffer.
    pub(crate) fn build_sack(&self) -> ChunkSelectiveAck {
        let cum = self.in_tsn;
        let max_blocks = MAX_SACK_GAP_BYTES / 4;
        let mut gap_ack_blocks: Vec<GapAckBlock> = vec![];
        for c in self.receive_hold.iter().filter(|c| sna32gt(c.tsn, cum)) {
            let offset = c.tsn.wrapping_sub(cum) as u16;
            match gap_ack_blocks.last_mut() {
                Some(block) if block.end.wrapping_add(1) == offset => block.end = offset,
                _ => {
                    if gap_ack_blocks.len() == max_blocks {
                        break;
                    }
                    gap_ack_blocks.push(GapAckBlock {
                        start: offset,
                        end: offset,
                    });
                }
            }
        }

        ChunkSelectiveAck {
            cumulative_tsn_ack: cum,
            advertised_receiver_window_credit: self
                .config
                .max_receive_window()
                .saturating_sub(self.held_bytes) as u32,
            gap_ack_blocks,
            duplicate_tsn: vec![],
        }
    }

    /// Stops handing messages to the reader. DATA keeps being acknowledged and held.
    pub fn pause(&mut self) {
        if !self.paused {
            debug!("pause delivery");
        }
        self.paused = true;
    }

    /// Resumes delivery, draining held chunks in TSN order, and advertises the freed window.
    pub fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Ok(());
        }
        debug!("resume delivery");
        self.paused = false;
        let delivered = self.deliver_held();

        let mut chunks = vec![];
        if let Some(param) = self.check_deferred_peer_reset() {
            chunks.push(Chunk::Reconfig(vec![param]));
        }
        if delivered && self.is_established() {
            chunks.push(Chunk::SelectiveAck(self.build_sack()));
        }
        if !chunks.is_empty() {
            self.send_chunks(chunks)?;
        }
        Ok(())
    }

    /// Messages are withheld from the reader while paused.
    pub(crate) fn poll_message(&mut self) -> Option<StreamMessage> {
        if self.paused {
            None
        } else {
            self.reads.pop_front()
        }
    }
}
