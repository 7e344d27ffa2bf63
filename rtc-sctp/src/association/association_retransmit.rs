use super::*;
use log::warn;

/// A DATA chunk we sent, or are about to send, together with its retransmission state.
#[derive(Debug, Clone)]
pub(crate) struct OutboundChunk {
    pub(crate) tsn: u32,
    /// User data bytes, the unit credits are counted in.
    pub(crate) len: usize,
    /// The complete packet, resent verbatim.
    pub(crate) packet: Bytes,
    pub(crate) sent_at: Instant,
    pub(crate) retransmit_count: u32,
    pub(crate) gap_reports: u8,
    pub(crate) forward_acked: bool,
    pub(crate) fast_retransmitted: bool,
    pub(crate) marked_for_retransmit: bool,
}

impl OutboundChunk {
    pub(crate) fn new(tsn: u32, len: usize, packet: Bytes, now: Instant) -> Self {
        OutboundChunk {
            tsn,
            len,
            packet,
            sent_at: now,
            retransmit_count: 0,
            gap_reports: 0,
            forward_acked: false,
            fast_retransmitted: false,
            marked_for_retransmit: false,
        }
    }
}

impl Association {
    pub(crate) fn transmit_new(&mut self, now: Instant, mut chunk: OutboundChunk) {
        chunk.sent_at = now;
        self.receiver_credits = self.receiver_credits.saturating_sub(chunk.len);
        self.sender_credits = self.sender_credits.saturating_sub(chunk.len);
        if self.t3_start.is_none() {
            self.t3_start = Some(now);
        }
        self.transmits.push_back(BytesMut::from(&chunk.packet[..]));
        self.pending.push_back(chunk);
    }

    fn outstanding_bytes(&self) -> usize {
        self.pending.iter().map(|c| c.len).sum()
    }

    pub(crate) fn handle_sack(&mut self, now: Instant, sack: &ChunkSelectiveAck) {
        let cum = sack.cumulative_tsn_ack;
        if sna32lt(cum, self.cumulative_tsn_ack_point) {
            trace!(
                "ignore stale SACK cum={cum} < {}",
                self.cumulative_tsn_ack_point
            );
            return;
        }
        self.cumulative_tsn_ack_point = cum;

        let outstanding_before = self.outstanding_bytes();
        let mut acked = 0;
        let mut credited = 0;
        let mut rtt_sampled = false;
        while self.pending.front().is_some_and(|c| sna32lte(c.tsn, cum)) {
            let Some(chunk) = self.pending.pop_front() else {
                break;
            };
            acked += chunk.len;
            if !chunk.forward_acked {
                credited += chunk.len;
            }
            let fresh = chunk.retransmit_count == 0
                && self.last_retransmit.is_none_or(|t| t < chunk.sent_at);
            if !rtt_sampled && fresh {
                self.update_rto(now.saturating_duration_since(chunk.sent_at).as_millis() as u64);
                rtt_sampled = true;
            }
        }

        if acked > 0 {
            self.tick_count = 0;
            self.sender_credits = (self.sender_credits + credited).min(self.cwnd);
        }
        self.receiver_credits =
            (sack.advertised_receiver_window_credit as usize).saturating_sub(self.outstanding_bytes());

        if self.pending.is_empty() {
            self.sender_credits = self.cwnd;
            self.partial_bytes_acked = 0;
            self.t3_start = None;
        } else {
            self.partial_bytes_acked += acked;
            if acked > 0 {
                self.t3_start = Some(now);
            }
        }

        let mtu = self.config.mtu();
        if self.cwnd <= self.ssthresh {
            if self.fast_recovery_exit.is_none()
                && acked > 0
                && self.cwnd < self.config.max_receive_window()
            {
                self.cwnd += acked.min(mtu);
            }
        } else if self.partial_bytes_acked >= self.cwnd && outstanding_before >= self.cwnd {
            self.cwnd += mtu;
            self.partial_bytes_acked = self.partial_bytes_acked.saturating_sub(self.cwnd);
        }

        if let Some(exit) = self.fast_recovery_exit
            && sna32gte(cum, exit)
        {
            debug!("exit fast recovery at cum={cum}");
            self.fast_recovery_exit = None;
        }

        if !sack.gap_ack_blocks.is_empty() {
            self.process_gap_blocks(now, sack);
        }
        self.retransmit_marked(now);
        self.drain_holding(now);
    }

    /// Forward-acks chunks inside gap blocks and counts a missing report for the chunks
    /// below the highest one. The third report triggers fast retransmit.
    fn process_gap_blocks(&mut self, now: Instant, sack: &ChunkSelectiveAck) {
        let ranges = sack.gap_ranges();
        let Some(highest) = ranges
            .iter()
            .map(|&(_, end)| end)
            .reduce(|a, b| if sna32gt(b, a) { b } else { a })
        else {
            return;
        };

        let mut credited = 0;
        let mut newly_marked = vec![];
        for (i, chunk) in self.pending.iter_mut().enumerate() {
            if sna32gt(chunk.tsn, highest) {
                break;
            }
            let received = ranges
                .iter()
                .any(|&(start, end)| sna32lte(start, chunk.tsn) && sna32lte(chunk.tsn, end));
            if received {
                if !chunk.forward_acked {
                    chunk.forward_acked = true;
                    credited += chunk.len;
                }
                continue;
            }

            if chunk.forward_acked {
                // reneged
                chunk.forward_acked = false;
                chunk.gap_reports = 1;
            } else {
                chunk.gap_reports = chunk.gap_reports.saturating_add(1);
            }
            if chunk.gap_reports >= FAST_RETRANSMIT_GAP && !chunk.fast_retransmitted {
                chunk.fast_retransmitted = true;
                chunk.marked_for_retransmit = true;
                newly_marked.push((i, chunk.tsn));
            }
        }

        self.sender_credits = (self.sender_credits + credited).min(self.cwnd);
        self.partial_bytes_acked += credited;

        let (Some(&(first, _)), Some(&(_, last_tsn))) = (newly_marked.first(), newly_marked.last())
        else {
            return;
        };
        if self.fast_recovery_exit.is_none() {
            let mtu = self.config.mtu();
            self.ssthresh = (self.cwnd / 2).max(4 * mtu);
            self.cwnd = self.ssthresh;
            self.sender_credits = self.sender_credits.min(self.cwnd);
            self.partial_bytes_acked = 0;
        }
        self.fast_recovery_exit = Some(last_tsn);
        debug!(
            "fast retransmit of {} chunks, cwnd={} ssthresh={}",
            newly_marked.len(),
            self.cwnd,
            self.ssthresh
        );
        self.retransmit(now, first);
    }

    fn retransmit_marked(&mut self, now: Instant) {
        for i in 0..self.pending.len() {
            let chunk = &self.pending[i];
            if chunk.marked_for_retransmit && self.sender_credits >= chunk.len {
                self.retransmit(now, i);
            }
        }
    }

    fn retransmit(&mut self, now: Instant, index: usize) {
        let Some(chunk) = self.pending.get_mut(index) else {
            return;
        };
        chunk.marked_for_retransmit = false;
        chunk.retransmit_count += 1;
        chunk.gap_reports = 0;
        chunk.sent_at = now;
        trace!(
            "retransmit tsn={} (attempt {})",
            chunk.tsn, chunk.retransmit_count
        );
        let (len, packet) = (chunk.len, BytesMut::from(&chunk.packet[..]));

        self.sender_credits = self.sender_credits.saturating_sub(len);
        self.last_retransmit = Some(now);
        if index == 0 || self.t3_start.is_none() {
            self.t3_start = Some(now);
        }
        self.transmits.push_back(packet);
    }

    fn drain_holding(&mut self, now: Instant) {
        let was_holding = !self.holding.is_empty();
        while self
            .holding
            .front()
            .is_some_and(|c| self.receiver_credits >= c.len && self.sender_credits >= c.len)
        {
            let Some(chunk) = self.holding.pop_front() else {
                break;
            };
            self.transmit_new(now, chunk);
        }
        if was_holding && self.holding.is_empty() {
            self.events.push_back(AssociationEvent::SendReady);
        }
    }

    /// T3-rtx: nothing advanced the cumulative ack within RTO.
    pub(crate) fn check_t3(&mut self, now: Instant) {
        let Some(start) = self.t3_start else {
            return;
        };
        if self.pending.is_empty() {
            self.t3_start = None;
            return;
        }
        if now < start + Duration::from_millis(self.rto) {
            return;
        }

        let mtu = self.config.mtu();
        self.t3_start = None;
        self.rto = (self.rto * 2).min(RTO_MAX);
        self.ssthresh = (self.cwnd / 2).max(4 * mtu);
        self.cwnd = mtu;
        self.sender_credits = mtu;
        self.partial_bytes_acked = 0;
        self.fast_recovery_exit = None;
        debug!(
            "T3-rtx timeout, rto={}ms cwnd={} ssthresh={}",
            self.rto, self.cwnd, self.ssthresh
        );

        for i in 0..self.pending.len() {
            let chunk = &self.pending[i];
            if chunk.forward_acked {
                continue;
            }
            if self.sender_credits >= chunk.len {
                self.retransmit(now, i);
            } else {
                self.pending[i].marked_for_retransmit = true;
            }
        }
    }

    pub(crate) fn update_rto(&mut self, rtt: u64) {
        let r = rtt as f64;
        if self.rtt_measured {
            self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - RTO_ALPHA) * self.srtt + RTO_ALPHA * r;
        } else {
            self.srtt = r;
            self.rttvar = r / 2.0;
            self.rtt_measured = true;
        }
        self.rto = ((self.srtt + 4.0 * self.rttvar) as u64).clamp(RTO_MIN, RTO_MAX);
        trace!("rtt={rtt}ms srtt={:.1} rttvar={:.1} rto={}", self.srtt, self.rttvar, self.rto);
    }

    pub(crate) fn on_tick(&mut self) -> Result<()> {
        self.tick_count += 1;
        if self.tick_count >= DEAD_TICKS {
            warn!("no traffic from peer for {} ticks", self.tick_count);
            self.close_with("heartbeat timeout");
            return Ok(());
        }
        if self.tick_count >= HEARTBEAT_TICKS && self.is_established() {
            self.send_chunks(vec![Chunk::Heartbeat {
                is_ack: false,
                info: Bytes::new(),
            }])?;
        }
        Ok(())
    }
}
