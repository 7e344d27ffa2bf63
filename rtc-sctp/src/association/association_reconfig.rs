use super::*;
use crate::param::param_reconfig_response::*;
use crate::param::param_reset_request::*;
use log::warn;

/// A peer stream reset that has to wait until everything the peer sent before it has
/// been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum PendingReconfig {
    #[default]
    None,
    Deferred { last_tsn: u32, stream_ids: Vec<u16> },
}

/// Our own stream reset waiting for the peer's response.
#[derive(Debug, Clone)]
pub(crate) struct LocalReset {
    pub(crate) stream_ids: Vec<u16>,
    pub(crate) request_seqs: Vec<u32>,
    params: Vec<Param>,
    pub(crate) failures: u32,
    pub(crate) retry_at: Instant,
}

impl Association {
    fn next_reconfig_request_seq(&mut self) -> u32 {
        let seq = self.reconfig_request_seq;
        self.reconfig_request_seq = self.reconfig_request_seq.wrapping_add(1);
        seq
    }

    fn outgoing_reset_request(&mut self, response_seq: u32, stream_ids: &[u16]) -> Param {
        Param::OutgoingResetRequest(ParamOutgoingResetRequest {
            reconfig_request_sequence_number: self.next_reconfig_request_seq(),
            reconfig_response_sequence_number: response_seq,
            sender_last_tsn: self.next_tsn.wrapping_sub(1),
            stream_identifiers: stream_ids.to_vec(),
        })
    }

    /// Closes `stream_ids` in both directions with an Outgoing and an Incoming SSN reset
    /// request. An empty list closes every stream.
    ///
    /// The streams are reported through [`AssociationEvent::StreamsReset`] once the peer
    /// answers, or once retries run out.
    pub fn close_streams(&mut self, now: Instant, stream_ids: &[u16]) -> Result<CloseStatus> {
        if !self.is_established() {
            return Err(Error::ErrPayloadDataStateNotExist);
        }
        if self.local_reset.is_some() {
            return Ok(CloseStatus::AlreadyPending);
        }
        if !self.peer_supports(CT_RECONFIG) {
            return Ok(CloseStatus::NotSupported);
        }

        let outgoing = self.outgoing_reset_request(self.reconfig_response_seq, stream_ids);
        let incoming_seq = self.next_reconfig_request_seq();
        let incoming = Param::IncomingResetRequest(ParamIncomingResetRequest {
            reconfig_request_sequence_number: incoming_seq,
            stream_identifiers: stream_ids.to_vec(),
        });
        let params = vec![outgoing, incoming];

        debug!("reset streams {stream_ids:?}");
        self.local_reset = Some(LocalReset {
            stream_ids: stream_ids.to_vec(),
            request_seqs: vec![incoming_seq.wrapping_sub(1), incoming_seq],
            params: params.clone(),
            failures: 0,
            retry_at: now + Duration::from_millis(RTO_MIN),
        });
        self.send_chunks(vec![Chunk::Reconfig(params)])?;
        Ok(CloseStatus::Ok)
    }

    pub(crate) fn handle_reconfig(&mut self, _now: Instant, params: Vec<Param>, reply: &mut Vec<Chunk>) {
        let mut seen_outgoing = false;
        let mut built_outgoing = false;
        let mut out = vec![];

        for param in params {
            match param {
                Param::OutgoingResetRequest(req) => {
                    self.handle_outgoing_reset_request(req, &mut seen_outgoing, &mut built_outgoing, &mut out)
                }
                Param::IncomingResetRequest(req) => {
                    self.handle_incoming_reset_request(req, &mut built_outgoing, &mut out)
                }
                Param::ReconfigResponse(resp) => self.handle_reconfig_response(resp),
                other => trace!("ignore RECONFIG parameter {}", other.param_type()),
            }
        }

        if !out.is_empty() {
            reply.push(Chunk::Reconfig(out));
        }
    }

    fn handle_outgoing_reset_request(
        &mut self,
        req: ParamOutgoingResetRequest,
        seen_outgoing: &mut bool,
        built_outgoing: &mut bool,
        out: &mut Vec<Param>,
    ) {
        let seq = req.reconfig_request_sequence_number;
        self.reconfig_response_seq = seq;

        let mut own_request = None;
        let result = if *seen_outgoing {
            ReconfigResult::Denied
        } else {
            *seen_outgoing = true;
            if sna32lte(req.sender_last_tsn, self.user_tsn) {
                own_request = self.perform_peer_reset(&req.stream_identifiers, seq);
                ReconfigResult::SuccessPerformed
            } else if self.local_reset.is_some() {
                ReconfigResult::Denied
            } else {
                if self.peer_reset == PendingReconfig::None {
                    self.peer_reset = PendingReconfig::Deferred {
                        last_tsn: req.sender_last_tsn,
                        stream_ids: req.stream_identifiers.clone(),
                    };
                }
                ReconfigResult::InProgress
            }
        };

        debug!(
            "peer reset of streams {:?} (seq {seq}): {result}",
            req.stream_identifiers
        );
        out.push(Param::ReconfigResponse(ParamReconfigResponse {
            reconfig_response_sequence_number: seq,
            result,
        }));
        if let Some(param) = own_request {
            *built_outgoing = true;
            out.push(param);
        }
    }

    fn handle_incoming_reset_request(
        &mut self,
        req: ParamIncomingResetRequest,
        built_outgoing: &mut bool,
        out: &mut Vec<Param>,
    ) {
        let seq = req.reconfig_request_sequence_number;
        self.reconfig_response_seq = seq;

        if *built_outgoing {
            let result = match self.peer_reset {
                PendingReconfig::Deferred { .. } => ReconfigResult::InProgress,
                PendingReconfig::None => ReconfigResult::SuccessNop,
            };
            out.push(Param::ReconfigResponse(ParamReconfigResponse {
                reconfig_response_sequence_number: seq,
                result,
            }));
        } else {
            let param = self.outgoing_reset_request(seq, &req.stream_identifiers);
            out.push(param);
            *built_outgoing = true;
        }
    }

    fn handle_reconfig_response(&mut self, resp: ParamReconfigResponse) {
        let seq = resp.reconfig_response_sequence_number;
        let Some(local) = &self.local_reset else {
            trace!("ignore RECONFIG response {seq} without a pending reset");
            return;
        };
        if !local.request_seqs.contains(&seq) {
            trace!("ignore RECONFIG response {seq}");
            return;
        }
        if resp.result == ReconfigResult::InProgress {
            debug!("peer is still completing reset {seq}");
            return;
        }

        debug!("stream reset {seq} answered: {}", resp.result);
        if let Some(local) = self.local_reset.take() {
            self.propagate_local_reset(local);
        }
    }

    /// Closes the streams of a finished local reset, every known stream when it named none.
    fn propagate_local_reset(&mut self, local: LocalReset) {
        let stream_ids = if local.stream_ids.is_empty() {
            self.streams.keys().copied().collect()
        } else {
            local.stream_ids
        };
        for id in &stream_ids {
            self.streams.remove(id);
        }
        if !stream_ids.is_empty() {
            self.events
                .push_back(AssociationEvent::StreamsReset { stream_ids });
        }
    }

    /// Closes the streams a peer reset names and returns our own Outgoing request for
    /// the reverse direction when any of them was still open here.
    fn perform_peer_reset(&mut self, stream_ids: &[u16], request_seq: u32) -> Option<Param> {
        let closed: Vec<u16> = if stream_ids.is_empty() {
            self.streams.keys().copied().collect()
        } else {
            stream_ids
                .iter()
                .copied()
                .filter(|id| self.streams.contains_key(id))
                .collect()
        };
        if closed.is_empty() {
            return None;
        }

        let own_request = self
            .local_reset
            .is_none()
            .then(|| self.outgoing_reset_request(request_seq, stream_ids));
        for id in &closed {
            self.streams.remove(id);
        }
        self.events
            .push_back(AssociationEvent::StreamsReset { stream_ids: closed });
        own_request
    }

    /// Performs a deferred peer reset once `user_tsn` has caught up with it.
    pub(crate) fn check_deferred_peer_reset(&mut self) -> Option<Param> {
        let PendingReconfig::Deferred { last_tsn, .. } = &self.peer_reset else {
            return None;
        };
        if !sna32lte(*last_tsn, self.user_tsn) {
            return None;
        }
        let PendingReconfig::Deferred { stream_ids, .. } = std::mem::take(&mut self.peer_reset)
        else {
            return None;
        };
        let request_seq = self.reconfig_response_seq;
        self.perform_peer_reset(&stream_ids, request_seq)
    }

    pub(crate) fn check_reconfig_retry(&mut self, now: Instant) -> Result<()> {
        let Some(local) = self.local_reset.as_mut() else {
            return Ok(());
        };
        if now < local.retry_at {
            return Ok(());
        }

        local.failures += 1;
        let backoff = RTO_MIN.saturating_mul(1u64 << local.failures.min(16));
        if backoff > RTO_MAX {
            warn!(
                "stream reset of {:?} unanswered after {} attempts, closing locally",
                local.stream_ids, local.failures
            );
            if let Some(local) = self.local_reset.take() {
                self.propagate_local_reset(local);
            }
            return Ok(());
        }

        local.retry_at = now + Duration::from_millis(backoff);
        let params = local.params.clone();
        debug!("retransmit stream reset, next retry in {backoff}ms");
        self.send_chunks(vec![Chunk::Reconfig(params)])
    }
}
