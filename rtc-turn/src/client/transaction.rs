use bytes::BytesMut;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun::message::*;
use stun::textattrs::TextAttribute;

use crate::client::Event;
use crate::proto::channum::ChannelNumber;
use shared::{TransportMessage, TransportProtocol};

const MAX_RTO: Duration = Duration::from_millis(1600);
/// Requests sent in total (Rc). The timer runs once more after the last one.
const MAX_ATTEMPTS: u16 = 7;

/// What a request was for, kept until its answer arrives.
///
/// Authenticated requests remember whether they were already re-sent after a
/// 438 (Stale Nonce), so a server that keeps rotating the nonce cannot loop us.
pub(crate) enum TransactionType {
    AllocateAttempt,
    AllocateRequest(TextAttribute),
    CreatePermissionRequest(Vec<SocketAddr>, bool),
    RefreshRequest(Duration, bool),
    ChannelBindRequest(ChannelNumber, SocketAddr, bool),
}

/// An outstanding request to the TURN server.
pub(crate) struct Transaction {
    pub(crate) transaction_type: TransactionType,
    request: TransportMessage<BytesMut>,
    attempts: u16,
    expirations: u16,
    rto: Duration,
    deadline: Instant,
}

impl Transaction {
    /// `request` is the datagram as first sent; `rto` the initial retransmission timeout.
    pub(crate) fn new(
        transaction_type: TransactionType,
        request: TransportMessage<BytesMut>,
        rto: Duration,
    ) -> Self {
        Self {
            transaction_type,
            deadline: request.now + rto,
            request,
            attempts: 1,
            expirations: 0,
            rto,
        }
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.request.transport.peer_addr
    }

    fn is_exhausted(&self) -> bool {
        self.expirations >= MAX_ATTEMPTS
    }

    /// Advances the timer, returning a copy of the request when it should go out again.
    fn on_timeout(&mut self, now: Instant) -> Option<TransportMessage<BytesMut>> {
        if self.is_exhausted() || now < self.deadline {
            return None;
        }
        self.expirations += 1;
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.deadline = now + self.rto;

        // TCP delivers the request on its own
        if self.attempts >= MAX_ATTEMPTS
            || self.request.transport.transport_protocol == TransportProtocol::TCP
        {
            return None;
        }
        self.attempts += 1;
        Some(TransportMessage {
            now,
            transport: self.request.transport,
            message: self.request.message.clone(),
        })
    }
}

/// Outstanding requests keyed by transaction id.
#[derive(Default)]
pub(crate) struct TransactionMap {
    pending: HashMap<TransactionId, Transaction>,
    retransmits: VecDeque<TransportMessage<BytesMut>>,
    events: VecDeque<Event>,
}

impl TransactionMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter(|tr| !tr.is_exhausted())
            .map(|tr| tr.deadline)
            .min()
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        let mut expired = vec![];
        for (tid, tr) in self.pending.iter_mut() {
            if let Some(transmit) = tr.on_timeout(now) {
                trace!(
                    "retransmitting transaction {:?} to {} (attempt {})",
                    tid,
                    tr.peer_addr(),
                    tr.attempts
                );
                self.retransmits.push_back(transmit);
            }
            if tr.is_exhausted() {
                expired.push(*tid);
            }
        }

        for tid in expired {
            self.pending.remove(&tid);
            self.events.push_back(Event::TransactionTimeout(tid));
        }
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<TransportMessage<BytesMut>> {
        self.retransmits.pop_front()
    }

    pub(crate) fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn insert(&mut self, tid: TransactionId, tr: Transaction) {
        self.pending.insert(tid, tr);
    }

    pub(crate) fn remove(&mut self, tid: &TransactionId) -> Option<Transaction> {
        self.pending.remove(tid)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.retransmits.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
