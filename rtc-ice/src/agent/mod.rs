
pub mod agent_config;
mod agent_proto;
mod agent_selector;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use agent_config::*;
use stun::attributes::*;
use stun::fingerprint::*;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;
use stun::xoraddr::*;

use crate::candidate::*;
use crate::control::*;
use crate::offer::*;
use crate::rand::*;
use shared::error::*;
use shared::marshal::*;
use shared::{RoutedBytesMut, RoutedMessage, SlotHandle, SlotTable, TransportPath};

/// Transaction id prefix bit marking a consent freshness probe.
pub const CONSENT_PREFIX: u8 = 0x80;

/// Builds the transaction id of a consent freshness probe for the DTLS session at
/// `session_index`: the index with the top bit set, then the probe start timestamp.
pub fn consent_transaction_id(session_index: usize, timestamp_ms: u64) -> TransactionId {
    let mut tid = [0u8; TRANSACTION_ID_SIZE];
    tid[0] = (session_index as u8) ^ CONSENT_PREFIX;
    tid[1..9].copy_from_slice(&timestamp_ms.to_be_bytes());
    TransactionId(tid)
}

/// Events surfaced by the agent for the layer that owns DTLS sessions and the TURN client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    /// Relay permissions for `peers` are needed before checks on `slot` start.
    /// Call [Agent::start_checks] once the TURN server granted them.
    CreatePermissions {
        slot: SlotHandle,
        peers: Vec<SocketAddr>,
    },
    /// The controlling side nominated `path` for `slot`.
    Nominated {
        slot: SlotHandle,
        path: TransportPath,
        initiate_dtls: bool,
    },
    /// A consent freshness probe of the bound DTLS `session` was answered.
    ConsentResponse {
        session: SlotHandle,
        transaction_id: TransactionId,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PendingCheck {
    pub(crate) due: Instant,
    pub(crate) target: SocketAddr,
    pub(crate) use_candidate: bool,
}

/// State of one offer/answer exchange.
#[derive(Debug, Clone)]
pub struct IceSlot {
    pub(crate) local_username: String,
    pub(crate) local_key: String,
    /// `None` while our own generated offer waits for the answer.
    pub(crate) remote: Option<IceOffer>,
    pub(crate) responded: Vec<bool>,
    /// Sources of authenticated requests that no known candidate matched yet.
    pub(crate) unlocked: Vec<SocketAddr>,
    pub(crate) tie_breaker: u64,
    pub(crate) dtls_initiator: bool,
    pub(crate) peer_has_active_offer: bool,
    pub(crate) use_turn: bool,
    pub(crate) created_at: Instant,
    pub(crate) dtls_session: Option<SlotHandle>,
    pub(crate) requery_count: usize,
    pub(crate) checking: bool,
    pub(crate) awaiting_permissions: bool,
    pub(crate) nominated: Option<SocketAddr>,
    pub(crate) pending_checks: Vec<PendingCheck>,
    pub(crate) finalize_at: Option<Instant>,
    pub(crate) keepalive_at: Option<Instant>,
}

impl IceSlot {
    fn new(now: Instant, use_turn: bool) -> Self {
        Self {
            local_username: String::new(),
            local_key: String::new(),
            remote: None,
            responded: vec![],
            unlocked: vec![],
            tie_breaker: generate_tie_breaker(),
            dtls_initiator: true,
            peer_has_active_offer: false,
            use_turn,
            created_at: now,
            dtls_session: None,
            requery_count: 0,
            checking: false,
            awaiting_permissions: false,
            nominated: None,
            pending_checks: vec![],
            finalize_at: None,
            keepalive_at: None,
        }
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn remote(&self) -> Option<&IceOffer> {
        self.remote.as_ref()
    }

    /// We run the connectivity checks and nominate.
    pub fn is_controlling(&self) -> bool {
        !self.peer_has_active_offer
    }

    /// We act as DTLS client towards this peer.
    pub fn dtls_initiator(&self) -> bool {
        self.dtls_initiator
    }

    pub fn use_turn(&self) -> bool {
        self.use_turn
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn dtls_session(&self) -> Option<SlotHandle> {
        self.dtls_session
    }

    /// The remote candidate chosen with USE-CANDIDATE, by either side.
    pub fn nominated(&self) -> Option<SocketAddr> {
        self.nominated
    }

    /// Connectivity checks are running and nomination is still ahead.
    pub fn is_checking(&self) -> bool {
        self.checking
    }

    /// Checks wait for the TURN server to grant permissions.
    pub fn is_awaiting_permissions(&self) -> bool {
        self.awaiting_permissions
    }

    /// Remote candidates that proved reachable, in priority order.
    pub fn responded_candidates(&self) -> Vec<SocketAddr> {
        match &self.remote {
            Some(remote) => remote
                .candidates
                .iter()
                .zip(self.responded.iter())
                .filter(|(_, responded)| **responded)
                .map(|(c, _)| c.addr())
                .collect(),
            None => vec![],
        }
    }

    pub fn is_responded(&self, addr: &SocketAddr) -> bool {
        self.candidate_index(addr)
            .is_some_and(|i| self.responded.get(i).copied().unwrap_or(false))
    }

    /// The route datagrams to `peer` take for this slot.
    pub fn path_to(&self, peer: SocketAddr) -> TransportPath {
        if self.use_turn {
            TransportPath::RelayIndication(peer)
        } else {
            TransportPath::Direct(peer)
        }
    }

    pub(crate) fn is_expired(&self, now: Instant, config: &AgentConfig) -> bool {
        now.saturating_duration_since(self.created_at) > config.offer_ttl
    }

    fn candidate_index(&self, addr: &SocketAddr) -> Option<usize> {
        self.remote
            .as_ref()
            .and_then(|r| r.candidates.iter().position(|c| c.matches(addr)))
    }

    /// Flags the candidate at `addr` as reachable; unknown sources are remembered so a
    /// candidate learned later starts out reachable.
    pub(crate) fn mark_responded(&mut self, addr: SocketAddr) -> bool {
        if let Some(i) = self.candidate_index(&addr) {
            let changed = !self.responded[i];
            self.responded[i] = true;
            return changed;
        }
        if !self.unlocked.contains(&addr) && self.unlocked.len() < MAX_CANDIDATES {
            self.unlocked.push(addr);
        }
        false
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        self.pending_checks
            .iter()
            .map(|c| c.due)
            .chain(self.finalize_at)
            .chain(self.keepalive_at)
            .min()
    }

    fn stop_checks(&mut self) {
        self.checking = false;
        self.pending_checks.clear();
        self.finalize_at = None;
        self.keepalive_at = None;
    }
}

/// Represents the ICE agent: a fixed table of offer slots and their connectivity checks.
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) secret: [u8; LEN_SECRET],
    pub(crate) max_requery: usize,
    pub(crate) local_candidates: Vec<Candidate>,
    pub(crate) relayed_addr: Option<Candidate>,
    pub(crate) slots: SlotTable<IceSlot>,

    pub(crate) transmits: VecDeque<RoutedBytesMut>,
    pub(crate) events: VecDeque<IceEvent>,
}

impl Agent {
    /// Creates a new Agent.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;

        let local_candidates = config
            .local_candidates
            .iter()
            .map(|addr| Candidate::try_from(*addr))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            secret: config.secret.unwrap_or_else(generate_secret),
            max_requery: config.max_requery.unwrap_or(config.max_slots),
            slots: SlotTable::new(config.max_slots),
            local_candidates,
            relayed_addr: None,
            config,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Replaces the host candidates advertised in later offers and answers.
    pub fn set_local_candidates(&mut self, candidates: &[SocketAddr]) -> Result<()> {
        self.local_candidates = candidates
            .iter()
            .map(|addr| Candidate::try_from(*addr))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Sets the TURN relayed address advertised by relayed slots.
    pub fn set_relayed_address(&mut self, addr: Option<SocketAddr>) -> Result<()> {
        self.relayed_addr = addr.map(Candidate::try_from).transpose()?;
        Ok(())
    }

    pub fn slot(&self, handle: SlotHandle) -> Option<&IceSlot> {
        self.slots.get(handle)
    }

    pub fn slots(&self) -> impl Iterator<Item = (SlotHandle, &IceSlot)> {
        self.slots.iter()
    }

    /// Resolves the slot that handed out `local_username`.
    pub fn slot_by_username(&self, local_username: &str) -> Option<SlotHandle> {
        let index = char_to_slot(*local_username.as_bytes().first()?)?;
        let handle = self.slots.handle_at(index)?;
        let slot = self.slots.get(handle)?;
        (slot.local_username == local_username).then_some(handle)
    }

    /// Generates an offer on a fresh slot. Returns the slot and the encoded offer block.
    pub fn generate_offer(&mut self, now: Instant) -> Result<(SlotHandle, Bytes)> {
        let slot = IceSlot::new(now, self.config.turn_mode == TurnMode::AlwaysRelay);
        let handle = self.allocate(now, slot)?;
        self.assign_credentials(handle, None)?;

        let block = self.local_offer(handle)?.marshal()?;
        debug!("generated offer on slot {handle}");
        Ok((handle, block))
    }

    /// Applies a remote offer (or an answer to one of our offers) and returns the answer block.
    ///
    /// `local_credentials` carries the username and key we handed out when this block
    /// answers our own offer; the slot is then recovered from the username.
    pub fn set_offer(
        &mut self,
        now: Instant,
        block: &[u8],
        local_credentials: Option<(&str, &str)>,
    ) -> Result<(SlotHandle, Bytes)> {
        let remote = IceOffer::unmarshal(&mut &block[..])?;
        let handle = self.apply_offer(now, remote, local_credentials)?;
        let answer = self.local_offer(handle)?.marshal()?;
        Ok((handle, answer))
    }

    /// ORTC style negotiation: remote credentials without candidates, for the slot that
    /// handed out `local_username`. Candidates follow through [Agent::add_remote_candidate].
    pub fn set_remote_parameters(
        &mut self,
        now: Instant,
        local_username: &str,
        remote_username: &str,
        remote_key: &str,
        fingerprint: &[u8],
        remote_is_dtls_server: bool,
    ) -> Result<SlotHandle> {
        let handle = self
            .slot_by_username(local_username)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        let (user, key) = {
            let slot = self.slots.get(handle).ok_or(Error::ErrIceSlotNotExisted)?;
            (slot.local_username.clone(), slot.local_key.clone())
        };
        let remote = IceOffer {
            flags: if remote_is_dtls_server {
                FLAG_DTLS_SERVER
            } else {
                0
            },
            username: remote_username.to_owned(),
            key: remote_key.to_owned(),
            fingerprint: fingerprint.to_vec(),
            candidates: vec![],
            relay: None,
        };
        self.apply_offer(now, remote, Some((&user, &key)))
    }

    /// Adds a trickled remote candidate to the slot that handed out `local_username`.
    pub fn add_remote_candidate(
        &mut self,
        now: Instant,
        local_username: &str,
        addr: SocketAddr,
    ) -> Result<()> {
        let candidate = Candidate::try_from(addr)?;
        let handle = self
            .slot_by_username(local_username)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        let unlocked = slot.unlocked.contains(&addr);
        let remote = slot.remote.as_mut().ok_or(Error::ErrIceSlotNotExisted)?;
        if remote.candidates.contains(&candidate) {
            return Ok(());
        }
        if remote.candidates.len() >= MAX_CANDIDATES {
            return Err(Error::ErrIceTooManyCandidates(MAX_CANDIDATES));
        }
        remote.candidates.push(candidate);
        slot.responded.push(unlocked);
        debug!("slot {handle}: remote candidate {candidate} added");

        if slot.use_turn {
            self.events.push_back(IceEvent::CreatePermissions {
                slot: handle,
                peers: vec![addr],
            });
            return Ok(());
        }
        self.check_new_candidate(now, handle, addr);
        Ok(())
    }

    /// Starts connectivity checks on a slot that waited for TURN permissions.
    pub fn start_checks(&mut self, now: Instant, handle: SlotHandle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        slot.awaiting_permissions = false;
        if slot.dtls_session.is_some() {
            return Ok(());
        }
        self.ice_start(now, handle);
        Ok(())
    }

    /// Finds the unbound slot a first DTLS datagram from `peer` belongs to. Only candidates
    /// that completed a check are admitted.
    pub fn accept_dtls_from(&self, peer: &SocketAddr) -> Option<SlotHandle> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.dtls_session.is_none() && slot.is_responded(peer))
            .map(|(handle, _)| handle)
    }

    /// Finds the DTLS session a datagram from `peer` belongs to when the peer moved to
    /// another of its checked candidates.
    pub fn session_for_candidate(&self, peer: &SocketAddr) -> Option<SlotHandle> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.is_responded(peer))
            .find_map(|(_, slot)| slot.dtls_session)
    }

    /// Binds a DTLS session to the slot. Connectivity and periodic checks stop.
    pub fn bind_dtls(&mut self, handle: SlotHandle, session: SlotHandle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        if slot.dtls_session.is_some_and(|s| s != session) {
            return Err(Error::ErrIceSlotBusy);
        }
        slot.dtls_session = Some(session);
        slot.stop_checks();
        debug!("slot {handle}: bound to dtls session {session}");
        Ok(())
    }

    /// Drops the slot, as when its DTLS session closed.
    pub fn clear_slot(&mut self, handle: SlotHandle) -> Option<IceSlot> {
        let slot = self.slots.remove(handle);
        if slot.is_some() {
            debug!("slot {handle}: cleared");
        }
        slot
    }

    /// Sends a consent freshness probe for the DTLS session bound to `handle`.
    pub fn send_consent_request(
        &mut self,
        now: Instant,
        handle: SlotHandle,
        path: TransportPath,
        transaction_id: TransactionId,
    ) -> Result<()> {
        self.send_request(now, handle, path, false, transaction_id)
    }

    /// Stores `slot` in a free entry, or in place of the oldest expired offer that has no
    /// DTLS session.
    fn allocate(&mut self, now: Instant, slot: IceSlot) -> Result<SlotHandle> {
        match self.slots.insert(slot) {
            Ok(handle) => Ok(handle),
            Err(slot) => {
                let victim = self
                    .slots
                    .iter()
                    .filter(|(_, s)| s.dtls_session.is_none() && s.is_expired(now, &self.config))
                    .min_by_key(|(_, s)| s.created_at)
                    .map(|(h, _)| h.index());
                let index = victim.ok_or(Error::ErrIceNoFreeSlot)?;
                let (handle, _) = self
                    .slots
                    .replace(index, slot)
                    .ok_or(Error::ErrIceNoFreeSlot)?;
                debug!("slot {handle}: reusing expired offer");
                Ok(handle)
            }
        }
    }

    fn assign_credentials(
        &mut self,
        handle: SlotHandle,
        inherited: Option<(String, String)>,
    ) -> Result<()> {
        let (username, key) = match inherited {
            Some(credentials) => credentials,
            None => {
                let username =
                    generate_username(handle.index()).ok_or(Error::ErrIceNoFreeSlot)?;
                let key = derive_key(username.as_bytes(), &self.secret);
                (username, key)
            }
        };
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or(Error::ErrIceSlotNotExisted)?;
        slot.local_username = username;
        slot.local_key = key;
        Ok(())
    }

    fn find_by_remote(&self, username: &str, key: &str) -> Option<(SlotHandle, bool)> {
        self.slots.iter().find_map(|(handle, slot)| {
            let remote = slot.remote.as_ref()?;
            (remote.username == username && remote.key == key)
                .then_some((handle, slot.dtls_session.is_some()))
        })
    }

    fn apply_offer(
        &mut self,
        now: Instant,
        mut remote: IceOffer,
        local_credentials: Option<(&str, &str)>,
    ) -> Result<SlotHandle> {
        // a relaying peer is reached at its relayed address
        if let Some(relay) = remote.relay
            && !remote.candidates.contains(&relay)
            && remote.candidates.len() < MAX_CANDIDATES
        {
            remote.candidates.push(relay);
        }
        let mut slot = IceSlot::new(now, self.config.turn_mode == TurnMode::AlwaysRelay);
        slot.dtls_initiator = remote.is_dtls_server();
        slot.peer_has_active_offer = !slot.dtls_initiator;
        slot.responded = vec![false; remote.candidates.len()];
        slot.remote = Some(remote);

        let (handle, inherited) = if let Some((username, key)) = local_credentials {
            if username.len() != LEN_USERNAME || key.len() != LEN_KEY {
                return Err(Error::ErrIceCredentialsLength);
            }
            let index = char_to_slot(username.as_bytes()[0])
                .filter(|&i| i < self.slots.capacity())
                .ok_or(Error::ErrIceSlotNotExisted)?;
            if let Some(current) = self.slots.handle_at(index)
                && self
                    .slots
                    .get(current)
                    .is_some_and(|s| s.dtls_session.is_some())
            {
                return Err(Error::ErrIceSlotBusy);
            }
            let (handle, evicted) = self
                .slots
                .replace(index, slot)
                .ok_or(Error::ErrIceSlotNotExisted)?;

            // our own offer may already have been probed by the answering peer
            if let Some(old) = evicted
                && old.remote.is_none()
                && old.local_username == username
                && let Some(slot) = self.slots.get_mut(handle)
            {
                for addr in old.unlocked {
                    slot.mark_responded(addr);
                }
            }
            (handle, Some((username.to_owned(), key.to_owned())))
        } else {
            let existing = slot
                .remote
                .as_ref()
                .and_then(|r| self.find_by_remote(&r.username, &r.key));
            match existing {
                Some((_, true)) => return Err(Error::ErrIceSlotBusy),
                Some((current, false)) => {
                    let (handle, evicted) = self
                        .slots
                        .replace(current.index(), slot)
                        .ok_or(Error::ErrIceSlotNotExisted)?;
                    debug!("slot {handle}: offer renegotiated");
                    (handle, evicted.map(|old| (old.local_username, old.local_key)))
                }
                None => (self.allocate(now, slot)?, None),
            }
        };
        self.assign_credentials(handle, inherited)?;

        let (use_turn, peers) = {
            let slot = self.slots.get(handle).ok_or(Error::ErrIceSlotNotExisted)?;
            let peers: Vec<SocketAddr> = slot
                .remote
                .as_ref()
                .map(|r| r.candidates.iter().map(|c| c.addr()).collect())
                .unwrap_or_default();
            debug!(
                "slot {handle}: remote offer set, {} candidates, {}",
                peers.len(),
                if slot.is_controlling() {
                    "controlling"
                } else {
                    "controlled"
                }
            );
            (slot.use_turn, peers)
        };

        if use_turn && !peers.is_empty() {
            if let Some(slot) = self.slots.get_mut(handle) {
                slot.awaiting_permissions = true;
            }
            self.events.push_back(IceEvent::CreatePermissions {
                slot: handle,
                peers,
            });
        } else {
            self.ice_start(now, handle);
        }
        Ok(handle)
    }

    fn local_offer(&self, handle: SlotHandle) -> Result<IceOffer> {
        let slot = self.slots.get(handle).ok_or(Error::ErrIceSlotNotExisted)?;
        let candidates = if self.config.turn_mode == TurnMode::AlwaysRelay {
            vec![]
        } else {
            self.local_candidates
                .iter()
                .take(MAX_CANDIDATES)
                .copied()
                .collect()
        };
        Ok(IceOffer {
            flags: if slot.dtls_initiator {
                0
            } else {
                FLAG_DTLS_SERVER
            },
            username: slot.local_username.clone(),
            key: slot.local_key.clone(),
            fingerprint: self.config.fingerprint.clone(),
            candidates,
            relay: if slot.use_turn {
                self.relayed_addr
            } else {
                None
            },
        })
    }

    /// Builds and queues a binding request towards the slot's remote peer.
    pub(crate) fn send_request(
        &mut self,
        now: Instant,
        handle: SlotHandle,
        path: TransportPath,
        use_candidate: bool,
        transaction_id: TransactionId,
    ) -> Result<()> {
        let slot = self.slots.get(handle).ok_or(Error::ErrIceSlotNotExisted)?;
        let remote = slot.remote.as_ref().ok_or(Error::ErrIceSlotNotExisted)?;

        let username = format!("{}:{}", remote.username, slot.local_username);
        let role = if slot.is_controlling() {
            Role::Controlling
        } else {
            Role::Controlled
        };

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(BINDING_REQUEST),
            Box::new(transaction_id),
            Box::new(Username::new(ATTR_USERNAME, username)),
        ];
        if use_candidate {
            setters.push(Box::new(UseCandidateAttr));
        }
        setters.push(Box::new(AttrControl {
            role,
            tie_breaker: TieBreaker(slot.tie_breaker),
        }));
        setters.push(Box::new(XorMappedAddress::from(path.peer_addr())));
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            remote.key.clone(),
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;

        trace!(
            "slot {handle}: binding request to {}{}",
            path.peer_addr(),
            if use_candidate { " (nominate)" } else { "" }
        );
        self.transmits.push_back(RoutedMessage {
            now,
            path,
            message: BytesMut::from(&msg.raw[..]),
        });
        Ok(())
    }
}
