use super::*;
use stun::error_code::*;

/// Outcome of comparing the role claimed by an inbound request with ours.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RoleVerdict {
    Compatible,
    /// We keep our role; the peer gets a 487.
    Conflict,
    /// We lost the tie-break and take the other role.
    Switch,
}

fn role_verdict(controlling: bool, ours: u64, peer: AttrControl) -> RoleVerdict {
    match (controlling, peer.role) {
        (_, Role::Unspecified) => RoleVerdict::Compatible,
        (false, Role::Controlling) | (true, Role::Controlled) => RoleVerdict::Compatible,
        (false, Role::Controlled) => {
            if ours < peer.tie_breaker.0 {
                RoleVerdict::Conflict
            } else {
                RoleVerdict::Switch
            }
        }
        (true, Role::Controlling) => {
            if ours >= peer.tie_breaker.0 {
                RoleVerdict::Conflict
            } else {
                RoleVerdict::Switch
            }
        }
    }
}

impl Agent {
    /// (Re)starts the check sequence of a slot according to its current role.
    pub(crate) fn ice_start(&mut self, now: Instant, handle: SlotHandle) {
        let Some(slot) = self.slots.get_mut(handle) else {
            return;
        };
        slot.stop_checks();
        slot.nominated = None;
        if slot.is_controlling() {
            slot.checking = true;
            slot.finalize_at = Some(now + self.config.finalize_delay);
            self.queue_checks(now, handle);
        } else {
            self.periodic_check(now, handle);
        }
    }

    /// Queues `requests_per_candidate` jittered binding requests per remote candidate.
    fn queue_checks(&mut self, now: Instant, handle: SlotHandle) {
        let config = &self.config;
        let Some(slot) = self.slots.get_mut(handle) else {
            return;
        };
        let Some(remote) = &slot.remote else {
            return;
        };
        for candidate in &remote.candidates {
            for _ in 0..config.requests_per_candidate {
                slot.pending_checks.push(PendingCheck {
                    due: now + jitter(config.check_delay_min, config.check_delay_max),
                    target: candidate.addr(),
                    use_candidate: false,
                });
            }
        }
    }

    /// Picks up a trickled candidate on a slot whose checks are already running.
    pub(crate) fn check_new_candidate(&mut self, now: Instant, handle: SlotHandle, addr: SocketAddr) {
        let config = &self.config;
        let Some(slot) = self.slots.get_mut(handle) else {
            return;
        };
        if slot.dtls_session.is_some() {
            return;
        }
        if slot.is_controlling() {
            for _ in 0..config.requests_per_candidate {
                slot.pending_checks.push(PendingCheck {
                    due: now + jitter(config.check_delay_min, config.check_delay_max),
                    target: addr,
                    use_candidate: false,
                });
            }
            if slot.finalize_at.is_none() && slot.nominated.is_none() {
                slot.checking = true;
                slot.finalize_at = Some(now + config.finalize_delay);
            }
        } else if slot.keepalive_at.is_none() {
            self.periodic_check(now, handle);
        }
    }

    /// One round of the controlled side's checks, rescheduled until DTLS binds or the
    /// offer expires.
    fn periodic_check(&mut self, now: Instant, handle: SlotHandle) {
        let Some(slot) = self.slots.get_mut(handle) else {
            return;
        };
        let has_candidates = slot
            .remote
            .as_ref()
            .is_some_and(|r| !r.candidates.is_empty());
        if slot.dtls_session.is_some() || !has_candidates || slot.is_expired(now, &self.config) {
            slot.keepalive_at = None;
            return;
        }
        slot.keepalive_at = Some(now + jitter(self.config.keepalive_min, self.config.keepalive_max));
        self.queue_checks(now, handle);
    }

    /// Nominates the first candidate that answered, in advertised order.
    fn finalize(&mut self, now: Instant, handle: SlotHandle) -> Result<()> {
        let (chosen, expired) = {
            let Some(slot) = self.slots.get_mut(handle) else {
                return Ok(());
            };
            slot.finalize_at = None;
            slot.checking = false;
            slot.pending_checks.clear();
            (
                slot.responded_candidates().first().copied(),
                slot.is_expired(now, &self.config),
            )
        };

        let Some(peer) = chosen else {
            if expired {
                debug!("slot {handle}: no candidate responded, offer expired");
            } else {
                debug!("slot {handle}: no candidate responded, checking again");
                self.ice_start(now, handle);
            }
            return Ok(());
        };

        let (path, initiate_dtls) = {
            let slot = self.slots.get_mut(handle).ok_or(Error::ErrIceSlotNotExisted)?;
            slot.nominated = Some(peer);
            (slot.path_to(peer), slot.dtls_initiator)
        };
        self.send_request(
            now,
            handle,
            path,
            true,
            TransactionId::with_prefix(handle.index() as u8),
        )?;
        debug!("slot {handle}: nominated {peer}");
        self.events.push_back(IceEvent::Nominated {
            slot: handle,
            path,
            initiate_dtls,
        });
        Ok(())
    }

    /// Fires the due checks, nominations and periodic rounds of every slot.
    pub(crate) fn handle_slot_timeouts(&mut self, now: Instant) -> Result<()> {
        for handle in self.slots.handles() {
            let (due, finalize, periodic) = {
                let Some(slot) = self.slots.get_mut(handle) else {
                    continue;
                };
                let (due, waiting): (Vec<PendingCheck>, Vec<PendingCheck>) = slot
                    .pending_checks
                    .drain(..)
                    .partition(|check| check.due <= now);
                slot.pending_checks = waiting;
                (
                    due,
                    slot.finalize_at.is_some_and(|at| at <= now),
                    slot.keepalive_at.is_some_and(|at| at <= now),
                )
            };

            for check in due {
                let path = match self.slots.get(handle) {
                    Some(slot) => slot.path_to(check.target),
                    None => break,
                };
                self.send_request(
                    now,
                    handle,
                    path,
                    check.use_candidate,
                    TransactionId::with_prefix(handle.index() as u8),
                )?;
            }
            if finalize {
                self.finalize(now, handle)?;
            }
            if periodic {
                self.periodic_check(now, handle);
            }
        }
        Ok(())
    }

    /// Answers an authenticated binding request. Requests that fail authentication or
    /// refer to a stale offer are dropped.
    pub(crate) fn handle_binding_request(
        &mut self,
        now: Instant,
        path: TransportPath,
        m: &mut Message,
    ) -> Result<()> {
        let peer = path.peer_addr();
        if FINGERPRINT.check(m).is_err() {
            trace!("binding request from {peer} without valid fingerprint");
            return Ok(());
        }
        let Ok(username) = Username::get_from_as(m, ATTR_USERNAME) else {
            trace!("binding request from {peer} without username");
            return Ok(());
        };
        let local_username = username.text.split(':').next().unwrap_or_default();
        if local_username.len() < LEN_USERNAME || !local_username.is_char_boundary(LEN_USERNAME) {
            trace!("binding request from {peer} with short username");
            return Ok(());
        }
        let local_username = &local_username[..LEN_USERNAME];

        let key = derive_key(local_username.as_bytes(), &self.secret);
        let integrity = MessageIntegrity::new_short_term_integrity(key);
        if integrity.check(m).is_err() {
            trace!("binding request from {peer} failed integrity check");
            return Ok(());
        }

        let Some(handle) = self.slot_by_username(local_username) else {
            trace!("binding request from {peer} for stale username {local_username}");
            return Ok(());
        };

        let mut control = AttrControl::default();
        if let Err(err) = control.get_from(m) {
            trace!("binding request from {peer} with bad control attribute: {err}");
            return Ok(());
        }

        let (verdict, nominated) = {
            let slot = self.slots.get_mut(handle).ok_or(Error::ErrIceSlotNotExisted)?;
            slot.mark_responded(peer);
            if slot.remote.is_none() {
                // our own offer, the answer has not been applied yet
                return Ok(());
            }
            let verdict = role_verdict(slot.is_controlling(), slot.tie_breaker, control);
            let nominated = verdict == RoleVerdict::Compatible
                && !slot.is_controlling()
                && slot.dtls_session.is_none()
                && slot.nominated.is_none()
                && UseCandidateAttr::is_set(m)
                && slot.is_responded(&peer);
            if nominated {
                slot.nominated = Some(peer);
            }
            (verdict, nominated)
        };

        if verdict == RoleVerdict::Switch {
            if let Some(slot) = self.slots.get_mut(handle) {
                slot.peer_has_active_offer = !slot.peer_has_active_offer;
                debug!(
                    "slot {handle}: role conflict with {peer}, switching to {}",
                    if slot.is_controlling() {
                        Role::Controlling
                    } else {
                        Role::Controlled
                    }
                );
            }
            self.ice_start(now, handle);
            return Ok(());
        }

        self.send_binding_reply(now, handle, path, m.transaction_id, verdict)?;

        if nominated {
            let initiate_dtls = self
                .slots
                .get(handle)
                .is_some_and(|slot| slot.dtls_initiator);
            debug!("slot {handle}: peer nominated {peer}");
            self.events.push_back(IceEvent::Nominated {
                slot: handle,
                path,
                initiate_dtls,
            });
        }

        // triggered check back towards the requester
        let requery = {
            let max_requery = self.max_requery;
            let slot = self.slots.get_mut(handle).ok_or(Error::ErrIceSlotNotExisted)?;
            let has_candidates = slot
                .remote
                .as_ref()
                .is_some_and(|r| !r.candidates.is_empty());
            if has_candidates && slot.requery_count < max_requery {
                slot.requery_count += 1;
                true
            } else {
                false
            }
        };
        if requery {
            self.send_request(
                now,
                handle,
                path,
                false,
                TransactionId::with_prefix(handle.index() as u8),
            )?;
        }
        Ok(())
    }

    fn send_binding_reply(
        &mut self,
        now: Instant,
        handle: SlotHandle,
        path: TransportPath,
        transaction_id: TransactionId,
        verdict: RoleVerdict,
    ) -> Result<()> {
        let slot = self.slots.get(handle).ok_or(Error::ErrIceSlotNotExisted)?;

        let mut setters: Vec<Box<dyn Setter>> = vec![];
        if verdict == RoleVerdict::Conflict {
            setters.push(Box::new(BINDING_ERROR));
        } else {
            setters.push(Box::new(BINDING_SUCCESS));
        }
        setters.push(Box::new(transaction_id));
        setters.push(Box::new(XorMappedAddress::from(path.peer_addr())));
        if verdict == RoleVerdict::Conflict {
            setters.push(Box::new(ErrorCodeAttribute {
                code: CODE_ROLE_CONFLICT,
                reason: b"Role Conflict".to_vec(),
            }));
        }
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            slot.local_key.clone(),
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;

        if verdict == RoleVerdict::Conflict {
            debug!("slot {handle}: role conflict with {}, sent 487", path.peer_addr());
        }
        self.transmits.push_back(RoutedMessage {
            now,
            path,
            message: BytesMut::from(&msg.raw[..]),
        });
        Ok(())
    }

    /// Records a binding success. The first transaction id byte routes it either to an
    /// ICE slot or, with the top bit set, to the consent probe of a DTLS session.
    pub(crate) fn handle_success_response(
        &mut self,
        path: TransportPath,
        m: &mut Message,
    ) -> Result<()> {
        let peer = path.peer_addr();
        let prefix = m.transaction_id.0[0];

        if (prefix as usize) < self.slots.capacity() {
            let Some(handle) = self.slots.handle_at(prefix as usize) else {
                trace!("binding success from {peer} for empty slot {prefix}");
                return Ok(());
            };
            let Some(slot) = self.slots.get_mut(handle) else {
                return Ok(());
            };
            let Some(remote) = &slot.remote else {
                return Ok(());
            };
            let integrity = MessageIntegrity::new_short_term_integrity(remote.key.clone());
            if integrity.check(m).is_err() {
                trace!("binding success from {peer} failed integrity check");
                return Ok(());
            }
            if slot.is_controlling() && slot.dtls_session.is_none() && slot.mark_responded(peer) {
                debug!("slot {handle}: candidate {peer} responded");
            }
            return Ok(());
        }

        let session_index = (prefix ^ CONSENT_PREFIX) as usize;
        if session_index >= self.slots.capacity() {
            trace!("binding success from {peer} with unknown transaction");
            return Ok(());
        }
        let found = self.slots.iter().find_map(|(_, slot)| {
            let session = slot.dtls_session.filter(|s| s.index() == session_index)?;
            Some((session, slot.remote.as_ref()?.key.clone()))
        });
        let Some((session, key)) = found else {
            trace!("consent response from {peer} for unbound session {session_index}");
            return Ok(());
        };
        if MessageIntegrity::new_short_term_integrity(key)
            .check(m)
            .is_err()
        {
            trace!("consent response from {peer} failed integrity check");
            return Ok(());
        }
        self.events.push_back(IceEvent::ConsentResponse {
            session,
            transaction_id: m.transaction_id,
        });
        Ok(())
    }
}
