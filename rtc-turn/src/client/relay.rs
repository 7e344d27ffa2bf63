use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::ops::Add;
use std::time::{Duration, Instant};

use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::*;
use stun::message::*;
use stun::textattrs::*;

use super::binding::*;
use super::permission::*;
use super::transaction::*;
use crate::proto;
use crate::proto::chandata::ChannelData;
use crate::proto::channum::ChannelNumber;

use crate::client::{Client, Event, RelayedAddr};
use shared::error::{Error, Result};

const PERM_REFRESH_INTERVAL: Duration = Duration::from_secs(120);
const BINDING_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

// RelayState is the allocation held by a Client
pub(crate) struct RelayState {
    pub(crate) relayed_addr: RelayedAddr,
    pub(crate) nonce: Nonce,
    pub(crate) lifetime: Duration,
    perm_map: PermissionMap,
    refresh_alloc_timer: Instant,
    refresh_perms_timer: Instant,
}

impl RelayState {
    pub(crate) fn new(
        relayed_addr: RelayedAddr,
        nonce: Nonce,
        lifetime: Duration,
        now: Instant,
    ) -> Self {
        debug!("initial lifetime: {} seconds", lifetime.as_secs());

        Self {
            relayed_addr,
            nonce,
            lifetime,
            perm_map: PermissionMap::new(),
            refresh_alloc_timer: now.add(lifetime / 2),
            refresh_perms_timer: now.add(PERM_REFRESH_INTERVAL),
        }
    }

    fn set_nonce_from_msg(&mut self, msg: &Message) -> bool {
        match Nonce::get_from_as(msg, ATTR_NONCE) {
            Ok(nonce) => {
                self.nonce = nonce;
                debug!("438 (Stale Nonce), got new nonce");
                true
            }
            Err(_) => {
                warn!("438 (Stale Nonce) but no nonce");
                false
            }
        }
    }
}

// error_code_of returns the ERROR-CODE of a response, if it carries a valid one.
fn error_code_of(res: &Message) -> Option<ErrorCodeAttribute> {
    let mut code = ErrorCodeAttribute::default();
    code.get_from(res).ok().map(|_| code)
}

fn error_of(res: &Message) -> Error {
    match error_code_of(res) {
        Some(code) => Error::Other(format!("{} (error {})", res.typ, code)),
        None => Error::Other(format!("{}", res.typ)),
    }
}

/// Relay operates on the allocation of a Client: permissions, channel bindings,
/// relayed sends and the periodic refreshes that keep all of them alive.
pub struct Relay<'a> {
    pub(crate) relayed_addr: RelayedAddr,
    pub(crate) client: &'a mut Client,
}

impl Relay<'_> {
    pub fn relayed_addr(&self) -> RelayedAddr {
        self.relayed_addr
    }

    fn state(&mut self) -> Result<&mut RelayState> {
        self.client.relay.as_mut().ok_or(Error::ErrNoAllocation)
    }

    /// create_permission installs a permission for the IP of `peer_addr` unless
    /// one is already requested or granted.
    pub fn create_permission(&mut self, now: Instant, peer_addr: SocketAddr) -> Result<()> {
        let relay = self.state()?;
        if !relay.perm_map.contains(&peer_addr) {
            relay.perm_map.insert(&peer_addr, Permission::default());
        }

        if relay
            .perm_map
            .get(&peer_addr)
            .is_some_and(|perm| perm.state() == PermState::Idle)
        {
            self.create_permissions(now, &[peer_addr])?;
        }
        Ok(())
    }

    /// create_permissions sends a single CreatePermission request covering all peers.
    pub fn create_permissions(
        &mut self,
        now: Instant,
        peer_addrs: &[SocketAddr],
    ) -> Result<TransactionId> {
        self.send_create_permissions(now, peer_addrs.to_vec(), false)
    }

    fn send_create_permissions(
        &mut self,
        now: Instant,
        peer_addrs: Vec<SocketAddr>,
        retried: bool,
    ) -> Result<TransactionId> {
        {
            let relay = self.state()?;
            for addr in &peer_addrs {
                match relay.perm_map.get_mut(addr) {
                    Some(perm) => {
                        if perm.state() == PermState::Idle {
                            perm.set_state(PermState::Requested);
                        }
                    }
                    None => {
                        let mut perm = Permission::default();
                        perm.set_state(PermState::Requested);
                        relay.perm_map.insert(addr, perm);
                    }
                }
            }
        }

        let setters: Vec<Box<dyn Setter>> = peer_addrs
            .iter()
            .map(|addr| Box::new(proto::peeraddr::PeerAddress::from(*addr)) as Box<dyn Setter>)
            .collect();
        let msg = self.client.authenticated(
            MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST),
            setters,
        )?;

        self.client.perform_transaction(
            now,
            &msg,
            TransactionType::CreatePermissionRequest(peer_addrs, retried),
        )
    }

    pub(super) fn handle_create_permission_response(
        &mut self,
        now: Instant,
        res: Message,
        peer_addrs: Vec<SocketAddr>,
        retried: bool,
    ) -> Result<()> {
        if res.typ.class == CLASS_ERROR_RESPONSE {
            if !retried && self.renew_nonce(&res)? {
                self.send_create_permissions(now, peer_addrs, true)?;
                return Ok(());
            }

            let relay = self.state()?;
            for addr in &peer_addrs {
                relay.perm_map.delete(addr);
            }
            let err = error_of(&res);
            warn!("create permission failed: {err}");
            self.client
                .events
                .push_back(Event::CreatePermissionError(res.transaction_id, err));
        } else {
            let relay = self.state()?;
            for addr in &peer_addrs {
                if let Some(perm) = relay.perm_map.get_mut(addr) {
                    perm.set_state(PermState::Permitted);
                }
            }
            self.client
                .events
                .push_back(Event::CreatePermissionResponse(res.transaction_id));
        }

        Ok(())
    }

    // renew_nonce picks up the fresh nonce of a 438 response; true when the
    // request is worth re-issuing.
    fn renew_nonce(&mut self, res: &Message) -> Result<bool> {
        match error_code_of(res) {
            Some(code) if code.code == CODE_STALE_NONCE => Ok(self.state()?.set_nonce_from_msg(res)),
            _ => Ok(false),
        }
    }

    /// create_channel_binding binds `number` to `peer_addr` on the server. Until the
    /// binding is confirmed data to the peer still goes out in Send indications.
    pub fn create_channel_binding(
        &mut self,
        now: Instant,
        number: ChannelNumber,
        peer_addr: SocketAddr,
    ) -> Result<TransactionId> {
        if !number.valid() {
            return Err(Error::ErrInvalidChannelNumber);
        }
        self.state()?;
        self.client.binding_mgr.create(number.0, peer_addr, now);
        self.send_channel_bind(now, number, peer_addr, false)
    }

    fn send_channel_bind(
        &mut self,
        now: Instant,
        number: ChannelNumber,
        peer_addr: SocketAddr,
        retried: bool,
    ) -> Result<TransactionId> {
        let msg = self.client.authenticated(
            MessageType::new(METHOD_CHANNEL_BIND, CLASS_REQUEST),
            vec![
                Box::new(proto::peeraddr::PeerAddress::from(peer_addr)),
                Box::new(number),
            ],
        )?;

        debug!("binding channel {number} to {peer_addr}");
        self.client.perform_transaction(
            now,
            &msg,
            TransactionType::ChannelBindRequest(number, peer_addr, retried),
        )
    }

    pub(super) fn handle_channel_bind_response(
        &mut self,
        now: Instant,
        res: Message,
        number: ChannelNumber,
        peer_addr: SocketAddr,
        retried: bool,
    ) -> Result<()> {
        if res.typ.class == CLASS_ERROR_RESPONSE {
            if !retried && self.renew_nonce(&res)? {
                self.send_channel_bind(now, number, peer_addr, true)?;
                return Ok(());
            }

            let err = error_of(&res);
            warn!("channel bind {number} failed: {err}");
            if let Some(b) = self.client.binding_mgr.get_by_number(number.0) {
                b.set_state(BindingState::Failed);
            }
            self.client
                .events
                .push_back(Event::ChannelBindError(res.transaction_id, number, err));
        } else {
            if let Some(b) = self.client.binding_mgr.get_by_number(number.0) {
                b.set_state(BindingState::Ready);
                b.set_refreshed_at(now);
            }
            self.client.events.push_back(Event::ChannelBindResponse(
                res.transaction_id,
                number,
                peer_addr,
            ));
        }
        Ok(())
    }

    /// send_indication wraps `data` in a Send indication towards `peer_addr`.
    pub fn send_indication(&mut self, now: Instant, peer_addr: SocketAddr, data: &[u8]) -> Result<()> {
        self.state()?;
        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(proto::data::Data(data.to_vec())),
            Box::new(proto::peeraddr::PeerAddress::from(peer_addr)),
            Box::new(FINGERPRINT),
        ])?;

        // indication has no transaction (fire-and-forget)
        self.client.write_to(now, &msg.raw)
    }

    /// send_channel_data frames `data` as ChannelData on a bound channel.
    pub fn send_channel_data(&mut self, now: Instant, number: ChannelNumber, data: &[u8]) -> Result<()> {
        self.state()?;
        if self.client.binding_mgr.find_by_number(number.0).is_none() {
            return Err(Error::ErrChannelBindNotFound);
        }

        let mut ch_data = ChannelData {
            data: data.to_vec(),
            number,
            ..Default::default()
        };
        ch_data.encode();

        self.client.write_to(now, &ch_data.raw)
    }

    /// send_to relays `data` to `peer_addr`, over its channel once the binding is
    /// confirmed and in a Send indication otherwise.
    pub fn send_to(&mut self, now: Instant, peer_addr: SocketAddr, data: &[u8]) -> Result<()> {
        match self.client.channel_for(&peer_addr) {
            Some(number) => {
                trace!("relaying {} bytes to {peer_addr} on channel {number}", data.len());
                self.send_channel_data(now, number, data)
            }
            None => self.send_indication(now, peer_addr, data),
        }
    }

    /// close releases the allocation by refreshing it with a zero lifetime.
    pub fn close(&mut self, now: Instant) -> Result<()> {
        self.refresh_allocation(now, Duration::from_secs(0), false)?;
        self.client.relay = None;
        self.client.binding_mgr = BindingManager::new();
        Ok(())
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        let relay = self.client.relay.as_ref()?;
        let mut eto = relay.refresh_alloc_timer.min(relay.refresh_perms_timer);
        for b in self.client.binding_mgr.bindings() {
            if b.state() == BindingState::Ready {
                eto = eto.min(b.refreshed_at().add(BINDING_REFRESH_INTERVAL));
            }
        }
        Some(eto)
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        let Ok(relay) = self.state() else {
            return;
        };

        let refresh_alloc = if relay.refresh_alloc_timer <= now {
            relay.refresh_alloc_timer = now.add(relay.lifetime / 2);
            Some(relay.lifetime)
        } else {
            None
        };

        let refresh_perms = if relay.refresh_perms_timer <= now {
            relay.refresh_perms_timer = now.add(PERM_REFRESH_INTERVAL);
            Some(relay.perm_map.addrs())
        } else {
            None
        };

        if let Some(lifetime) = refresh_alloc
            && let Err(err) = self.refresh_allocation(now, lifetime, false)
        {
            warn!("refresh allocation failed: {err}");
        }
        if let Some(addrs) = refresh_perms
            && !addrs.is_empty()
            && let Err(err) = self.send_create_permissions(now, addrs, false)
        {
            warn!("refresh permissions failed: {err}");
        }

        let stale: Vec<(u16, SocketAddr)> = self
            .client
            .binding_mgr
            .bindings()
            .filter(|b| {
                b.state() == BindingState::Ready
                    && b.refreshed_at().add(BINDING_REFRESH_INTERVAL) <= now
            })
            .map(|b| (b.number, b.addr))
            .collect();
        for (number, addr) in stale {
            if let Some(b) = self.client.binding_mgr.get_by_number(number) {
                b.set_state(BindingState::Refresh);
            }
            if let Err(err) = self.send_channel_bind(now, ChannelNumber(number), addr, false) {
                warn!("refresh channel binding {number} failed: {err}");
            }
        }
    }

    fn refresh_allocation(&mut self, now: Instant, lifetime: Duration, retried: bool) -> Result<()> {
        let msg = self.client.authenticated(
            MessageType::new(METHOD_REFRESH, CLASS_REQUEST),
            vec![Box::new(proto::lifetime::Lifetime(lifetime))],
        )?;

        self.client.perform_transaction(
            now,
            &msg,
            TransactionType::RefreshRequest(lifetime, retried),
        )?;
        Ok(())
    }

    pub(super) fn handle_refresh_allocation_response(
        &mut self,
        now: Instant,
        res: Message,
        lifetime: Duration,
        retried: bool,
    ) -> Result<()> {
        if res.typ.class == CLASS_ERROR_RESPONSE {
            if !retried && self.renew_nonce(&res)? {
                return self.refresh_allocation(now, lifetime, true);
            }
            warn!("refresh allocation failed: {}", error_of(&res));
            return Ok(());
        }

        // Getting lifetime from response
        let mut updated_lifetime = proto::lifetime::Lifetime::default();
        if updated_lifetime.get_from(&res).is_ok() {
            let relay = self.state()?;
            relay.lifetime = updated_lifetime.0;
            relay.refresh_alloc_timer = now.add(relay.lifetime / 2);
            debug!("updated lifetime: {} seconds", relay.lifetime.as_secs());
        }
        Ok(())
    }
}
