use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum BindingState {
    Request,
    Ready,
    Refresh,
    Failed,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Binding {
    pub(crate) number: u16,
    pub(crate) st: BindingState,
    pub(crate) addr: SocketAddr,
    pub(crate) refreshed_at: Instant,
}

impl Binding {
    pub(crate) fn set_state(&mut self, state: BindingState) {
        self.st = state;
    }

    pub(crate) fn state(&self) -> BindingState {
        self.st
    }

    pub(crate) fn set_refreshed_at(&mut self, at: Instant) {
        self.refreshed_at = at;
    }

    pub(crate) fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }
}

// BindingManager maps channel numbers to peer addresses and back.
#[derive(Default)]
pub(crate) struct BindingManager {
    chan_map: HashMap<u16, SocketAddr>,
    addr_map: HashMap<SocketAddr, Binding>,
}

impl BindingManager {
    pub(crate) fn new() -> Self {
        BindingManager {
            chan_map: HashMap::new(),
            addr_map: HashMap::new(),
        }
    }

    // create binds `number` to `addr`, replacing whatever either side was bound to.
    pub(crate) fn create(&mut self, number: u16, addr: SocketAddr, now: Instant) {
        if let Some(old_addr) = self.chan_map.insert(number, addr)
            && old_addr != addr
        {
            self.addr_map.remove(&old_addr);
        }
        if let Some(old) = self.addr_map.get(&addr)
            && old.number != number
        {
            self.chan_map.remove(&old.number);
        }
        self.addr_map.insert(
            addr,
            Binding {
                number,
                st: BindingState::Request,
                addr,
                refreshed_at: now,
            },
        );
    }

    pub(crate) fn find_by_addr(&self, addr: &SocketAddr) -> Option<&Binding> {
        self.addr_map.get(addr)
    }

    pub(crate) fn get_by_addr(&mut self, addr: &SocketAddr) -> Option<&mut Binding> {
        self.addr_map.get_mut(addr)
    }

    pub(crate) fn find_by_number(&self, number: u16) -> Option<&Binding> {
        self.chan_map
            .get(&number)
            .and_then(|addr| self.addr_map.get(addr))
    }

    pub(crate) fn get_by_number(&mut self, number: u16) -> Option<&mut Binding> {
        let addr = *self.chan_map.get(&number)?;
        self.addr_map.get_mut(&addr)
    }

    pub(crate) fn delete_by_number(&mut self, number: u16) -> bool {
        if let Some(addr) = self.chan_map.remove(&number) {
            self.addr_map.remove(&addr);
            true
        } else {
            false
        }
    }

    pub(crate) fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.addr_map.values()
    }

    pub(crate) fn size(&self) -> usize {
        self.addr_map.len()
    }
}
