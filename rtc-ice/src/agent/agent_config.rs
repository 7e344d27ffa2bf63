use std::net::SocketAddr;
use std::time::Duration;

use super::*;

/// Default number of ICE slots, one per concurrent offer.
pub(crate) const DEFAULT_MAX_SLOTS: usize = 10;

/// An offer without a DTLS session may be reused once it is older than this.
pub(crate) const DEFAULT_OFFER_TTL: Duration = Duration::from_secs(60);

/// Time the controlling side collects responses before nominating.
pub(crate) const DEFAULT_FINALIZE_DELAY: Duration = Duration::from_secs(3);

/// Window each connectivity check is jittered into.
pub(crate) const DEFAULT_CHECK_DELAY_MIN: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_CHECK_DELAY_MAX: Duration = Duration::from_millis(500);

/// Binding requests queued per remote candidate on every check round.
pub(crate) const DEFAULT_REQUESTS_PER_CANDIDATE: usize = 2;

/// Range of the controlled side's periodic check interval.
pub(crate) const DEFAULT_KEEPALIVE_MIN: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_KEEPALIVE_MAX: Duration = Duration::from_secs(15);

/// How the agent uses the TURN relay.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TurnMode {
    /// No relay.
    #[default]
    Disabled,
    /// The relay is allocated, but peers are reached directly.
    Enabled,
    /// Every peer datagram is relayed and no direct candidates are advertised.
    AlwaysRelay,
}

/// Collects the arguments to `ice::Agent` construction into a single structure.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Size of the slot table. Slot indices travel in usernames and transaction ids,
    /// so the table is capped at `MAX_ENCODABLE_SLOTS`.
    pub max_slots: usize,
    pub offer_ttl: Duration,
    pub finalize_delay: Duration,
    pub check_delay_min: Duration,
    pub check_delay_max: Duration,
    pub requests_per_candidate: usize,
    pub keepalive_min: Duration,
    pub keepalive_max: Duration,
    /// Reverse checks sent in reply to inbound requests, per offer.
    /// Defaults to `max_slots` when `None`.
    pub max_requery: Option<usize>,

    /// Secret the integrity keys are derived from; random when `None`.
    pub secret: Option<[u8; LEN_SECRET]>,
    /// DTLS certificate fingerprint advertised in offers and answers.
    pub fingerprint: Vec<u8>,
    /// Host candidates advertised in offers and answers, capped at `MAX_CANDIDATES`.
    pub local_candidates: Vec<SocketAddr>,
    pub turn_mode: TurnMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            offer_ttl: DEFAULT_OFFER_TTL,
            finalize_delay: DEFAULT_FINALIZE_DELAY,
            check_delay_min: DEFAULT_CHECK_DELAY_MIN,
            check_delay_max: DEFAULT_CHECK_DELAY_MAX,
            requests_per_candidate: DEFAULT_REQUESTS_PER_CANDIDATE,
            keepalive_min: DEFAULT_KEEPALIVE_MIN,
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
            max_requery: None,
            secret: None,
            fingerprint: vec![],
            local_candidates: vec![],
            turn_mode: TurnMode::default(),
        }
    }
}

impl AgentConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_slots == 0 || self.max_slots > MAX_ENCODABLE_SLOTS {
            return Err(Error::Other(format!(
                "max_slots must be within 1..={MAX_ENCODABLE_SLOTS}, got {}",
                self.max_slots
            )));
        }
        if self.fingerprint.len() > u8::MAX as usize {
            return Err(Error::ErrIceOfferFieldTooLong);
        }
        if self.check_delay_min > self.check_delay_max || self.keepalive_min > self.keepalive_max
        {
            return Err(Error::Other("jitter window minimum exceeds maximum".to_owned()));
        }
        Ok(())
    }
}
