use ice::agent::agent_config::{AgentConfig, TurnMode};
use sctp::AssociationConfig;
use std::net::SocketAddr;
use std::time::Duration;
use turn::client::ClientConfig;

/// Connected sessions start proving consent this long after the handshake.
pub(crate) const DEFAULT_CONSENT_START_DELAY: Duration = Duration::from_secs(15);
/// Interval between consent freshness probes.
pub(crate) const DEFAULT_CONSENT_INTERVAL: Duration = Duration::from_millis(500);
/// A session without a consent response for this long is torn down.
pub(crate) const DEFAULT_CONSENT_TIMEOUT: Duration = Duration::from_secs(15);

/// EndpointConfig collects the arguments to `Endpoint` construction into a single structure.
pub struct EndpointConfig {
    /// Address of the UDP socket peer datagrams use.
    pub local_addr: SocketAddr,
    pub consent_freshness: bool,
    pub consent_start_delay: Duration,
    pub consent_interval: Duration,
    pub consent_timeout: Duration,
    /// Offer slots, host candidates, fingerprint and TURN mode.
    pub agent: AgentConfig,
    pub sctp: AssociationConfig,
    /// The TURN control connection, used unless the agent's mode is `TurnMode::Disabled`.
    pub turn: Option<ClientConfig>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            consent_freshness: true,
            consent_start_delay: DEFAULT_CONSENT_START_DELAY,
            consent_interval: DEFAULT_CONSENT_INTERVAL,
            consent_timeout: DEFAULT_CONSENT_TIMEOUT,
            agent: AgentConfig::default(),
            sctp: AssociationConfig::default(),
            turn: None,
        }
    }
}

impl EndpointConfig {
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Host candidates advertised in offers and answers.
    pub fn with_local_candidates(mut self, candidates: Vec<SocketAddr>) -> Self {
        self.agent.local_candidates = candidates;
        self
    }

    /// Fingerprint of our DTLS certificate, advertised in offers and answers.
    pub fn with_fingerprint(mut self, fingerprint: Vec<u8>) -> Self {
        self.agent.fingerprint = fingerprint;
        self
    }

    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.agent.max_slots = max_slots;
        self
    }

    pub fn with_consent_freshness(mut self, enabled: bool) -> Self {
        self.consent_freshness = enabled;
        self
    }

    pub fn with_turn(mut self, mode: TurnMode, config: ClientConfig) -> Self {
        self.agent.turn_mode = mode;
        self.turn = Some(config);
        self
    }

    pub(crate) fn turn_enabled(&self) -> bool {
        self.agent.turn_mode != TurnMode::Disabled && self.turn.is_some()
    }
}
