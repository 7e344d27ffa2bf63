
use std::fmt;

use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

use shared::error::*;

const TIE_BREAKER_SIZE: usize = 8;

/// Common helper for ICE-{CONTROLLED,CONTROLLING} and represents the so-called Tiebreaker number.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct TieBreaker(pub u64);

impl TieBreaker {
    /// Adds Tiebreaker value to m as t attribute.
    pub fn add_to_as(self, m: &mut Message, t: AttrType) -> Result<()> {
        m.add(t, &self.0.to_be_bytes());
        Ok(())
    }

    /// Decodes Tiebreaker value in message getting it as for t type.
    pub fn get_from_as(&mut self, m: &Message, t: AttrType) -> Result<()> {
        let v = m.get(t)?;
        check_size(t, v.len(), TIE_BREAKER_SIZE)?;
        let mut b = [0u8; TIE_BREAKER_SIZE];
        b.copy_from_slice(&v[..TIE_BREAKER_SIZE]);
        self.0 = u64::from_be_bytes(b);
        Ok(())
    }
}

/// ICE-CONTROLLED attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlled(pub u64);

impl Setter for AttrControlled {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        TieBreaker(self.0).add_to_as(m, ATTR_ICE_CONTROLLED)
    }
}

impl Getter for AttrControlled {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let mut t = TieBreaker::default();
        t.get_from_as(m, ATTR_ICE_CONTROLLED)?;
        self.0 = t.0;
        Ok(())
    }
}

/// ICE-CONTROLLING attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlling(pub u64);

impl Setter for AttrControlling {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        TieBreaker(self.0).add_to_as(m, ATTR_ICE_CONTROLLING)
    }
}

impl Getter for AttrControlling {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let mut t = TieBreaker::default();
        t.get_from_as(m, ATTR_ICE_CONTROLLING)?;
        self.0 = t.0;
        Ok(())
    }
}

/// Role an ICE agent claims in its binding requests.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub enum Role {
    Controlling,
    Controlled,
    #[default]
    Unspecified,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Role::Controlling => "controlling",
            Role::Controlled => "controlled",
            Role::Unspecified => "unspecified",
        };
        write!(f, "{s}")
    }
}

/// Helper that wraps ICE-{CONTROLLED,CONTROLLING}.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControl {
    pub role: Role,
    pub tie_breaker: TieBreaker,
}

impl Setter for AttrControl {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        match self.role {
            Role::Controlling => self.tie_breaker.add_to_as(m, ATTR_ICE_CONTROLLING),
            Role::Controlled => self.tie_breaker.add_to_as(m, ATTR_ICE_CONTROLLED),
            Role::Unspecified => Ok(()),
        }
    }
}

impl Getter for AttrControl {
    /// Decodes the control attribute; a message carrying neither yields
    /// `Role::Unspecified` rather than an error.
    fn get_from(&mut self, m: &Message) -> Result<()> {
        if m.contains(ATTR_ICE_CONTROLLING) {
            self.role = Role::Controlling;
            return self.tie_breaker.get_from_as(m, ATTR_ICE_CONTROLLING);
        }
        if m.contains(ATTR_ICE_CONTROLLED) {
            self.role = Role::Controlled;
            return self.tie_breaker.get_from_as(m, ATTR_ICE_CONTROLLED);
        }
        self.role = Role::Unspecified;
        self.tie_breaker = TieBreaker::default();
        Ok(())
    }
}

/// USE-CANDIDATE attribute, the controlling side's nomination flag.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

impl UseCandidateAttr {
    pub fn is_set(m: &Message) -> bool {
        m.contains(ATTR_USE_CANDIDATE)
    }
}
