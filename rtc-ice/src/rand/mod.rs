#[cfg(test)]
mod rand_test;

use rand::{Rng, rng};
use ring::digest;
use std::time::Duration;

/// Length of the username we hand out in offers.
pub const LEN_USERNAME: usize = 8;
/// Length of the integrity key we hand out in offers.
pub const LEN_KEY: usize = 32;
/// Length of the module secret keys are derived from.
pub const LEN_SECRET: usize = 32;

/// Highest slot count a single username character can address.
pub const MAX_ENCODABLE_SLOTS: usize = 52;

/// Encodes a slot index as the first username character: `A..Z` then `a..z`.
pub fn slot_to_char(slot: usize) -> Option<char> {
    match slot {
        0..=25 => Some((b'A' + slot as u8) as char),
        26..=51 => Some((b'a' + (slot - 26) as u8) as char),
        _ => None,
    }
}

/// Recovers the slot index from the first username character.
pub fn char_to_slot(c: u8) -> Option<usize> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as usize),
        b'a'..=b'z' => Some((c - b'a') as usize + 26),
        _ => None,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generates an ICE username for `slot`: eight hex characters whose first one is replaced
/// by the slot character, so inbound requests route back without a lookup.
pub fn generate_username(slot: usize) -> Option<String> {
    let tag = slot_to_char(slot)?;
    let mut raw = [0u8; LEN_USERNAME / 2];
    rng().fill(&mut raw);
    let hex = to_hex(&raw);
    let mut username = String::with_capacity(LEN_USERNAME);
    username.push(tag);
    username.push_str(&hex[1..]);
    Some(username)
}

/// Derives the integrity key for `username` from the module secret:
/// `hex(first16(SHA-256(username[..8] || secret)))`.
///
/// Both sides of a check agree on the key without storing it, since the username travels
/// in every request.
pub fn derive_key(username: &[u8], secret: &[u8]) -> String {
    let user = &username[..username.len().min(LEN_USERNAME)];
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(user);
    ctx.update(secret);
    let d = ctx.finish();
    to_hex(&d.as_ref()[..LEN_KEY / 2])
}

/// Generates a fresh module secret.
pub fn generate_secret() -> [u8; LEN_SECRET] {
    let mut secret = [0u8; LEN_SECRET];
    rng().fill(&mut secret);
    secret
}

/// Generates the 64-bit ICE role tie-breaker.
pub fn generate_tie_breaker() -> u64 {
    rng().random()
}

/// Picks a uniformly random delay within `[min, max]` at millisecond granularity.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
    if lo >= hi {
        return min;
    }
    Duration::from_millis(rng().random_range(lo..=hi))
}
