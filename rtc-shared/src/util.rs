use rand::{Rng, rng};

// match_range is a MatchFunc that accepts packets with the first byte in [lower..upper]
fn match_range(lower: u8, upper: u8) -> impl Fn(&[u8]) -> bool {
    move |buf: &[u8]| -> bool {
        if buf.is_empty() {
            return false;
        }
        let b = buf[0];
        b >= lower && b <= upper
    }
}

/// MatchFuncs as described in RFC7983
/// <https://tools.ietf.org/html/rfc7983>
///              +----------------+
///              |        [0..3] -+--> forward to STUN
///              |                |
///              |      [20..63] -+--> forward to DTLS
///              |                |
///              |      [64..79] -+--> forward to TURN Channel
///              +----------------+
/// match_stun is a MatchFunc that accepts packets with the first byte in [0..3]
pub fn match_stun(b: &[u8]) -> bool {
    match_range(0, 3)(b)
}

/// match_dtls is a MatchFunc that accepts packets with the first byte in [20..63]
pub fn match_dtls(b: &[u8]) -> bool {
    match_range(20, 63)(b)
}

/// match_turn_channel is a MatchFunc that accepts packets with the first byte in [64..79]
pub fn match_turn_channel(b: &[u8]) -> bool {
    match_range(64, 79)(b)
}

/// Rounds `n` up to the next multiple of four, the alignment used by STUN attributes,
/// TURN ChannelData and SCTP chunks.
pub fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

const RUNES_ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// math_rand_alpha generates a random alphabet sequence of the requested length.
pub fn math_rand_alpha(n: usize) -> String {
    generate_crypto_random_string(n, RUNES_ALPHA)
}

pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = rng();

    (0..n)
        .map(|_| {
            let idx = rng.random_range(0..runes.len());
            runes[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_rfc7983_ranges() {
        assert!(match_stun(&[0x00, 0x01]));
        assert!(match_stun(&[0x01, 0x01]));
        assert!(!match_stun(&[]));
        assert!(match_dtls(&[22, 0xfe, 0xfd]));
        assert!(!match_dtls(&[0x40]));
        assert!(match_turn_channel(&[0x40, 0x01]));
        assert!(!match_turn_channel(&[0x80]));
    }

    #[test]
    fn test_pad4() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(13), 16);
    }

    #[test]
    fn test_math_rand_alpha() {
        let s = math_rand_alpha(16);
        assert_eq!(s.len(), 16);
        assert!(s.bytes().all(|b| b.is_ascii_alphabetic()));
    }
}
