use super::*;

#[test]
fn test_slot_char_round_trip() {
    assert_eq!(slot_to_char(0), Some('A'));
    assert_eq!(slot_to_char(25), Some('Z'));
    assert_eq!(slot_to_char(26), Some('a'));
    assert_eq!(slot_to_char(MAX_ENCODABLE_SLOTS), None);

    for slot in 0..MAX_ENCODABLE_SLOTS {
        let c = slot_to_char(slot).unwrap();
        assert_eq!(char_to_slot(c as u8), Some(slot), "slot {slot}");
    }
    assert_eq!(char_to_slot(b'0'), None);
}

#[test]
fn test_generate_username_encodes_slot() {
    for slot in [0usize, 3, 9] {
        let username = generate_username(slot).unwrap();
        assert_eq!(username.len(), LEN_USERNAME);
        assert_eq!(char_to_slot(username.as_bytes()[0]), Some(slot));
        assert!(username[1..].bytes().all(|b| b.is_ascii_hexdigit()));
    }
    assert!(generate_username(MAX_ENCODABLE_SLOTS).is_none());
}

#[test]
fn test_derive_key_is_stable() {
    let secret = [7u8; LEN_SECRET];
    let key = derive_key(b"Aabcdef0", &secret);
    assert_eq!(key.len(), LEN_KEY);
    assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));

    // only the first eight username bytes take part
    assert_eq!(key, derive_key(b"Aabcdef0:remote", &secret));
    assert_ne!(key, derive_key(b"Babcdef0", &secret));
    assert_ne!(key, derive_key(b"Aabcdef0", &[8u8; LEN_SECRET]));
}

#[test]
fn test_random_generator_collision() {
    const N: usize = 10;

    let tie_breakers: Vec<u64> = (0..N).map(|_| generate_tie_breaker()).collect();
    let secrets: Vec<[u8; LEN_SECRET]> = (0..N).map(|_| generate_secret()).collect();

    for i in 0..N {
        for j in i + 1..N {
            assert_ne!(tie_breakers[i], tie_breakers[j]);
            assert_ne!(secrets[i], secrets[j]);
        }
    }
}

#[test]
fn test_jitter_stays_in_window() {
    let (min, max) = (Duration::from_millis(100), Duration::from_millis(500));
    for _ in 0..100 {
        let d = jitter(min, max);
        assert!(d >= min && d <= max, "{d:?}");
    }
    assert_eq!(jitter(max, min), max);
}
