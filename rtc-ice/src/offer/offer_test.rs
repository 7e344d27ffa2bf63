use super::*;
use bytes::Bytes;
use std::net::Ipv4Addr;

fn sample_offer() -> IceOffer {
    IceOffer {
        flags: 0,
        username: "AAAAAAAA".to_owned(),
        key: "0123456789abcdef0123456789abcdef".to_owned(),
        fingerprint: (0u8..32).collect(),
        candidates: vec![Candidate::new(Ipv4Addr::new(1, 2, 3, 4), 5000)],
        relay: None,
    }
}

#[test]
fn test_offer_round_trip() -> Result<()> {
    let offer = sample_offer();
    let raw = offer.marshal()?;

    assert_eq!(raw.len(), 6 + 1 + 8 + 1 + 32 + 1 + 32 + 1 + 6);
    assert_eq!(&raw[..6], &[0, 1, 0, 0, 0, 0]);
    assert_eq!(raw[6], 8);
    assert_eq!(&raw[7..15], b"AAAAAAAA");
    assert_eq!(&raw[raw.len() - 7..], &[1, 1, 2, 3, 4, 0x13, 0x88]);

    let decoded = IceOffer::unmarshal(&mut raw.clone())?;
    assert_eq!(decoded, offer);
    assert!(!decoded.is_dtls_server());

    Ok(())
}

#[test]
fn test_offer_flags_and_relay_record() -> Result<()> {
    let mut offer = sample_offer();
    offer.flags = FLAG_DTLS_SERVER;
    offer.candidates.clear();
    offer.relay = Some(Candidate::new(Ipv4Addr::new(203, 0, 113, 9), 49152));

    let raw = offer.marshal()?;
    assert_eq!(&raw[2..6], &[0, 0, 0, 2]);
    assert_eq!(&raw[raw.len() - 7..], &[6, 203, 0, 113, 9, 0xc0, 0x00]);

    let decoded = IceOffer::unmarshal(&mut raw.clone())?;
    assert!(decoded.is_dtls_server());
    assert!(decoded.candidates.is_empty());
    assert_eq!(decoded.relay, offer.relay);

    Ok(())
}

#[test]
fn test_offer_skips_unknown_relay_record() -> Result<()> {
    let mut raw = sample_offer().marshal()?.to_vec();
    // a 28 byte socket address record from a v6 capable peer
    raw.push(28);
    raw.extend_from_slice(&[0u8; 28]);

    let decoded = IceOffer::unmarshal(&mut Bytes::from(raw))?;
    assert_eq!(decoded.relay, None);
    assert_eq!(decoded.candidates.len(), 1);

    Ok(())
}

#[test]
fn test_offer_rejects_bad_input() -> Result<()> {
    let mut raw = sample_offer().marshal()?.to_vec();
    raw[1] = 2;
    assert_eq!(
        IceOffer::unmarshal(&mut Bytes::from(raw)),
        Err(Error::ErrIceOfferVersion(2))
    );

    let raw = sample_offer().marshal()?;
    let truncated = raw.slice(..raw.len() - 3);
    assert!(matches!(
        IceOffer::unmarshal(&mut truncated.clone()),
        Err(Error::UnexpectedEndOfBuffer { .. })
    ));

    let mut crowded = sample_offer();
    crowded.candidates = (0..9)
        .map(|i| Candidate::new(Ipv4Addr::new(10, 0, 0, i), 4000))
        .collect();
    assert_eq!(
        crowded.marshal(),
        Err(Error::ErrIceTooManyCandidates(MAX_CANDIDATES))
    );

    let mut long = sample_offer();
    long.fingerprint = vec![0u8; 300];
    assert_eq!(long.marshal(), Err(Error::ErrIceOfferFieldTooLong));

    Ok(())
}
