use super::*;

#[test]
fn test_mapped_address() -> Result<()> {
    let mut m = Message::new();
    let addr = MappedAddress {
        ip: "122.12.34.5".parse().unwrap(),
        port: 5412,
    };
    addr.add_to(&mut m)?;
    assert_eq!(addr.to_string(), "122.12.34.5:5412");

    let mut got = MappedAddress::default();
    got.get_from(&m)?;
    assert_eq!(got.ip, addr.ip);
    assert_eq!(got.port, addr.port);

    let mut missing = Message::new();
    missing.write_header();
    assert_eq!(got.get_from(&missing), Err(Error::ErrAttributeNotFound));
    Ok(())
}

#[test]
fn test_mapped_address_bad_family() {
    let mut m = Message::new();
    m.add(ATTR_MAPPED_ADDRESS, &[0, 3, 0, 1, 1, 2, 3, 4]);
    let mut got = MappedAddress::default();
    assert_eq!(got.get_from(&m), Err(Error::ErrBadAddressFamily));

    let mut short = Message::new();
    short.add(ATTR_MAPPED_ADDRESS, &[0, 1, 0, 1]);
    assert_eq!(got.get_from(&short), Err(Error::ErrUnexpectedEof));
}

#[test]
fn test_other_address_falls_back_to_changed_address() -> Result<()> {
    let legacy = MappedAddress {
        ip: "198.51.100.2".parse().unwrap(),
        port: 3479,
    };
    let mut m = Message::new();
    legacy.add_to_as(&mut m, ATTR_CHANGED_ADDRESS)?;

    let mut other = OtherAddress::default();
    other.get_from(&m)?;
    assert_eq!(
        SocketAddr::from(&other.0),
        "198.51.100.2:3479".parse::<SocketAddr>().unwrap()
    );

    let mut m = Message::new();
    OtherAddress(MappedAddress {
        ip: "203.0.113.9".parse().unwrap(),
        port: 1,
    })
    .add_to(&mut m)?;
    assert!(m.contains(ATTR_OTHER_ADDRESS));
    assert!(!m.contains(ATTR_CHANGED_ADDRESS));
    Ok(())
}
