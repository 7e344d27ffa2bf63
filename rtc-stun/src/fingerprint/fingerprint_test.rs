use super::*;
use crate::attributes::ATTR_SOFTWARE;
use crate::textattrs::TextAttribute;

#[test]
fn test_fingerprint_check() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, "software".to_owned())),
        Box::new(FINGERPRINT),
    ])?;

    let mut decoded = Message::new();
    decoded.unmarshal_binary(&m.raw)?;
    FINGERPRINT.check(&decoded)?;

    decoded.raw[3] += 1;
    assert_eq!(FINGERPRINT.check(&decoded), Err(Error::ErrFingerprintMismatch));
    Ok(())
}

#[test]
fn test_fingerprint_must_be_last() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(FINGERPRINT),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, "late".to_owned())),
    ])?;
    assert_eq!(FINGERPRINT.check(&m), Err(Error::ErrFingerprintMismatch));
    Ok(())
}

#[test]
fn test_fingerprint_missing() {
    let m = Message::new();
    assert_eq!(FINGERPRINT.check(&m), Err(Error::ErrAttributeNotFound));
}

#[test]
fn test_fingerprint_value() {
    // CRC-32 of an empty input is zero, leaving only the XOR mask
    assert_eq!(fingerprint_value(&[]), FINGERPRINT_XOR_VALUE);
    assert_ne!(fingerprint_value(b"STUN"), fingerprint_value(b"STUM"));
}
