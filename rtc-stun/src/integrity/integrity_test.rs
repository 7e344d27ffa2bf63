use super::*;
use crate::fingerprint::FINGERPRINT;
use crate::textattrs::TextAttribute;

#[test]
fn test_message_integrity_add_to_and_check() -> Result<()> {
    let i = MessageIntegrity::new_short_term_integrity("password".to_owned());
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(i.clone()),
        Box::new(FINGERPRINT),
    ])?;

    let mut decoded = Message::new();
    decoded.unmarshal_binary(&m.raw)?;
    i.check(&mut decoded)?;
    // the header length is restored after the check
    assert_eq!(decoded.raw, m.raw);

    let wrong = MessageIntegrity::new_short_term_integrity("passw0rd".to_owned());
    assert_eq!(wrong.check(&mut decoded), Err(Error::ErrIntegrityMismatch));
    Ok(())
}

#[test]
fn test_message_integrity_before_fingerprint() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(FINGERPRINT)])?;
    let i = MessageIntegrity::new_short_term_integrity("password".to_owned());
    assert_eq!(i.add_to(&mut m), Err(Error::ErrFingerprintBeforeIntegrity));
    Ok(())
}

#[test]
fn test_message_integrity_long_term_key() -> Result<()> {
    let i = MessageIntegrity::new_long_term_integrity(
        "user".to_owned(),
        "realm".to_owned(),
        "pass".to_owned(),
    );
    // MD5("user:realm:pass")
    assert_eq!(
        i.0,
        vec![
            0x84, 0x93, 0xfb, 0xc5, 0x3b, 0xa5, 0x82, 0xfb, 0x4c, 0x04, 0x4c, 0x45, 0x6b, 0xdc,
            0x40, 0xeb,
        ]
    );

    let mut m = Message::new();
    m.build(&[
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
        Box::new(TransactionId::new()),
        Box::new(TextAttribute::new(ATTR_USERNAME, "user".to_owned())),
        Box::new(TextAttribute::new(ATTR_REALM, "realm".to_owned())),
        Box::new(i.clone()),
    ])?;
    i.check(&mut m)?;
    Ok(())
}
