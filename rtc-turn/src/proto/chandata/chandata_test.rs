use super::*;

#[test]
fn test_channel_data_encode_pads_to_word() -> Result<()> {
    let mut d = ChannelData {
        data: vec![1, 2, 3, 4, 5],
        number: ChannelNumber(MIN_CHANNEL_NUMBER + 1),
        ..Default::default()
    };
    d.encode();
    assert_eq!(d.raw.len(), CHANNEL_DATA_HEADER_SIZE + 8);
    assert_eq!(&d.raw[..4], &[0x40, 0x01, 0x00, 0x05]);
    assert_eq!(&d.raw[9..], &[0, 0, 0]);
    assert!(ChannelData::is_channel_data(&d.raw));
    assert_eq!(ChannelData::framed_len(&d.raw), Some(d.raw.len()));

    let mut b = ChannelData {
        raw: d.raw.clone(),
        ..Default::default()
    };
    b.decode()?;
    assert_eq!(b, d);
    Ok(())
}

#[test]
fn test_channel_data_decode_errors() {
    let tests = vec![
        (vec![0x40, 0x00], Error::ErrUnexpectedEof),
        (vec![0x10, 0x00, 0x00, 0x00], Error::ErrInvalidChannelNumber),
        (vec![0x40, 0x00, 0x00, 0x08, 1, 2], Error::ErrBadChannelDataLength),
    ];
    for (raw, expected) in tests {
        let mut d = ChannelData {
            raw,
            ..Default::default()
        };
        assert_eq!(d.decode(), Err(expected));
    }
}

#[test]
fn test_is_channel_data_rejects_stun_and_dtls() {
    // STUN binding request header
    assert!(!ChannelData::is_channel_data(&[
        0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42
    ]));
    // DTLS handshake record
    assert!(!ChannelData::is_channel_data(&[22, 0xfe, 0xfd, 0, 0, 0]));
}
