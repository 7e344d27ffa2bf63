use super::*;
use crate::proto::channum::ChannelNumber;
use stun::message::*;

#[test]
fn test_stream_decoder_splits_mixed_stream() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_SUCCESS), Box::new(TransactionId::new())])?;
    let mut cd = ChannelData {
        data: vec![9; 5],
        number: ChannelNumber(0x4002),
        ..Default::default()
    };
    cd.encode();

    let mut stream = m.raw.clone();
    stream.extend_from_slice(&cd.raw);

    let mut decoder = StreamDecoder::new();
    // feed in uneven chunks
    decoder.extend_from_slice(&stream[..3]);
    assert_eq!(decoder.next_packet()?, None);
    decoder.extend_from_slice(&stream[3..25]);
    assert_eq!(decoder.next_packet()?, Some(m.raw.clone()));
    assert_eq!(decoder.next_packet()?, None);
    decoder.extend_from_slice(&stream[25..]);
    assert_eq!(decoder.next_packet()?, Some(cd.raw.clone()));
    assert_eq!(decoder.buffered_len(), 0);
    Ok(())
}

#[test]
fn test_stream_decoder_rejects_garbage() {
    let mut decoder = StreamDecoder::new();
    decoder.extend_from_slice(&[0xff, 0, 0, 0]);
    assert_eq!(decoder.next_packet(), Err(Error::ErrNonStunmessage));
    assert_eq!(decoder.buffered_len(), 0);
}
