use super::*;
use crate::param::param_reconfig_response::*;
use assert_matches::assert_matches;
use sansio::Protocol;

/// Feeds every queued packet of `from` into `to`.
fn pipe(from: &mut Association, to: &mut Association, now: Instant) -> Result<usize> {
    let mut n = 0;
    while let Some(payload) = from.poll_write() {
        to.handle_read(Datagram { now, payload })?;
        n += 1;
    }
    Ok(n)
}

/// Runs both directions until neither side has anything left to send.
fn exchange(a: &mut Association, b: &mut Association, now: Instant) -> Result<()> {
    loop {
        let n = pipe(a, b, now)? + pipe(b, a, now)?;
        if n == 0 {
            return Ok(());
        }
    }
}

fn drain(assoc: &mut Association) -> Vec<Packet> {
    let mut out = vec![];
    while let Some(raw) = assoc.poll_write() {
        out.push(Packet::unmarshal(&raw.freeze()).expect("association emitted invalid packet"));
    }
    out
}

fn events(assoc: &mut Association) -> Vec<AssociationEvent> {
    let mut out = vec![];
    while let Some(e) = assoc.poll_event() {
        out.push(e);
    }
    out
}

fn reads(assoc: &mut Association) -> Vec<StreamMessage> {
    let mut out = vec![];
    while let Some(m) = assoc.poll_read() {
        out.push(m);
    }
    out
}

fn connected_pair(now: Instant) -> Result<(Association, Association)> {
    let mut a = Association::new(AssociationConfig::default(), now);
    let mut b = Association::new(AssociationConfig::default(), now);
    a.connect(now)?;
    exchange(&mut a, &mut b, now)?;
    Ok((a, b))
}

/// A packet addressed to `assoc`, as if sent by its peer.
fn packet_to(assoc: &Association, chunks: Vec<Chunk>) -> Result<Datagram> {
    let payload = Packet {
        source_port: assoc.destination_port,
        destination_port: assoc.source_port,
        verification_tag: assoc.my_verification_tag,
        chunks,
    }
    .marshal()?;
    Ok(Datagram {
        now: Instant::now(),
        payload,
    })
}

fn sack(cumulative_tsn_ack: u32, gap_ack_blocks: Vec<GapAckBlock>) -> Chunk {
    Chunk::SelectiveAck(ChunkSelectiveAck {
        cumulative_tsn_ack,
        advertised_receiver_window_credit: DEFAULT_MAX_RECEIVE_WINDOW as u32,
        gap_ack_blocks,
        duplicate_tsn: vec![],
    })
}

fn data(tsn: u32, stream_identifier: u16, user_data: &'static [u8]) -> Chunk {
    Chunk::PayloadData(ChunkPayloadData {
        unordered: false,
        beginning_fragment: true,
        ending_fragment: true,
        tsn,
        stream_identifier,
        stream_sequence_number: 0,
        payload_type: PayloadProtocolIdentifier::Binary,
        user_data: Bytes::from_static(user_data),
    })
}

#[test]
fn test_handshake() -> Result<()> {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;

    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(b.state(), AssociationState::Established);
    assert_eq!(events(&mut a), vec![AssociationEvent::Connected]);
    assert_eq!(events(&mut b), vec![AssociationEvent::Connected]);

    assert_eq!(a.peer_verification_tag, b.my_verification_tag);
    assert_eq!(b.peer_verification_tag, a.my_verification_tag);
    assert!(a.peer_supports(CT_RECONFIG));
    assert!(b.peer_supports(CT_RECONFIG));
    assert_eq!(a.max_streams(), DEFAULT_MAX_STREAMS);
    assert_eq!(a.in_tsn, b.next_tsn.wrapping_sub(1));
    assert_eq!(b.in_tsn, a.next_tsn.wrapping_sub(1));

    // an immediate handshake measures a zero RTT, which clamps to the minimum
    assert_eq!(a.rto(), Duration::from_millis(RTO_MIN));
    assert!(a.handshake.is_none());
    Ok(())
}

#[test]
fn test_handshake_negotiates_streams() -> Result<()> {
    let now = Instant::now();
    let mut a = Association::new(AssociationConfig::default().with_max_streams(16), now);
    let mut b = Association::new(AssociationConfig::default(), now);
    a.connect(now)?;
    exchange(&mut a, &mut b, now)?;

    assert_eq!(a.max_streams(), 16);
    assert_eq!(b.max_streams(), 16);
    assert_eq!(
        b.send(now, 16, PayloadProtocolIdentifier::Binary, b"x"),
        Err(Error::ErrStreamIdOutOfRange(16))
    );
    Ok(())
}

#[test]
fn test_init_retransmit() -> Result<()> {
    let now = Instant::now();
    let mut a = Association::new(AssociationConfig::default(), now);
    a.connect(now)?;
    assert_eq!(a.state(), AssociationState::CookieWait);

    let first = drain(&mut a);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].verification_tag, 0);
    assert_eq!(first[0].chunks[0].chunk_type(), CT_INIT);

    let due = a.poll_timeout().expect("timer armed");
    assert!(due <= now + Duration::from_millis(RTO_INITIAL));

    a.handle_timeout(now + Duration::from_millis(RTO_INITIAL))?;
    let resent = drain(&mut a);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].chunks, first[0].chunks);
    assert_eq!(a.rto(), Duration::from_millis(RTO_MAX));
    Ok(())
}

#[test]
fn test_send_errors() -> Result<()> {
    let now = Instant::now();
    let mut a = Association::new(AssociationConfig::default(), now);
    assert_eq!(
        a.send(now, 0, PayloadProtocolIdentifier::Binary, b"early"),
        Err(Error::ErrPayloadDataStateNotExist)
    );

    let (mut a, _b) = connected_pair(now)?;
    assert_eq!(
        a.send(now, 0, PayloadProtocolIdentifier::Binary, b""),
        Err(Error::ErrEmptyPayload)
    );
    assert_eq!(
        a.send(now, DEFAULT_MAX_STREAMS, PayloadProtocolIdentifier::Binary, b"x"),
        Err(Error::ErrStreamIdOutOfRange(DEFAULT_MAX_STREAMS))
    );
    Ok(())
}

#[test]
fn test_send_and_receive() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;

    let status = a.send(now, 3, PayloadProtocolIdentifier::String, b"hello")?;
    assert_eq!(status, SendStatus::Complete);
    assert_eq!(a.pending.len(), 1);

    exchange(&mut a, &mut b, now)?;

    let messages = reads(&mut b);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].stream_id, 3);
    assert_eq!(messages[0].ppi, PayloadProtocolIdentifier::String);
    assert_eq!(&messages[0].payload[..], b"hello");

    assert!(a.pending.is_empty(), "SACK frees the pending chunk");
    assert_eq!(a.t3_start, None);
    Ok(())
}

#[test]
fn test_fragmented_message() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    a.send(now, 1, PayloadProtocolIdentifier::Binary, &payload)?;

    let packets = drain(&mut a);
    assert_eq!(packets.len(), 3);
    let fragments: Vec<(bool, bool, usize)> = packets
        .iter()
        .map(|p| match &p.chunks[0] {
            Chunk::PayloadData(d) => (d.beginning_fragment, d.ending_fragment, d.user_data.len()),
            other => panic!("unexpected {other}"),
        })
        .collect();
    assert_eq!(
        fragments,
        vec![
            (true, false, MAX_FRAGMENT_SIZE),
            (false, false, MAX_FRAGMENT_SIZE),
            (false, true, 3000 - 2 * MAX_FRAGMENT_SIZE)
        ]
    );

    for p in packets {
        b.handle_read(Datagram {
            now,
            payload: p.marshal()?,
        })?;
    }
    let messages = reads(&mut b);
    assert_eq!(messages.len(), 1);
    assert_eq!(&messages[0].payload[..], &payload[..]);
    Ok(())
}

#[test]
fn test_holding_queue_drains() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;
    events(&mut a);

    let payload = vec![0x42u8; 10_000];
    let status = a.send(now, 0, PayloadProtocolIdentifier::Binary, &payload)?;
    assert_eq!(status, SendStatus::Incomplete);
    // the initial congestion window of 4 MTU admits four full fragments
    assert_eq!(a.pending.len(), 4);
    assert_eq!(a.pending_bytes_to_send(), 10_000 - 4 * MAX_FRAGMENT_SIZE);

    exchange(&mut a, &mut b, now)?;

    assert_eq!(a.pending_bytes_to_send(), 0);
    assert!(a.pending.is_empty());
    assert_eq!(events(&mut a), vec![AssociationEvent::SendReady]);

    let messages = reads(&mut b);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload.len(), 10_000);
    Ok(())
}

#[test]
fn test_sack_frees_and_forward_acks() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;
    a.next_tsn = 5;
    a.cumulative_tsn_ack_point = 4;

    for _ in 0..4 {
        a.send(now, 0, PayloadProtocolIdentifier::Binary, b"data")?;
    }
    drain(&mut a);
    let tsns: Vec<u32> = a.pending.iter().map(|c| c.tsn).collect();
    assert_eq!(tsns, vec![5, 6, 7, 8]);

    a.handle_read(packet_to(&a, vec![sack(6, vec![GapAckBlock { start: 2, end: 2 }])])?)?;

    let remaining: Vec<(u32, bool)> = a.pending.iter().map(|c| (c.tsn, c.forward_acked)).collect();
    assert_eq!(remaining, vec![(7, false), (8, true)]);
    assert_eq!(a.pending[0].gap_reports, 1);
    assert!(drain(&mut a).is_empty(), "nothing is retransmitted yet");
    Ok(())
}

#[test]
fn test_fast_retransmit_once() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;

    let base = a.next_tsn;
    for _ in 0..5 {
        a.send(now, 0, PayloadProtocolIdentifier::Binary, b"0123456789")?;
    }
    drain(&mut a);

    let missing = base.wrapping_add(1);
    a.handle_read(packet_to(&a, vec![sack(base, vec![GapAckBlock { start: 2, end: 2 }])])?)?;
    a.handle_read(packet_to(&a, vec![sack(base, vec![GapAckBlock { start: 2, end: 3 }])])?)?;
    assert!(drain(&mut a).is_empty());

    let old_cwnd = a.cwnd;
    let mtu = DEFAULT_MTU;
    a.handle_read(packet_to(&a, vec![sack(base, vec![GapAckBlock { start: 2, end: 4 }])])?)?;

    let resent = drain(&mut a);
    assert_eq!(resent.len(), 1);
    assert_matches!(&resent[0].chunks[0], Chunk::PayloadData(d) if d.tsn == missing);
    assert_eq!(a.cwnd, (old_cwnd / 2).max(4 * mtu));
    assert_eq!(a.ssthresh, a.cwnd);
    assert_eq!(a.fast_recovery_exit, Some(missing));

    a.handle_read(packet_to(&a, vec![sack(base, vec![GapAckBlock { start: 2, end: 4 }])])?)?;
    assert!(drain(&mut a).is_empty(), "a chunk is fast-retransmitted only once");

    // the retransmission fills the hole and recovery ends
    a.handle_read(packet_to(&a, vec![sack(base.wrapping_add(4), vec![])])?)?;
    assert!(a.pending.is_empty());
    assert_eq!(a.fast_recovery_exit, None);
    Ok(())
}

#[test]
fn test_stale_sack_ignored() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;

    let base = a.next_tsn;
    for _ in 0..2 {
        a.send(now, 0, PayloadProtocolIdentifier::Binary, b"abc")?;
    }
    drain(&mut a);

    a.handle_read(packet_to(&a, vec![sack(base.wrapping_add(1), vec![])])?)?;
    assert!(a.pending.is_empty());

    a.handle_read(packet_to(&a, vec![sack(base, vec![])])?)?;
    assert_eq!(a.cumulative_tsn_ack_point, base.wrapping_add(1));
    Ok(())
}

#[test]
fn test_t3_retransmit() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;

    a.send(now, 0, PayloadProtocolIdentifier::Binary, b"lost")?;
    let sent = drain(&mut a);
    assert_eq!(sent.len(), 1);

    let rto = a.rto();
    assert_eq!(a.poll_timeout(), Some(now + TICK_INTERVAL));
    a.handle_timeout(now + rto)?;

    let resent = drain(&mut a);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].chunks, sent[0].chunks);
    assert_eq!(a.cwnd, DEFAULT_MTU);
    assert_eq!(a.rto(), rto * 2);
    assert_eq!(a.pending[0].retransmit_count, 1);
    Ok(())
}

#[test]
fn test_out_of_order_delivery() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;

    for m in [b"m0", b"m1", b"m2"] {
        a.send(now, 0, PayloadProtocolIdentifier::Binary, m)?;
    }
    let mut packets: Vec<BytesMut> = vec![];
    while let Some(raw) = a.poll_write() {
        packets.push(raw);
    }
    let base = b.in_tsn;

    b.handle_read(Datagram {
        now,
        payload: packets.remove(0),
    })?;
    let m2 = packets.remove(1);
    b.handle_read(Datagram { now, payload: m2 })?;

    assert_eq!(reads(&mut b).len(), 1);
    let sack = b.build_sack();
    assert_eq!(sack.cumulative_tsn_ack, base.wrapping_add(1));
    assert_eq!(sack.gap_ack_blocks, vec![GapAckBlock { start: 2, end: 2 }]);
    assert_eq!(
        sack.advertised_receiver_window_credit as usize,
        DEFAULT_MAX_RECEIVE_WINDOW - 2
    );

    b.handle_read(Datagram {
        now,
        payload: packets.remove(0),
    })?;
    let payloads: Vec<Vec<u8>> = reads(&mut b).into_iter().map(|m| m.payload.to_vec()).collect();
    assert_eq!(payloads, vec![b"m1".to_vec(), b"m2".to_vec()]);
    assert_eq!(b.in_tsn, base.wrapping_add(3));
    assert!(b.receive_hold.is_empty());
    Ok(())
}

#[test]
fn test_duplicate_data_is_acked_not_delivered() -> Result<()> {
    let now = Instant::now();
    let (_a, mut b) = connected_pair(now)?;

    let tsn = b.in_tsn.wrapping_add(1);
    b.handle_read(packet_to(&b, vec![data(tsn, 0, b"once")])?)?;
    b.handle_read(packet_to(&b, vec![data(tsn, 0, b"once")])?)?;

    assert_eq!(reads(&mut b).len(), 1);
    let packets = drain(&mut b);
    assert_eq!(packets.len(), 2, "every DATA packet is acknowledged");
    assert_matches!(&packets[1].chunks[0], Chunk::SelectiveAck(s) if s.cumulative_tsn_ack == tsn);
    Ok(())
}

#[test]
fn test_hold_buffer_full_drops_chunk() -> Result<()> {
    let now = Instant::now();
    let mut a = Association::new(AssociationConfig::default(), now);
    let mut b = Association::new(AssociationConfig::default().with_max_receive_window(6), now);
    a.connect(now)?;
    exchange(&mut a, &mut b, now)?;

    let tsn = b.in_tsn;
    b.handle_read(packet_to(&b, vec![data(tsn.wrapping_add(2), 0, b"four")])?)?;
    b.handle_read(packet_to(&b, vec![data(tsn.wrapping_add(3), 0, b"more")])?)?;

    assert_eq!(b.receive_hold.len(), 1);
    assert_eq!(b.held_bytes, 4);
    let packets = drain(&mut b);
    assert_eq!(packets.len(), 2, "a dropped chunk is still acknowledged");
    assert_matches!(
        &packets[1].chunks[0],
        Chunk::SelectiveAck(s) if s.cumulative_tsn_ack == tsn && s.gap_ack_blocks.len() == 1
    );
    Ok(())
}

#[test]
fn test_pause_and_resume() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;

    b.pause();
    a.send(now, 0, PayloadProtocolIdentifier::Binary, b"one")?;
    a.send(now, 0, PayloadProtocolIdentifier::Binary, b"two")?;
    exchange(&mut a, &mut b, now)?;

    assert!(b.is_paused());
    assert!(reads(&mut b).is_empty());
    assert_eq!(b.receive_hold.len(), 2);
    assert!(a.pending.is_empty(), "held chunks are still acknowledged");

    b.resume()?;
    let payloads: Vec<Vec<u8>> = reads(&mut b).into_iter().map(|m| m.payload.to_vec()).collect();
    assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);

    let update = drain(&mut b);
    assert_eq!(update.len(), 1);
    assert_matches!(
        &update[0].chunks[0],
        Chunk::SelectiveAck(s)
            if s.advertised_receiver_window_credit as usize == DEFAULT_MAX_RECEIVE_WINDOW
    );
    Ok(())
}

#[test]
fn test_paused_hold_buffer_is_capped() -> Result<()> {
    let now = Instant::now();
    let mut a = Association::new(AssociationConfig::default(), now);
    let mut b = Association::new(AssociationConfig::default().with_max_receive_window(6), now);
    a.connect(now)?;
    exchange(&mut a, &mut b, now)?;

    b.pause();
    let tsn = b.in_tsn;
    for i in 1..=10u32 {
        b.handle_read(packet_to(&b, vec![data(tsn.wrapping_add(i), 0, b"abcd")])?)?;
    }

    assert_eq!(b.receive_hold.len(), 1);
    assert_eq!(b.held_bytes, 4);
    assert_eq!(b.in_tsn, tsn.wrapping_add(1), "dropped chunks are not acknowledged");
    let packets = drain(&mut b);
    assert_matches!(
        &packets.last().expect("sack").chunks[0],
        Chunk::SelectiveAck(s) if s.cumulative_tsn_ack == tsn.wrapping_add(1)
            && s.advertised_receiver_window_credit == 2
    );

    b.resume()?;
    let payloads: Vec<Vec<u8>> = reads(&mut b).into_iter().map(|m| m.payload.to_vec()).collect();
    assert_eq!(payloads, vec![b"abcd".to_vec()]);
    assert_eq!(b.held_bytes, 0);
    Ok(())
}

#[test]
fn test_data_beyond_gap_range_dropped() -> Result<()> {
    let now = Instant::now();
    let (_a, mut b) = connected_pair(now)?;

    let tsn = b.in_tsn;
    b.handle_read(packet_to(&b, vec![data(tsn.wrapping_add(70_000), 0, b"far")])?)?;
    b.handle_read(packet_to(&b, vec![data(tsn.wrapping_add(3), 0, b"near")])?)?;

    assert_eq!(b.receive_hold.len(), 1);
    let packets = drain(&mut b);
    assert_matches!(
        &packets.last().expect("sack").chunks[0],
        Chunk::SelectiveAck(s) if s.cumulative_tsn_ack == tsn
            && s.gap_ack_blocks == vec![GapAckBlock { start: 3, end: 3 }]
    );
    Ok(())
}

#[test]
fn test_heartbeat_repeats_until_answered() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;
    events(&mut a);

    let mut t = now;
    for _ in 0..HEARTBEAT_TICKS {
        t += TICK_INTERVAL;
        a.handle_timeout(t)?;
    }
    // the first heartbeat is lost
    assert_eq!(drain(&mut a).len(), 1);

    t += TICK_INTERVAL;
    a.handle_timeout(t)?;
    let probes = drain(&mut a);
    assert_eq!(probes.len(), 1);
    assert_matches!(probes[0].chunks[0], Chunk::Heartbeat { is_ack: false, .. });

    b.handle_read(Datagram {
        now: t,
        payload: probes[0].marshal()?,
    })?;
    pipe(&mut b, &mut a, t)?;
    assert_eq!(a.tick_count, 0);

    for _ in 0..DEAD_TICKS - 1 {
        t += TICK_INTERVAL;
        a.handle_timeout(t)?;
    }
    assert_eq!(a.state(), AssociationState::Established);
    assert!(events(&mut a).is_empty());
    Ok(())
}

#[test]
fn test_heartbeat_and_dead_peer() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;
    events(&mut a);

    let mut t = now;
    for _ in 0..HEARTBEAT_TICKS {
        t += TICK_INTERVAL;
        a.handle_timeout(t)?;
    }
    let probes = drain(&mut a);
    assert_eq!(probes.len(), 1);
    assert_matches!(probes[0].chunks[0], Chunk::Heartbeat { is_ack: false, .. });

    // an answered heartbeat restarts the count
    b.handle_read(Datagram {
        now: t,
        payload: probes[0].marshal()?,
    })?;
    pipe(&mut b, &mut a, t)?;
    assert_eq!(a.tick_count, 0);

    for _ in 0..DEAD_TICKS {
        t += TICK_INTERVAL;
        a.handle_timeout(t)?;
    }
    assert_eq!(a.state(), AssociationState::Closed);
    assert_eq!(events(&mut a), vec![AssociationEvent::Closed]);
    assert_eq!(a.poll_timeout(), None);
    Ok(())
}

#[test]
fn test_abort_closes() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;
    events(&mut a);

    a.handle_read(packet_to(&a, vec![Chunk::Abort])?)?;
    assert_eq!(a.state(), AssociationState::Closed);
    assert_eq!(events(&mut a), vec![AssociationEvent::Closed]);
    assert_eq!(
        a.send(now, 0, PayloadProtocolIdentifier::Binary, b"late"),
        Err(Error::ErrPayloadDataStateNotExist)
    );
    Ok(())
}

#[test]
fn test_foreign_verification_tag_dropped() -> Result<()> {
    let now = Instant::now();
    let (_a, mut b) = connected_pair(now)?;

    let tsn = b.in_tsn.wrapping_add(1);
    let mut datagram = packet_to(&b, vec![data(tsn, 0, b"spoof")])?;
    datagram.payload = Packet {
        verification_tag: b.my_verification_tag.wrapping_add(1),
        ..Packet::unmarshal(&datagram.payload.freeze())?
    }
    .marshal()?;
    b.handle_read(datagram)?;

    assert!(reads(&mut b).is_empty());
    assert!(drain(&mut b).is_empty());
    assert_eq!(b.in_tsn, tsn.wrapping_sub(1));
    Ok(())
}

#[test]
fn test_checksum_mismatch() -> Result<()> {
    let now = Instant::now();
    let (_a, mut b) = connected_pair(now)?;

    let mut datagram = packet_to(&b, vec![Chunk::CookieAck])?;
    datagram.payload[8] ^= 0xff;
    assert_matches!(
        b.handle_read(datagram),
        Err(Error::ErrChecksumMismatch { .. })
    );
    Ok(())
}

#[test]
fn test_close_streams() -> Result<()> {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;
    a.send(now, 1, PayloadProtocolIdentifier::Binary, b"bye")?;
    exchange(&mut a, &mut b, now)?;
    events(&mut a);
    events(&mut b);

    assert_eq!(a.close_streams(now, &[1])?, CloseStatus::Ok);
    assert_eq!(a.close_streams(now, &[1])?, CloseStatus::AlreadyPending);

    let request = drain(&mut a);
    assert_eq!(request.len(), 1);
    let Chunk::Reconfig(params) = &request[0].chunks[0] else {
        panic!("expected RECONFIG");
    };
    assert_matches!(
        &params[..],
        [Param::OutgoingResetRequest(out), Param::IncomingResetRequest(inc)]
            if out.stream_identifiers == vec![1]
                && out.sender_last_tsn == a.next_tsn.wrapping_sub(1)
                && inc.stream_identifiers == vec![1]
    );

    b.handle_read(Datagram {
        now,
        payload: request[0].marshal()?,
    })?;
    assert_eq!(
        events(&mut b),
        vec![AssociationEvent::StreamsReset {
            stream_ids: vec![1]
        }]
    );

    let answer = drain(&mut b);
    let Chunk::Reconfig(params) = &answer[0].chunks[0] else {
        panic!("expected RECONFIG");
    };
    assert_matches!(
        &params[0],
        Param::ReconfigResponse(r) if r.result == ReconfigResult::SuccessPerformed
    );

    for p in answer {
        a.handle_read(Datagram {
            now,
            payload: p.marshal()?,
        })?;
    }
    assert_eq!(
        events(&mut a),
        vec![AssociationEvent::StreamsReset {
            stream_ids: vec![1]
        }]
    );
    assert!(a.local_reset.is_none());

    exchange(&mut a, &mut b, now)?;
    assert!(events(&mut a).is_empty());
    assert!(events(&mut b).is_empty());
    assert_eq!(a.close_streams(now, &[2])?, CloseStatus::Ok);
    Ok(())
}

#[test]
fn test_close_streams_not_supported() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;
    a.peer_extensions.clear();

    assert_eq!(a.close_streams(now, &[0])?, CloseStatus::NotSupported);
    assert!(drain(&mut a).is_empty());

    let mut idle = Association::new(AssociationConfig::default(), now);
    assert_eq!(
        idle.close_streams(now, &[0]),
        Err(Error::ErrPayloadDataStateNotExist)
    );
    Ok(())
}

#[test]
fn test_close_streams_retry_then_force() -> Result<()> {
    let now = Instant::now();
    let (mut a, _b) = connected_pair(now)?;
    events(&mut a);

    a.close_streams(now, &[4])?;
    drain(&mut a);

    let mut t = now + Duration::from_millis(RTO_MIN);
    a.handle_timeout(t)?;
    assert_eq!(drain(&mut a).len(), 1, "first retry");

    t += Duration::from_millis(2 * RTO_MIN);
    a.handle_timeout(t)?;
    assert_eq!(drain(&mut a).len(), 1, "second retry");
    assert!(events(&mut a).is_empty());

    t += Duration::from_millis(4 * RTO_MIN);
    a.handle_timeout(t)?;
    assert!(drain(&mut a).is_empty());
    assert_eq!(
        events(&mut a),
        vec![AssociationEvent::StreamsReset {
            stream_ids: vec![4]
        }]
    );
    assert!(a.local_reset.is_none());
    Ok(())
}

#[test]
fn test_peer_reset_deferred_until_delivered() -> Result<()> {
    let now = Instant::now();
    let (mut a, mut b) = connected_pair(now)?;
    a.send(now, 2, PayloadProtocolIdentifier::Binary, b"first")?;
    exchange(&mut a, &mut b, now)?;
    reads(&mut b);
    events(&mut b);

    b.pause();
    a.send(now, 2, PayloadProtocolIdentifier::Binary, b"pending")?;
    pipe(&mut a, &mut b, now)?;
    drain(&mut b);

    a.close_streams(now, &[2])?;
    pipe(&mut a, &mut b, now)?;
    assert!(events(&mut b).is_empty());
    assert_matches!(b.peer_reset, PendingReconfig::Deferred { .. });

    let answer = drain(&mut b);
    let Chunk::Reconfig(params) = &answer[0].chunks[0] else {
        panic!("expected RECONFIG");
    };
    assert_matches!(
        &params[0],
        Param::ReconfigResponse(r) if r.result == ReconfigResult::InProgress
    );

    b.resume()?;
    assert_eq!(reads(&mut b).len(), 1);
    assert_eq!(
        events(&mut b),
        vec![AssociationEvent::StreamsReset {
            stream_ids: vec![2]
        }]
    );
    assert_eq!(b.peer_reset, PendingReconfig::None);
    Ok(())
}
