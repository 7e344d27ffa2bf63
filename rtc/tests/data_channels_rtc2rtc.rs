//! Two endpoints over a simulated lossless network: negotiation, channel lifecycle,
//! messaging, flow control and teardown.
mod common;

use common::*;
use rtc::DtlsState;
use rtc::datachannel::DataChannelConfig;
use rtc::sansio::Protocol;
use rtc::shared::error::{Error, Result};
use std::time::Duration;

const TEST_MESSAGE: &[u8] = b"Hello from offer!";

#[test]
fn test_offer_answer_connects() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;

    let session_a = net.a.session(sa).expect("session a");
    let session_b = net.b.session(sb).expect("session b");
    assert_eq!(session_a.state(), DtlsState::Connected);
    assert_eq!(session_b.state(), DtlsState::Connected);
    // the offering side initiates DTLS
    assert!(session_a.is_client());
    assert!(!session_b.is_client());
    assert_eq!(session_a.path().peer_addr(), addr_b());
    assert_eq!(session_b.path().peer_addr(), addr_a());
    assert!(
        session_a
            .association()
            .is_some_and(|association| association.is_established())
    );

    Ok(())
}

#[test]
fn test_open_channel_and_echo() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;
    net.b.handler_mut().echo = true;

    let mut config = DataChannelConfig::new("chat", true, None, None);
    config.protocol = "json".to_owned();
    let stream_id = net.a.open_channel(net.now, sa, config)?;
    assert_eq!(stream_id, 0);

    // nothing may be sent before the ACK
    assert_eq!(
        net.a.send(net.now, sa, stream_id, true, TEST_MESSAGE),
        Err(Error::ErrStreamNotAssigned(stream_id))
    );

    net.exchange()?;
    assert!(net.b.handler().has(&Seen::Channel {
        session: sb,
        stream_id,
        label: "chat".to_owned(),
        protocol: "json".to_owned(),
    }));
    assert!(net.a.handler().has(&Seen::Ack {
        session: sa,
        stream_id
    }));

    net.a.send(net.now, sa, stream_id, true, TEST_MESSAGE)?;
    net.a.send(net.now, sa, stream_id, false, b"")?;
    let echoed = net.run_until(Duration::from_secs(1), |net| {
        net.a.handler().received().len() == 2
    })?;
    assert!(echoed);

    let expected = vec![
        (stream_id, true, TEST_MESSAGE.to_vec()),
        (stream_id, false, vec![]),
    ];
    assert_eq!(net.b.handler().received(), expected);
    assert_eq!(net.a.handler().received(), expected);

    Ok(())
}

#[test]
fn test_answering_side_opens_odd_streams() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;

    let first = net.b.open_channel(net.now, sb, DataChannelConfig::new("b1", true, None, None))?;
    let second = net.b.open_channel(
        net.now,
        sb,
        DataChannelConfig::new("b2", false, Some(0), None),
    )?;
    assert_eq!((first, second), (1, 3));

    net.exchange()?;
    for stream_id in [first, second] {
        assert!(net.b.handler().has(&Seen::Ack {
            session: sb,
            stream_id
        }));
    }
    assert!(net.a.handler().has(&Seen::Channel {
        session: sa,
        stream_id: second,
        label: "b2".to_owned(),
        protocol: String::new(),
    }));

    Ok(())
}

#[test]
fn test_suppressed_ack_keeps_channel_closed() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, _) = net.connect()?;
    net.b.handler_mut().suppress_acks = true;

    let stream_id = net.a.open_channel(net.now, sa, DataChannelConfig::new("x", true, None, None))?;
    net.run_until(Duration::from_secs(1), |_| false)?;

    assert!(!net.a.handler().has(&Seen::Ack {
        session: sa,
        stream_id
    }));
    assert_eq!(
        net.a.send(net.now, sa, stream_id, true, TEST_MESSAGE),
        Err(Error::ErrStreamNotAssigned(stream_id))
    );

    Ok(())
}

#[test]
fn test_close_channel_resets_both_sides() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;

    let stream_id = net.a.open_channel(net.now, sa, DataChannelConfig::new("x", true, None, None))?;
    net.exchange()?;
    net.a.send(net.now, sa, stream_id, true, TEST_MESSAGE)?;
    net.exchange()?;

    net.a.close_channels(net.now, sa, &[stream_id])?;
    let closed = net.run_until(Duration::from_secs(5), |net| {
        net.a.handler().has(&Seen::Closed {
            session: sa,
            stream_id,
        }) && net.b.handler().has(&Seen::Closed {
            session: sb,
            stream_id,
        })
    })?;
    assert!(closed);

    assert_eq!(
        net.a.send(net.now, sa, stream_id, true, TEST_MESSAGE),
        Err(Error::ErrStreamNotAssigned(stream_id))
    );
    // the id is free again
    let reopened = net.a.open_channel(net.now, sa, DataChannelConfig::new("y", true, None, None))?;
    assert_eq!(reopened, stream_id);

    Ok(())
}

#[test]
fn test_pause_and_resume_delivery() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;
    net.b.handler_mut().pause_after = Some(1);

    let stream_id = net.a.open_channel(net.now, sa, DataChannelConfig::new("x", true, None, None))?;
    net.exchange()?;
    for m in [&b"one"[..], b"two", b"three"] {
        net.a.send(net.now, sa, stream_id, false, m)?;
    }
    net.run_until(Duration::from_millis(500), |_| false)?;
    assert_eq!(net.b.handler().received().len(), 1);

    net.b.handler_mut().pause_after = None;
    net.b.resume(net.now, sb)?;
    net.exchange()?;
    let payloads: Vec<Vec<u8>> = net
        .b
        .handler()
        .received()
        .into_iter()
        .map(|(_, _, data)| data)
        .collect();
    assert_eq!(
        payloads,
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );

    Ok(())
}

#[test]
fn test_disconnect_reaches_peer() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;
    let slot_b = net.b.session(sb).map(|s| s.ice_slot());

    net.a.disconnect(net.now, sa);
    assert!(net.a.handler().has(&Seen::Disconnected(sa)));
    assert!(net.a.session(sa).is_none());
    // a second disconnect changes nothing
    net.a.disconnect(net.now, sa);
    assert_eq!(
        net.a
            .handler()
            .seen
            .iter()
            .filter(|s| matches!(s, Seen::Disconnected(_)))
            .count(),
        1
    );

    net.exchange()?;
    assert!(net.b.handler().has(&Seen::Disconnected(sb)));
    assert!(net.b.session(sb).is_none());
    assert!(slot_b.is_some_and(|slot| net.b.agent().slot(slot).is_none()));

    Ok(())
}

#[test]
fn test_disconnect_closes_open_channels() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;

    let stream_id = net.a.open_channel(net.now, sa, DataChannelConfig::new("chat", true, None, None))?;
    net.exchange()?;
    assert!(net.a.handler().has(&Seen::Ack {
        session: sa,
        stream_id
    }));

    net.a.disconnect(net.now, sa);
    let closed = Seen::Closed {
        session: sa,
        stream_id,
    };
    let seen = &net.a.handler().seen;
    let closed_at = seen.iter().position(|s| *s == closed);
    let gone_at = seen.iter().position(|s| *s == Seen::Disconnected(sa));
    assert!(closed_at.is_some());
    assert!(closed_at < gone_at, "channels close before the session goes");

    net.exchange()?;
    assert!(net.b.handler().has(&Seen::Closed {
        session: sb,
        stream_id
    }));
    assert!(net.b.handler().has(&Seen::Disconnected(sb)));

    Ok(())
}

#[test]
fn test_disconnect_from_callback_is_deferred() -> Result<()> {
    let mut net = Net::with_defaults()?;
    let (sa, sb) = net.connect()?;
    net.b.handler_mut().disconnect_on_data = true;

    let stream_id = net.a.open_channel(net.now, sa, DataChannelConfig::new("x", true, None, None))?;
    net.exchange()?;
    net.a.send(net.now, sa, stream_id, true, TEST_MESSAGE)?;
    net.exchange()?;

    // delivered, but the session survives until the next timer pass
    assert_eq!(net.b.handler().received().len(), 1);
    assert!(net.b.session(sb).is_some());
    assert_eq!(net.b.poll_timeout(), Some(net.now));

    let gone = net.run_until(Duration::from_secs(1), |net| {
        net.a.handler().disconnected() && net.b.handler().disconnected()
    })?;
    assert!(gone);

    Ok(())
}

#[test]
fn test_consent_expiry_tears_down() -> Result<()> {
    let mut config_a = config(addr_a(), b"cert-a");
    config_a.consent_start_delay = Duration::from_millis(500);
    config_a.consent_interval = Duration::from_millis(200);
    config_a.consent_timeout = Duration::from_secs(2);
    let config_b = config(addr_b(), b"cert-b").with_consent_freshness(false);

    let mut net = Net::new(config_a, config_b)?;
    let (sa, _) = net.connect()?;

    // probes are answered
    net.run_until(Duration::from_secs(3), |_| false)?;
    assert!(net.a.session(sa).is_some());

    net.cut_to_a = true;
    let expired = net.run_until(Duration::from_secs(4), |net| net.a.handler().disconnected())?;
    assert!(expired);
    assert!(net.a.session(sa).is_none());

    Ok(())
}
