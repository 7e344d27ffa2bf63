use super::*;
use crate::proto::lifetime::Lifetime;
use bytes::BytesMut;
use sansio::Protocol;
use shared::TaggedBytesMut;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

const USERNAME: &str = "user";
const PASSWORD: &str = "pass";
const REALM: &str = "example.org";
const NONCE: &str = "f8e6d3f2a1b0";

fn server_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 3478)
}

fn peer_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 50000)
}

fn relayed() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 61000)
}

fn new_client(transport_protocol: TransportProtocol) -> Client {
    Client::new(ClientConfig {
        turn_serv_addr: Some(server_addr()),
        local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 40000),
        transport_protocol,
        username: USERNAME.to_owned(),
        password: PASSWORD.to_owned(),
        software: "TEST SOFTWARE".to_owned(),
        rto_in_ms: 0,
    })
}

fn sent(client: &mut Client) -> Vec<TaggedBytesMut> {
    let mut out = vec![];
    while let Some(transmit) = client.poll_write() {
        out.push(transmit);
    }
    out
}

fn events(client: &mut Client) -> Vec<Event> {
    let mut out = vec![];
    while let Some(event) = client.poll_event() {
        out.push(event);
    }
    out
}

fn decode(raw: &[u8]) -> Message {
    let mut m = Message::new();
    m.unmarshal_binary(raw).unwrap();
    m
}

fn only_request(client: &mut Client) -> Message {
    let out = sent(client);
    assert_eq!(out.len(), 1, "expected exactly one request");
    assert_eq!(out[0].transport.peer_addr, server_addr());
    decode(&out[0].message)
}

fn from_server(client: &mut Client, now: Instant, raw: &[u8]) -> Result<()> {
    let transport_protocol = client.transport_protocol;
    client.handle_read(TaggedBytesMut {
        now,
        transport: TransportContext {
            local_addr: client.local_addr,
            peer_addr: server_addr(),
            transport_protocol,
        },
        message: BytesMut::from(raw),
    })
}

fn respond(client: &mut Client, now: Instant, setters: &[Box<dyn Setter>]) -> Result<()> {
    let mut m = Message::new();
    m.build(setters).unwrap();
    from_server(client, now, &m.raw)
}

fn allocated_client(now: Instant) -> Client {
    let mut client = new_client(TransportProtocol::UDP);
    client.allocate(now).unwrap();
    let first = only_request(&mut client);
    respond(
        &mut client,
        now,
        &[
            Box::new(first.transaction_id),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)),
            Box::new(CODE_UNAUTHORIZED),
            Box::new(Realm::new(ATTR_REALM, REALM.to_owned())),
            Box::new(Nonce::new(ATTR_NONCE, NONCE.to_owned())),
            Box::new(FINGERPRINT),
        ],
    )
    .unwrap();

    let second = only_request(&mut client);
    respond(
        &mut client,
        now,
        &[
            Box::new(second.transaction_id),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)),
            Box::new(RelayedAddress {
                ip: relayed().ip(),
                port: relayed().port(),
            }),
            Box::new(Lifetime(Duration::from_secs(600))),
            Box::new(FINGERPRINT),
        ],
    )
    .unwrap();
    events(&mut client);
    client
}

#[test]
fn test_allocate_answers_the_challenge_once() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let now = Instant::now();
    let mut client = new_client(TransportProtocol::UDP);

    let tid = client.allocate(now)?;
    assert_eq!(client.allocate(now), Err(Error::ErrOneAllocateOnly));

    let first = only_request(&mut client);
    assert_eq!(first.transaction_id, tid);
    assert_eq!(first.typ, MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST));
    let mut transport = RequestedTransport::default();
    transport.get_from(&first)?;
    assert_eq!(transport.protocol, PROTO_UDP);
    assert!(!first.contains(ATTR_USERNAME));
    assert!(first.contains(ATTR_FINGERPRINT));

    respond(
        &mut client,
        now,
        &[
            Box::new(tid),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)),
            Box::new(CODE_UNAUTHORIZED),
            Box::new(Realm::new(ATTR_REALM, REALM.to_owned())),
            Box::new(Nonce::new(ATTR_NONCE, NONCE.to_owned())),
            Box::new(FINGERPRINT),
        ],
    )?;

    let mut second = only_request(&mut client);
    assert_ne!(second.transaction_id, tid);
    assert_eq!(Username::get_from_as(&second, ATTR_USERNAME)?.text, USERNAME);
    assert_eq!(Realm::get_from_as(&second, ATTR_REALM)?.text, REALM);
    assert_eq!(Nonce::get_from_as(&second, ATTR_NONCE)?.text, NONCE);
    let key = MessageIntegrity::new_long_term_integrity(
        USERNAME.to_owned(),
        REALM.to_owned(),
        PASSWORD.to_owned(),
    );
    key.check(&mut second)?;

    respond(
        &mut client,
        now,
        &[
            Box::new(second.transaction_id),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)),
            Box::new(RelayedAddress {
                ip: relayed().ip(),
                port: relayed().port(),
            }),
            Box::new(Lifetime(Duration::from_secs(600))),
            Box::new(FINGERPRINT),
        ],
    )?;

    match events(&mut client).as_slice() {
        [Event::AllocateResponse(id, addr)] => {
            assert_eq!(*id, second.transaction_id);
            assert_eq!(*addr, relayed());
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(client.relayed_addr(), Some(relayed()));
    assert_eq!(client.allocate(now), Err(Error::ErrAlreadyAllocated));
    assert_eq!(0, client.tr_map.len(), "should be no transaction left");

    Ok(())
}

#[test]
fn test_allocate_error_without_challenge() -> Result<()> {
    let now = Instant::now();
    let mut client = new_client(TransportProtocol::UDP);
    let tid = client.allocate(now)?;
    sent(&mut client);

    respond(
        &mut client,
        now,
        &[
            Box::new(tid),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)),
            Box::new(CODE_UNAUTHORIZED),
            Box::new(FINGERPRINT),
        ],
    )?;

    match events(&mut client).as_slice() {
        [Event::AllocateError(id, err)] => {
            assert_eq!(*id, tid);
            assert_eq!(*err, Error::ErrAllocateChallengeMissing);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(sent(&mut client).is_empty());

    // a failed allocation frees the client for another attempt
    client.allocate(now)?;
    Ok(())
}

#[test]
fn test_allocate_without_server() {
    let mut client = Client::new(ClientConfig::default());
    assert_eq!(
        client.allocate(Instant::now()),
        Err(Error::ErrTurnServerAddressNotSet)
    );
    assert!(client.relay().is_err());
}

#[test]
fn test_allocate_retransmits_on_udp_until_timeout() -> Result<()> {
    let mut now = Instant::now();
    let mut client = new_client(TransportProtocol::UDP);
    let tid = client.allocate(now)?;

    let mut requests = sent(&mut client).len();
    let mut rounds = 0;
    while let Some(timeout) = client.poll_timeout() {
        now = timeout;
        client.handle_timeout(now)?;
        requests += sent(&mut client).len();
        rounds += 1;
        assert!(rounds < 20);
    }

    assert_eq!(requests, 7);
    match events(&mut client).as_slice() {
        [Event::TransactionTimeout(id)] => assert_eq!(*id, tid),
        other => panic!("unexpected events {other:?}"),
    }
    client.allocate(now)?;
    Ok(())
}

#[test]
fn test_allocate_does_not_retransmit_on_tcp() -> Result<()> {
    let mut now = Instant::now();
    let mut client = new_client(TransportProtocol::TCP);
    client.allocate(now)?;

    let mut requests = sent(&mut client).len();
    while let Some(timeout) = client.poll_timeout() {
        now = timeout;
        client.handle_timeout(now)?;
        requests += sent(&mut client).len();
    }

    assert_eq!(requests, 1);
    assert!(matches!(
        events(&mut client).as_slice(),
        [Event::TransactionTimeout(_)]
    ));
    Ok(())
}

#[test]
fn test_create_permissions() -> Result<()> {
    let now = Instant::now();
    let mut client = allocated_client(now);

    let tid = client.relay()?.create_permissions(now, &[peer_addr()])?;
    let req = only_request(&mut client);
    assert_eq!(req.transaction_id, tid);
    assert_eq!(
        req.typ,
        MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST)
    );
    let mut peer = PeerAddress::default();
    peer.get_from(&req)?;
    assert_eq!(SocketAddr::from(peer), peer_addr());
    assert!(req.contains(ATTR_MESSAGE_INTEGRITY));

    respond(
        &mut client,
        now,
        &[
            Box::new(tid),
            Box::new(MessageType::new(
                METHOD_CREATE_PERMISSION,
                CLASS_SUCCESS_RESPONSE,
            )),
            Box::new(FINGERPRINT),
        ],
    )?;
    match events(&mut client).as_slice() {
        [Event::CreatePermissionResponse(id)] => assert_eq!(*id, tid),
        other => panic!("unexpected events {other:?}"),
    }

    // permission for the same IP is not requested twice
    client.relay()?.create_permission(now, peer_addr())?;
    assert!(sent(&mut client).is_empty());
    Ok(())
}

#[test]
fn test_stale_nonce_is_retried_once() -> Result<()> {
    let now = Instant::now();
    let mut client = allocated_client(now);

    client.relay()?.create_permissions(now, &[peer_addr()])?;
    let req = only_request(&mut client);

    let stale = |tid: TransactionId, nonce: &str| -> Vec<Box<dyn Setter>> {
        vec![
            Box::new(tid),
            Box::new(MessageType::new(
                METHOD_CREATE_PERMISSION,
                CLASS_ERROR_RESPONSE,
            )),
            Box::new(CODE_STALE_NONCE),
            Box::new(Nonce::new(ATTR_NONCE, nonce.to_owned())),
            Box::new(FINGERPRINT),
        ]
    };

    respond(&mut client, now, &stale(req.transaction_id, "second"))?;
    assert!(events(&mut client).is_empty());

    let retry = only_request(&mut client);
    assert_ne!(retry.transaction_id, req.transaction_id);
    assert_eq!(Nonce::get_from_as(&retry, ATTR_NONCE)?.text, "second");

    respond(&mut client, now, &stale(retry.transaction_id, "third"))?;
    assert!(sent(&mut client).is_empty());
    match events(&mut client).as_slice() {
        [Event::CreatePermissionError(id, _)] => assert_eq!(*id, retry.transaction_id),
        other => panic!("unexpected events {other:?}"),
    }
    Ok(())
}

#[test]
fn test_send_to_switches_to_channel_data_once_bound() -> Result<()> {
    let now = Instant::now();
    let mut client = allocated_client(now);
    let number = ChannelNumber(0x4001);

    let tid = client
        .relay()?
        .create_channel_binding(now, number, peer_addr())?;
    let req = only_request(&mut client);
    assert_eq!(req.typ, MessageType::new(METHOD_CHANNEL_BIND, CLASS_REQUEST));
    let mut got = ChannelNumber::default();
    got.get_from(&req)?;
    assert_eq!(got, number);

    // until the binding is confirmed data goes out in a Send indication
    client.relay()?.send_to(now, peer_addr(), b"hello")?;
    let indication = only_request(&mut client);
    assert_eq!(
        indication.typ,
        MessageType::new(METHOD_SEND, CLASS_INDICATION)
    );
    let mut data = Data::default();
    data.get_from(&indication)?;
    assert_eq!(data.0, b"hello");

    respond(
        &mut client,
        now,
        &[
            Box::new(tid),
            Box::new(MessageType::new(METHOD_CHANNEL_BIND, CLASS_SUCCESS_RESPONSE)),
            Box::new(FINGERPRINT),
        ],
    )?;
    match events(&mut client).as_slice() {
        [Event::ChannelBindResponse(id, n, addr)] => {
            assert_eq!(*id, tid);
            assert_eq!(*n, number);
            assert_eq!(*addr, peer_addr());
        }
        other => panic!("unexpected events {other:?}"),
    }

    client.relay()?.send_to(now, peer_addr(), b"hello")?;
    let out = sent(&mut client);
    assert_eq!(out.len(), 1);
    assert_eq!(
        &out[0].message[..],
        &[0x40, 0x01, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0, 0, 0]
    );
    Ok(())
}

#[test]
fn test_inbound_data_indication_and_channel_data() -> Result<()> {
    let now = Instant::now();
    let mut client = allocated_client(now);
    let number = ChannelNumber(0x4002);

    let tid = client
        .relay()?
        .create_channel_binding(now, number, peer_addr())?;
    sent(&mut client);
    respond(
        &mut client,
        now,
        &[
            Box::new(tid),
            Box::new(MessageType::new(METHOD_CHANNEL_BIND, CLASS_SUCCESS_RESPONSE)),
        ],
    )?;
    events(&mut client);

    respond(
        &mut client,
        now,
        &[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_DATA, CLASS_INDICATION)),
            Box::new(PeerAddress::from(peer_addr())),
            Box::new(Data(b"via indication".to_vec())),
        ],
    )?;

    let mut cd = ChannelData {
        data: b"via channel".to_vec(),
        number,
        ..Default::default()
    };
    cd.encode();
    from_server(&mut client, now, &cd.raw)?;

    let evs = events(&mut client);
    assert_eq!(evs.len(), 2);
    match &evs[0] {
        Event::DataIndicationOrChannelData(None, from, data) => {
            assert_eq!(*from, peer_addr());
            assert_eq!(&data[..], b"via indication");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match &evs[1] {
        Event::DataIndicationOrChannelData(Some(n), from, data) => {
            assert_eq!(*n, number);
            assert_eq!(*from, peer_addr());
            assert_eq!(&data[..], b"via channel");
        }
        other => panic!("unexpected event {other:?}"),
    }

    cd.number = ChannelNumber(0x4003);
    cd.encode();
    assert_eq!(
        from_server(&mut client, now, &cd.raw),
        Err(Error::ErrChannelBindNotFound)
    );
    Ok(())
}

#[test]
fn test_tcp_stream_is_reassembled() -> Result<()> {
    let now = Instant::now();
    let mut client = new_client(TransportProtocol::TCP);
    let tid = client.allocate(now)?;
    sent(&mut client);

    let mut m = Message::new();
    m.build(&[
        Box::new(tid),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)),
        Box::new(RelayedAddress {
            ip: relayed().ip(),
            port: relayed().port(),
        }),
        Box::new(FINGERPRINT),
    ])?;
    let mut indication = Message::new();
    indication.build(&[
        Box::new(TransactionId::new()),
        Box::new(MessageType::new(METHOD_DATA, CLASS_INDICATION)),
        Box::new(PeerAddress::from(peer_addr())),
        Box::new(Data(vec![1, 2, 3])),
    ])?;

    let mut stream = m.raw.clone();
    stream.extend_from_slice(&indication.raw);
    let split = m.raw.len() + 7;
    from_server(&mut client, now, &stream[..5])?;
    from_server(&mut client, now, &stream[5..split])?;
    assert!(matches!(
        events(&mut client).as_slice(),
        [Event::AllocateResponse(_, _)]
    ));
    from_server(&mut client, now, &stream[split..])?;
    match events(&mut client).as_slice() {
        [Event::DataIndicationOrChannelData(None, from, data)] => {
            assert_eq!(*from, peer_addr());
            assert_eq!(&data[..], &[1, 2, 3]);
        }
        other => panic!("unexpected events {other:?}"),
    }
    Ok(())
}

#[test]
fn test_allocation_refresh_and_close() -> Result<()> {
    let now = Instant::now();
    let mut client = allocated_client(now);

    // permissions refresh first, but there are none yet
    assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(120)));
    client.handle_timeout(now + Duration::from_secs(120))?;
    assert!(sent(&mut client).is_empty());

    let at = now + Duration::from_secs(300);
    client.handle_timeout(at)?;
    let refresh = only_request(&mut client);
    assert_eq!(refresh.typ, MessageType::new(METHOD_REFRESH, CLASS_REQUEST));
    let mut lifetime = Lifetime::default();
    lifetime.get_from(&refresh)?;
    assert_eq!(lifetime.0, Duration::from_secs(600));

    client.relay()?.close(at)?;
    let release = only_request(&mut client);
    lifetime.get_from(&release)?;
    assert_eq!(lifetime.0, Duration::ZERO);
    assert_eq!(client.relayed_addr(), None);
    assert!(client.relay().is_err());
    Ok(())
}
