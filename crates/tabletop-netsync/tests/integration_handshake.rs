//! Login and dictionary negotiation between a host and joining clients.

mod common;

use anyhow::Result;
use bytes::BufMut;
use tabletop_netproto::constants::PROTOCOL_VERSION;
use tabletop_netproto::messages::session::{DictionaryResponse, RejectReason};
use tabletop_netproto::msg_id::BuiltinId;
use tabletop_netproto::packet::decode_message;
use tabletop_netproto::decode_packet;
use tabletop_netsync::{NetConfig, NetworkStatus, SessionCoordinator, SessionEvent};

use common::*;

#[test]
fn host_order_wins_after_handshake() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    let host_a = record(&mut host, "A");
    record(&mut host, "B");

    let mut client = SessionCoordinator::new(client_config("Ann"));
    record(&mut client, "B");
    record(&mut client, "A");
    assert_eq!(client.registry().id_of("B"), Some(4));

    join(&mut host, &mut client)?;

    assert_eq!(client.dictionary().key_of(4), Some("A"));
    assert_eq!(client.dictionary().key_of(5), Some("B"));
    assert_eq!(client.lookup_name(4), "A");

    // Packets the client encodes now carry the host's ids.
    let packet = client.encode("A", |b| b.put_u32(42))?;
    assert_eq!(decode_packet(&packet.clone().freeze())?.type_id(), 4);
    client.send_broadcast(packet)?;

    pump_until(&mut [&mut host, &mut client], |_| !host_a.is_empty())?;
    let (payload, event) = host_a.try_recv()?;
    assert_eq!(payload.as_ref(), &42u32.to_be_bytes());
    assert_eq!(event.message_type, "A");
    assert_eq!(event.origin_id, 1);
    assert_eq!(event.origin.as_ref().map(|p| p.name.as_str()), Some("Ann"));
    assert!(event.broadcast);
    Ok(())
}

#[test]
fn connected_only_after_dictionary() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    let addr = host.start_hosting(0)?;

    let mut client = SessionCoordinator::new(client_config("Ann"));
    let events = client.subscribe();
    client.connect("127.0.0.1", addr.port())?;
    assert!(client.is_joining());
    assert_eq!(client.status(), NetworkStatus::Disconnected);

    // The socket opens long before the host's dictionary is dispatched.
    client.tick(std::time::Instant::now());
    assert_ne!(client.status(), NetworkStatus::Connected);

    pump_until(&mut [&mut host, &mut client], |s| {
        s[1].status() == NetworkStatus::Connected
    })?;
    assert!(!client.is_joining());
    assert_eq!(client.local_player_id(), 1);

    let events = drain(&events);
    let connected = events
        .iter()
        .position(|e| *e == SessionEvent::StatusChanged(NetworkStatus::Connected))
        .expect("connected status");
    let established = events
        .iter()
        .position(|e| *e == SessionEvent::ConnectionEstablished { player_id: 1 })
        .expect("connection established");
    assert_eq!(connected, 0, "{events:?}");
    assert!(established > connected);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::ConnectionEstablished { .. }))
            .count(),
        1
    );

    let names: Vec<_> = client.players().into_iter().map(|p| p.name).collect();
    assert_eq!(names, ["Gm", "Ann"]);
    Ok(())
}

#[test]
fn wrong_password_is_rejected() -> Result<()> {
    let mut host = SessionCoordinator::new(NetConfig {
        password: "secret".into(),
        ..host_config("Gm")
    });
    let host_events = host.subscribe();
    let addr = host.start_hosting(0)?;

    let mut client = SessionCoordinator::new(NetConfig {
        password: "guess".into(),
        ..client_config("Eve")
    });
    let events = client.subscribe();
    client.connect("127.0.0.1", addr.port())?;

    pump_until(&mut [&mut host, &mut client], |_| !events.is_empty())?;
    assert_eq!(
        events.try_recv()?,
        SessionEvent::LoginRejected(RejectReason::InvalidPassword)
    );
    assert_eq!(client.status(), NetworkStatus::Disconnected);
    assert!(!client.is_joining());
    assert!(client.connection_ids().is_empty());

    pump_until(&mut [&mut host], |s| s[0].connection_ids().is_empty())?;
    assert_eq!(host.players().len(), 1);
    assert!(
        drain(&host_events)
            .iter()
            .all(|e| !matches!(
                e,
                SessionEvent::PlayerJoined(_) | SessionEvent::ConnectionLost { .. }
            ))
    );
    Ok(())
}

#[test]
fn version_mismatch_is_rejected() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    let addr = host.start_hosting(0)?;

    let mut raw = RawClient::connect(addr)?;
    raw.login("Old", PROTOCOL_VERSION + 98, "")?;

    let frames = raw.wait_closed(&mut host)?;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].type_id(), BuiltinId::DictionaryResponse.id());
    let response: DictionaryResponse = decode_message(&frames[0].payload)?;
    assert_eq!(
        response,
        DictionaryResponse::Rejected {
            reason: RejectReason::VersionMismatch {
                host: PROTOCOL_VERSION,
                client: PROTOCOL_VERSION + 98,
            }
        }
    );
    Ok(())
}

#[test]
fn packets_before_login_are_dropped() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    let received = record(&mut host, DRAW_STROKE);
    let addr = host.start_hosting(0)?;

    let mut raw = RawClient::connect(addr)?;
    let early = tabletop_netproto::encode_packet(4, 7, |b| b.put_u8(1));
    raw.send(&early)?;
    raw.login_ok("Late")?;

    let accepted = raw.recv_type(&mut host, BuiltinId::DictionaryResponse.id())?;
    match decode_message::<DictionaryResponse>(&accepted.payload)? {
        DictionaryResponse::Accepted { player_id, .. } => assert_eq!(player_id, 1),
        other => panic!("expected acceptance, got {other:?}"),
    }
    assert!(received.is_empty());
    Ok(())
}

#[test]
fn late_registration_refreshes_clients() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    record(&mut host, DRAW_STROKE);

    let mut client = SessionCoordinator::new(client_config("Ann"));
    let client_deal = record(&mut client, DEAL);
    record(&mut client, DRAW_STROKE);
    let events = client.subscribe();
    join(&mut host, &mut client)?;
    assert_eq!(client.dictionary().id_of(DEAL), None);

    assert_eq!(host.register_fn(DEAL, |_: &mut SessionCoordinator, _, _: &_| Ok(())), 5);
    pump_until(&mut [&mut host, &mut client], |s| {
        s[1].dictionary().id_of(DEAL) == Some(5)
    })?;
    assert_eq!(client.status(), NetworkStatus::Connected);
    assert_eq!(client.local_player_id(), 1);
    assert_eq!(
        drain(&events)
            .iter()
            .filter(|e| matches!(e, SessionEvent::ConnectionEstablished { .. }))
            .count(),
        1
    );

    let packet = host.encode(DEAL, |b| b.put_u8(9))?;
    host.send_broadcast(packet)?;
    pump_until(&mut [&mut host, &mut client], |_| !client_deal.is_empty())?;
    assert_eq!(client_deal.try_recv()?.0.as_ref(), &[9]);
    Ok(())
}

#[test]
fn client_only_type_degrades_to_id_zero() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    let host_draw = record(&mut host, DRAW_STROKE);

    let mut client = SessionCoordinator::new(client_config("Ann"));
    record(&mut client, "tabletop.plugin.Dice");
    record(&mut client, DRAW_STROKE);
    join(&mut host, &mut client)?;
    let events = client.subscribe();

    let dice = client.encode("tabletop.plugin.Dice", |b| b.put_u8(6))?;
    assert_eq!(decode_packet(&dice.clone().freeze())?.type_id(), 0);
    assert!(matches!(events.try_recv()?, SessionEvent::Alert(_)));
    client.send_broadcast(dice)?;

    let draw = client.encode(DRAW_STROKE, |b| b.put_u8(1))?;
    client.send_broadcast(draw)?;

    pump_until(&mut [&mut host, &mut client], |_| !host_draw.is_empty())?;
    assert_eq!(host_draw.try_recv()?.0.as_ref(), &[1]);
    assert!(host_draw.is_empty());
    assert_eq!(client.status(), NetworkStatus::Connected);
    Ok(())
}

#[test]
fn malformed_login_closes_the_connection() -> Result<()> {
    let mut host = SessionCoordinator::new(host_config("Gm"));
    let events = host.subscribe();
    let addr = host.start_hosting(0)?;

    let mut raw = RawClient::connect(addr)?;
    let garbage = tabletop_netproto::encode_packet(BuiltinId::DictionaryRequest.id(), -1, |b| {
        b.put_slice(&[0xFF, 0xFF, 0xFF])
    });
    raw.send(&garbage)?;

    assert!(raw.wait_closed(&mut host)?.is_empty());
    pump_until(&mut [&mut host], |s| s[0].connection_ids().is_empty())?;
    assert_eq!(host.players().len(), 1);
    assert!(
        drain(&events)
            .iter()
            .all(|e| !matches!(
                e,
                SessionEvent::PlayerJoined(_) | SessionEvent::ConnectionLost { .. }
            ))
    );
    Ok(())
}
