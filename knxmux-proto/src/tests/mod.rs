use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    auth::{AccessClass, Authorize},
    frame::{GroupAddr, IndividualAddr, LData, MessageCode},
    ChannelId, ConnectionError, ConsumerClass, EndpointConfig, EnqueueError, Event, ServerConfig,
};

mod util;
use util::{drive, subscribe, FakePeer, Node, Sim, TestEndpoint};

/// A telegram as the bus would deliver it to us
fn ind_telegram() -> Bytes {
    LData::group_write(IndividualAddr::new(1, 1, 1), GroupAddr::new(1, 0, 7), &[1])
        .with_code(MessageCode::LDataInd)
        .encode()
}

/// A telegram as a client asks us to put it on the bus
fn req_telegram() -> Bytes {
    LData::group_write(IndividualAddr::new(1, 1, 9), GroupAddr::new(2, 0, 1), &[0]).encode()
}

fn connect_upstream(sim: &mut Sim, mux: &mut TestEndpoint, gw: &mut FakePeer) {
    mux.endpoint.connect(sim.time, gw.addr).unwrap();
    drive(sim, &mut [&mut *mux as &mut dyn Node, &mut *gw]);
    assert!(mux.endpoint.upstream_established());
    assert!(mux
        .events
        .iter()
        .any(|e| matches!(e, Event::UpstreamConnected)));
}

#[test]
fn scenario_fan_out_roundtrip() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 77);
    let mut mux = TestEndpoint::new(3700, true);
    let mut client = FakePeer::client(3800);

    connect_upstream(&mut sim, &mut mux, &mut gw);

    client.connect(mux.addr);
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert_eq!(client.channel, 1);
    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::PeerConnected {
            channel: ChannelId(1),
            ..
        }
    )));

    // bus telegram arrives at the multiplexer; the client has not answered
    // yet, so the entry sits in the queue with the client's bit set
    gw.send_telegram(ind_telegram());
    while let Some(t) = gw.poll_transmit() {
        mux.handle(sim.time, gw.addr, &t.contents);
    }
    assert_eq!(mux.endpoint.status(sim.time).queue_depth, 1);

    // one send/ack round trip later the entry is gone
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert_eq!(client.telegrams.len(), 1);
    assert_eq!(gw.acks, vec![0]);
    assert_eq!(mux.endpoint.status(sim.time).queue_depth, 0);

    // re-running the drain after completion must change nothing
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert_eq!(client.telegrams.len(), 1);
    assert_eq!(client.requests_seen, 1);
}

#[test]
fn duplicate_telegram_is_reacked_not_redelivered() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 4);
    let mut mux = TestEndpoint::new(3700, true);
    mux.endpoint.register_consumer(ConsumerClass::Eibd);

    connect_upstream(&mut sim, &mut mux, &mut gw);

    gw.send_telegram(ind_telegram());
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert!(mux.endpoint.consumer_pop(ConsumerClass::Eibd).is_some());
    assert_eq!(gw.acks, vec![0]);

    // the peer missed our ack and repeats the telegram: acked again,
    // delivered to nobody, sequence not advanced
    gw.resend_telegram(ind_telegram());
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.acks, vec![0, 0]);
    assert!(mux.endpoint.consumer_pop(ConsumerClass::Eibd).is_none());
    assert!(mux.endpoint.upstream_established());

    // the next fresh telegram flows normally
    gw.send_telegram(ind_telegram());
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.acks, vec![0, 0, 1]);
    assert!(mux.endpoint.consumer_pop(ConsumerClass::Eibd).is_some());
}

#[test]
fn out_of_sequence_telegram_invalidates_the_session() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 4);
    let mut mux = TestEndpoint::new(3700, true);

    connect_upstream(&mut sim, &mut mux, &mut gw);

    gw.send_telegram_with_seq(7, ind_telegram());
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);

    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::UpstreamLost {
            reason: ConnectionError::ProtocolViolation(_),
        }
    )));
    assert!(mux.endpoint.status(sim.time).upstream.is_none());
    // the record is cleared with a best-effort notification, not silently
    assert_eq!(gw.disconnects, 1);
}

#[test]
fn retry_bound_is_three_transmissions_then_teardown() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 9);
    let mut mux = TestEndpoint::new(3700, true);

    connect_upstream(&mut sim, &mut mux, &mut gw);
    gw.ack_tunneling = false;

    let serial = mux.endpoint.enqueue(sim.time, req_telegram()).unwrap();
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.requests_seen, 1);

    // two resends, one acknowledgment timeout apart
    for expected in [2, 3] {
        sim.advance(Duration::from_secs(1));
        drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
        assert_eq!(gw.requests_seen, expected);
        assert!(mux.endpoint.upstream_established());
    }

    // the third timeout exhausts the budget: 3 transmissions, 3 seconds
    sim.advance(Duration::from_secs(1));
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.requests_seen, 3);
    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::UpstreamLost {
            reason: ConnectionError::AckTimedOut { attempts: 3 },
        }
    )));
    assert!(mux
        .events
        .iter()
        .any(|e| matches!(e, Event::RelayFailed { serial: s, .. } if *s == serial)));
    assert!(mux.endpoint.status(sim.time).upstream.is_none());
    assert_eq!(mux.endpoint.status(sim.time).queue_depth, 0);
}

#[test]
fn two_missed_heartbeats_close_the_session() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 2);
    let mut mux = TestEndpoint::new(3700, true);

    connect_upstream(&mut sim, &mut mux, &mut gw);
    gw.answer_heartbeats = false;

    sim.advance(Duration::from_secs(60));
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.heartbeats_seen, 1);
    assert!(mux.endpoint.upstream_established());

    // first miss: another probe goes out immediately
    sim.advance(Duration::from_secs(10));
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.heartbeats_seen, 2);
    let status = mux.endpoint.status(sim.time);
    assert_eq!(status.upstream.unwrap().missed_heartbeats, 1);

    // second consecutive miss: the session is dead
    sim.advance(Duration::from_secs(10));
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::UpstreamLost {
            reason: ConnectionError::HeartbeatLost,
        }
    )));
    assert!(mux.endpoint.status(sim.time).upstream.is_none());
}

#[test]
fn late_heartbeat_reply_resets_the_miss_counter() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 2);
    let mut mux = TestEndpoint::new(3700, true);

    connect_upstream(&mut sim, &mut mux, &mut gw);
    gw.answer_heartbeats = false;

    sim.advance(Duration::from_secs(60));
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    assert_eq!(gw.heartbeats_seen, 1);

    // the reply deadline passes: one miss on the books, follow-up probe
    // built but not yet delivered
    gw.answer_heartbeats = true;
    sim.advance(Duration::from_secs(10));
    mux.handle_timeout(sim.time);
    assert_eq!(
        mux.endpoint
            .status(sim.time)
            .upstream
            .as_ref()
            .unwrap()
            .missed_heartbeats,
        1
    );

    // the answered follow-up wipes the miss count
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);
    let status = mux.endpoint.status(sim.time);
    assert_eq!(status.upstream.unwrap().missed_heartbeats, 0);
    assert!(mux.endpoint.upstream_established());
}

#[test]
fn loopback_pair_flagged_once_and_skips_the_wire() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut mux = TestEndpoint::new(3700, true);

    // upstream configured to point at our own server
    mux.endpoint.connect(sim.time, mux.addr).unwrap();
    drive(&mut sim, &mut [&mut mux as &mut dyn Node]);

    let status = mux.endpoint.status(sim.time);
    assert_eq!(status.upstream.as_ref().unwrap().connection.loopback, Some(true));
    assert_eq!(status.downstream.len(), 1);
    assert_eq!(status.downstream[0].loopback, Some(true));

    // repeating the detection scan must not toggle anything
    mux.endpoint.scan_loopback();
    let again = mux.endpoint.status(sim.time);
    assert_eq!(again.upstream.as_ref().unwrap().connection.loopback, Some(true));
    assert_eq!(again.downstream[0].loopback, Some(true));

    // shutdown between the two roles stays in-process
    mux.endpoint.close();
    assert!(mux.endpoint.poll_transmit().is_none());
}

#[test]
fn exhausted_destination_is_cleared_without_stalling_others() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 30);
    let mut mux = TestEndpoint::new(3700, true);
    let mut good = FakePeer::client(3800);
    let mut stalled = FakePeer::client(3801);
    stalled.ack_tunneling = false;

    connect_upstream(&mut sim, &mut mux, &mut gw);
    good.connect(mux.addr);
    stalled.connect(mux.addr);
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut good, &mut stalled],
    );
    assert_eq!(good.channel, 1);
    assert_eq!(stalled.channel, 2);

    gw.send_telegram(ind_telegram());
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut good, &mut stalled],
    );
    // the well-behaved peer is done; the stalled one keeps the entry alive
    assert_eq!(good.telegrams.len(), 1);
    assert_eq!(mux.endpoint.status(sim.time).queue_depth, 1);

    for _ in 0..3 {
        sim.advance(Duration::from_secs(1));
        drive(
            &mut sim,
            &mut [&mut mux as &mut dyn Node, &mut gw, &mut good, &mut stalled],
        );
    }
    assert_eq!(stalled.requests_seen, 3);
    assert_eq!(stalled.disconnects, 1);
    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::PeerDisconnected {
            channel: ChannelId(2),
            reason: ConnectionError::AckTimedOut { attempts: 3 },
        }
    )));
    // the entry completed for everyone else and was removed from the head
    assert_eq!(mux.endpoint.status(sim.time).queue_depth, 0);
    assert_eq!(mux.endpoint.status(sim.time).downstream.len(), 1);
    assert_eq!(good.telegrams.len(), 1);
}

#[test]
fn reconnect_reuses_the_channel_with_a_fresh_connection_id() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut mux = TestEndpoint::new(3700, true);
    let mut client = FakePeer::client(3800);

    client.connect(mux.addr);
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut client]);
    let first = mux.endpoint.status(sim.time).downstream[0].clone();
    assert_eq!(first.channel, 1);

    client.connect(mux.addr);
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut client]);
    let status = mux.endpoint.status(sim.time);
    assert_eq!(status.downstream.len(), 1);
    assert_eq!(status.downstream[0].channel, 1);
    assert!(status.downstream[0].conn_id > first.conn_id);
    assert_eq!(client.channel, 1);
}

#[test]
fn front_end_relay_reports_completion_by_serial() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 11);
    let mut mux = TestEndpoint::new(3700, true);

    // nowhere to relay to yet
    assert_eq!(
        mux.endpoint.enqueue(sim.time, req_telegram()),
        Err(EnqueueError::UpstreamClosed)
    );

    connect_upstream(&mut sim, &mut mux, &mut gw);
    let serial = mux.endpoint.enqueue(sim.time, req_telegram()).unwrap();
    drive(&mut sim, &mut [&mut mux as &mut dyn Node, &mut gw]);

    mux.pump();
    assert!(mux
        .events
        .iter()
        .any(|e| matches!(e, Event::Relayed { serial: s } if *s == serial)));
    assert_eq!(gw.telegrams.len(), 1);
    assert_eq!(mux.endpoint.status(sim.time).queue_depth, 0);
}

#[test]
fn denied_telegram_is_acked_but_not_relayed() {
    struct ReadOnly;
    impl Authorize for ReadOnly {
        fn classify(&self, _remote: SocketAddr) -> AccessClass {
            AccessClass::ReadOnly
        }
    }

    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 5);
    let mut mux = TestEndpoint::with_server_config(
        3700,
        Some(ServerConfig::new(Arc::new(ReadOnly))),
        EndpointConfig::default(),
    );
    let mut client = FakePeer::client(3800);

    connect_upstream(&mut sim, &mut mux, &mut gw);
    client.connect(mux.addr);
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );

    // a write from a read-only peer: acknowledged, gated, not forwarded
    client.send_telegram(req_telegram());
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert_eq!(client.acks, vec![0]);
    assert!(gw.telegrams.is_empty());
    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::Denied {
            channel: ChannelId(1),
            ..
        }
    )));

    // a read from the same peer passes the gate
    let read = LData::group_read(IndividualAddr::new(1, 1, 9), GroupAddr::new(2, 0, 1)).encode();
    client.send_telegram(read);
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert_eq!(client.acks, vec![0, 1]);
    assert_eq!(gw.telegrams.len(), 1);
}

#[test]
fn connect_refused_when_table_is_full() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut config = EndpointConfig::default();
    config.max_connections(1);
    let mut mux = TestEndpoint::with_config(3700, true, config);
    let mut first = FakePeer::client(3800);
    let mut second = FakePeer::client(3801);

    first.connect(mux.addr);
    second.connect(mux.addr);
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut first, &mut second],
    );

    assert_eq!(first.channel, 1);
    assert_eq!(second.refused, Some(crate::ErrorCode::NO_MORE_CONNECTIONS));
    assert_eq!(mux.endpoint.status(sim.time).downstream.len(), 1);
}

#[test]
fn silent_downstream_peer_is_dropped_after_the_alive_window() {
    let _guard = subscribe();
    let mut sim = Sim::new();
    let mut gw = FakePeer::gateway(3671, 8);
    let mut mux = TestEndpoint::new(3700, true);
    let mut client = FakePeer::client(3800);

    connect_upstream(&mut sim, &mut mux, &mut gw);
    client.connect(mux.addr);
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert_eq!(mux.endpoint.status(sim.time).downstream.len(), 1);

    // the client never sends a connectionstate request
    sim.advance(Duration::from_secs(120));
    drive(
        &mut sim,
        &mut [&mut mux as &mut dyn Node, &mut gw, &mut client],
    );
    assert!(mux.events.iter().any(|e| matches!(
        e,
        Event::PeerDisconnected {
            channel: ChannelId(1),
            reason: ConnectionError::PeerTimedOut,
        }
    )));
    assert_eq!(mux.endpoint.status(sim.time).downstream.len(), 0);
    assert_eq!(client.disconnects, 1);
    // the upstream session survived on answered keep-alives
    assert!(mux.endpoint.upstream_established());
}
