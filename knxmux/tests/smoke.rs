use std::time::Duration;

use anyhow::Result;
use tokio::{net::UdpSocket, time::timeout};

use knxmux::{
    frame::{GroupAddr, IndividualAddr, LData, MessageCode},
    ConnectionHeader, ConsumerClass, Crd, EndpointConfig, EnqueueError, ErrorCode, Event, Hpai,
    Multiplexer, Packet, RelayError, ServerConfig, STATUS_VERSION,
};

const WAIT: Duration = Duration::from_secs(5);

fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn bind_server() -> Result<Multiplexer> {
    Ok(Multiplexer::bind(
        "127.0.0.1:0".parse()?,
        EndpointConfig::default(),
        Some(ServerConfig::default()),
    )
    .await?)
}

fn write_telegram() -> bytes::Bytes {
    LData::group_write(IndividualAddr::new(1, 1, 1), GroupAddr::new(1, 0, 7), &[1]).encode()
}

#[tokio::test]
async fn downstream_relay_is_acknowledged_end_to_end() -> Result<()> {
    subscribe();
    let mut gateway = bind_server().await?;
    let client = Multiplexer::bind("127.0.0.1:0".parse()?, EndpointConfig::default(), None).await?;

    timeout(WAIT, client.connect_upstream(gateway.local_addr())).await??;
    let event = timeout(WAIT, gateway.event()).await?;
    assert!(matches!(event, Some(Event::PeerConnected { .. })));

    // supervised send: resolves only after the gateway acknowledged
    timeout(WAIT, client.relay(write_telegram())).await??;

    let status = client.status().await?;
    assert_eq!(status.queue_depth, 0);
    assert!(status.upstream.is_some());
    assert_eq!(gateway.status().await?.downstream.len(), 1);

    client.shutdown().await;
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bus_telegram_reaches_registered_consumer() -> Result<()> {
    subscribe();
    let gateway = UdpSocket::bind("127.0.0.1:0").await?;
    let gateway_addr = gateway.local_addr()?;
    let mux = bind_server().await?;
    let mut consumer = mux.register_consumer(ConsumerClass::Eibd)?;

    let gateway_task = tokio::spawn(async move {
        let mut buf = [0u8; 1500];

        let (len, from) = gateway.recv_from(&mut buf).await.unwrap();
        let packet = Packet::decode(&buf[..len]).unwrap();
        assert!(matches!(packet, Packet::ConnectRequest { .. }));
        let response = Packet::ConnectResponse {
            channel: 21,
            status: ErrorCode::NO_ERROR,
            data: Some(Hpai::udp(gateway.local_addr().unwrap())),
            crd: Some(Crd {
                addr: IndividualAddr::new(1, 1, 200),
            }),
        };
        gateway.send_to(&response.encode(), from).await.unwrap();

        // one telegram from the bus
        let cemi = LData::group_write(IndividualAddr::new(2, 3, 4), GroupAddr::new(1, 0, 7), &[1])
            .with_code(MessageCode::LDataInd)
            .encode();
        let request = Packet::TunnelingRequest {
            header: ConnectionHeader {
                channel: 21,
                seq: 0,
                status: ErrorCode::NO_ERROR,
            },
            cemi,
        };
        gateway.send_to(&request.encode(), from).await.unwrap();

        // the multiplexer must acknowledge it
        loop {
            let (len, _) = gateway.recv_from(&mut buf).await.unwrap();
            if let Ok(Packet::TunnelingAck { header }) = Packet::decode(&buf[..len]) {
                assert_eq!(header.seq, 0);
                assert!(header.status.is_ok());
                return;
            }
        }
    });

    timeout(WAIT, mux.connect_upstream(gateway_addr)).await??;
    let telegram = timeout(WAIT, consumer.recv()).await?.expect("telegram");
    let frame = LData::parse(&telegram.cemi)?;
    assert_eq!(frame.dest().to_string(), "1/0/7");
    assert_eq!(frame.code, MessageCode::LDataInd);

    timeout(WAIT, gateway_task).await??;
    mux.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn loopback_upstream_into_own_server() -> Result<()> {
    subscribe();
    let mux = bind_server().await?;

    timeout(WAIT, mux.connect_upstream(mux.local_addr())).await??;

    let status = mux.status().await?;
    assert_eq!(
        status.upstream.as_ref().unwrap().connection.loopback,
        Some(true)
    );
    assert_eq!(status.downstream.len(), 1);
    assert_eq!(status.downstream[0].loopback, Some(true));

    // loopback relays complete without re-entering the wire protocol
    timeout(WAIT, mux.relay(write_telegram())).await??;

    mux.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn status_snapshot_is_versioned_and_relay_needs_upstream() -> Result<()> {
    subscribe();
    let mux = bind_server().await?;

    let status = mux.status().await?;
    assert_eq!(status.version, STATUS_VERSION);
    assert!(status.upstream.is_none());
    assert_eq!(status.queue_depth, 0);

    let err = mux.relay(write_telegram()).await.unwrap_err();
    assert!(matches!(
        err,
        RelayError::Enqueue(EnqueueError::UpstreamClosed)
    ));

    mux.shutdown().await;
    Ok(())
}
