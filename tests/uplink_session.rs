use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use uuid::Uuid;

use fieldgate::{
    CancelReason, DeviceId, DevicePrefix, GwMessage, IdentityConfig, LinkState, ModuleId,
    UplinkConnector, UplinkConfig, UplinkError,
};

fn test_config(port: u16) -> UplinkConfig {
    UplinkConfig {
        host: "127.0.0.1".to_string(),
        port,
        poll_timeout: Duration::from_millis(50),
        receive_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        retry_connect_timeout: Duration::from_millis(100),
        busy_sleep: Duration::from_millis(200),
        resend_timeout: Duration::from_secs(2),
        ..UplinkConfig::default()
    }
}

fn identity() -> IdentityConfig {
    IdentityConfig {
        id: "gw-under-test".to_string(),
        version: "0.0.0".to_string(),
    }
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

fn decode(message: &Message) -> Option<GwMessage> {
    match message {
        Message::Text(text) => GwMessage::from_frame(text.as_str(), 64 * 1024).ok(),
        _ => None,
    }
}

async fn send(socket: &mut WebSocketStream<TcpStream>, message: &GwMessage) {
    let frame = message.to_frame().expect("frame should encode");
    socket
        .send(Message::Text(frame.into()))
        .await
        .expect("server send should succeed");
}

/// Accepts one WebSocket connection and completes the register/ack
/// exchange.
async fn accept_and_register(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept should succeed");
    let mut socket = accept_async(stream).await.expect("upgrade should succeed");

    loop {
        let frame = socket
            .next()
            .await
            .expect("client should send a frame")
            .expect("register read should succeed");
        if let Some(GwMessage::Register { id, gateway_id, .. }) = decode(&frame) {
            assert_eq!("gw-under-test", gateway_id);
            send(&mut socket, &GwMessage::RegisterAck { id }).await;
            return socket;
        }
    }
}

async fn wait_for_state(
    connector: &UplinkConnector,
    target: LinkState,
    within: Duration,
) -> bool {
    let mut state = connector.state();
    tokio::time::timeout(within, state.wait_for(|s| *s == target))
        .await
        .is_ok()
}

#[tokio::test]
async fn happy_uplink_answers_requests_without_reconnect() {
    let (listener, port) = bind().await;
    let accepts = Arc::new(AtomicUsize::new(0));

    let server_accepts = Arc::clone(&accepts);
    let server = tokio::spawn(async move {
        let mut socket = accept_and_register(&listener).await;
        server_accepts.fetch_add(1, Ordering::SeqCst);

        while let Some(Ok(frame)) = socket.next().await {
            if let Some(GwMessage::DeviceListRequest { id, .. }) = decode(&frame) {
                send(
                    &mut socket,
                    &GwMessage::DeviceListResponse {
                        id,
                        devices: vec![DeviceId::new(DevicePrefix::VirtualDevice, 1)],
                    },
                )
                .await;
            }
        }
    });

    let (connector, _commands) =
        UplinkConnector::new(test_config(port), identity()).expect("connector should build");
    connector.start();

    assert!(
        wait_for_state(&connector, LinkState::Ready, Duration::from_secs(1)).await,
        "sender should reach ready within a second"
    );

    let response = connector
        .send_and_wait(
            GwMessage::DeviceListRequest {
                id: Uuid::new_v4(),
                device_prefix: DevicePrefix::VirtualDevice,
            },
            Duration::from_secs(2),
        )
        .await
        .expect("request should be answered");

    assert_matches!(response, GwMessage::DeviceListResponse { devices, .. } if devices.len() == 1);
    assert_eq!(1, accepts.load(Ordering::SeqCst), "no reconnect expected");
    assert_eq!(0, connector.outstanding_requests());

    connector.stop().await;
    server.abort();
}

#[tokio::test]
async fn reconnect_on_read_error_cancels_outstanding_requests() {
    let (listener, port) = bind().await;
    let (request_seen_tx, mut request_seen_rx) = mpsc::unbounded_channel::<()>();

    let server = tokio::spawn(async move {
        // First session: swallow one request, then kill the socket.
        let mut socket = accept_and_register(&listener).await;
        let frame = socket.next().await;
        assert!(frame.is_some(), "expected the unanswered request");
        request_seen_tx.send(()).expect("test channel");
        drop(socket);

        // Second session proves the register exchange completes again.
        let socket = accept_and_register(&listener).await;
        socket
    });

    let (connector, _commands) =
        UplinkConnector::new(test_config(port), identity()).expect("connector should build");
    connector.start();
    assert!(wait_for_state(&connector, LinkState::Ready, Duration::from_secs(1)).await);

    let connector = Arc::new(connector);
    let waiter = Arc::clone(&connector);
    let pending = tokio::spawn(async move {
        waiter
            .send_and_wait(
                GwMessage::LastValueRequest {
                    id: Uuid::new_v4(),
                    device_id: DeviceId::new(DevicePrefix::VirtualDevice, 1),
                    module_id: ModuleId::new(0),
                },
                Duration::from_secs(5),
            )
            .await
    });

    request_seen_rx
        .recv()
        .await
        .expect("server should observe the request");

    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending request should resolve quickly after the kill")
        .expect("request task should not panic");
    assert_matches!(
        outcome,
        Err(UplinkError::Cancelled {
            reason: CancelReason::Disconnect
        })
    );

    // New register/ack exchange completes within retry + receive timeouts.
    assert!(
        wait_for_state(&connector, LinkState::Ready, Duration::from_secs(5)).await,
        "connector should re-register after the kill"
    );
    assert_eq!(0, connector.outstanding_requests());

    connector.stop().await;
    server.abort();
}

#[tokio::test]
async fn idle_sender_pings_and_watchdog_forces_reconnect() {
    let (listener, port) = bind().await;

    let (ping_count_tx, mut ping_count_rx) = mpsc::unbounded_channel::<usize>();
    let server = tokio::spawn(async move {
        let mut socket = accept_and_register(&listener).await;

        // Read (and implicitly pong) for a while, counting ping frames.
        let mut pings = 0usize;
        let reading = tokio::time::Instant::now() + Duration::from_millis(600);
        loop {
            let frame = tokio::time::timeout_at(reading, socket.next()).await;
            match frame {
                Ok(Some(Ok(Message::Ping(_)))) => pings += 1,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_)) | None) | Err(_) => break,
            }
        }
        ping_count_tx.send(pings).expect("test channel");

        // Go silent: no reads means no pongs, so the liveness watchdog
        // must tear the session down and re-register.
        let socket = accept_and_register(&listener).await;
        socket
    });

    let (connector, _commands) =
        UplinkConnector::new(test_config(port), identity()).expect("connector should build");
    connector.start();
    assert!(wait_for_state(&connector, LinkState::Ready, Duration::from_secs(1)).await);

    let pings = ping_count_rx
        .recv()
        .await
        .expect("server should report ping count");
    assert!(pings >= 1, "expected at least one idle ping, saw {pings}");

    assert!(
        wait_for_state(&connector, LinkState::Disconnected, Duration::from_secs(2)).await,
        "watchdog should drop the silent session"
    );
    assert!(
        wait_for_state(&connector, LinkState::Ready, Duration::from_secs(5)).await,
        "connector should re-register after the watchdog fired"
    );

    connector.stop().await;
    server.abort();
}

#[tokio::test]
async fn queued_messages_survive_reconnect_in_order() {
    let (listener, port) = bind().await;
    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel::<GwMessage>();

    let server = tokio::spawn(async move {
        // First session dies immediately after registration.
        let socket = accept_and_register(&listener).await;
        drop(socket);

        let mut socket = accept_and_register(&listener).await;
        while let Some(Ok(frame)) = socket.next().await {
            if let Some(message) = decode(&frame) {
                let _ = delivered_tx.send(message);
            }
        }
    });

    let (connector, _commands) =
        UplinkConnector::new(test_config(port), identity()).expect("connector should build");
    connector.start();
    assert!(wait_for_state(&connector, LinkState::Ready, Duration::from_secs(1)).await);
    assert!(
        wait_for_state(&connector, LinkState::Disconnected, Duration::from_secs(2)).await,
        "first session should collapse"
    );

    // Enqueue between sessions; both must arrive on the second session in
    // enqueue order.
    let first = GwMessage::SensorData {
        id: Uuid::new_v4(),
        device_id: DeviceId::new(DevicePrefix::VirtualDevice, 1),
        values: Vec::new(),
    };
    let second = GwMessage::SensorData {
        id: Uuid::new_v4(),
        device_id: DeviceId::new(DevicePrefix::VirtualDevice, 2),
        values: Vec::new(),
    };
    connector.send_message(first.clone());
    connector.send_message(second.clone());

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(message) = delivered_rx.recv().await {
                seen.push(message.id());
            }
        }
        seen
    })
    .await
    .expect("both messages should arrive on the new session");

    assert_eq!(vec![first.id(), second.id()], delivered);

    connector.stop().await;
    server.abort();
}
