mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use mindwave::reconnect::{AutoReconnect, ReconnectEvent, ReconnectPolicy};
use mindwave::retry::RetryPolicy;
use mindwave::{ConnectionState, Connector, DeviceStatus, HeadsetEvent};
use serde_json::json;
use tokio::time::timeout;

use support::mock_tgc::{MockTgcServer, STEP_TIMEOUT};

const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

async fn start_server_or_skip(test_name: &str) -> Option<MockTgcServer> {
    support::init_tracing();
    match MockTgcServer::start().await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock server: {err}");
            None
        }
    }
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value| sink.lock().unwrap().push(value))
}

#[tokio::test]
async fn start_gives_up_after_n_silent_attempts() {
    let server = match start_server_or_skip("start_gives_up_after_n_silent_attempts").await {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let (timeouts, on_timeout) = recorder::<u32>();
    let _timeouts = connector.on_timeout(on_timeout);
    let (states, on_state) = recorder::<ConnectionState>();
    let _states = connector.on_status_change(on_state);

    // The mock accepts every socket but never streams headset data.
    let connected = connector.start(3, ATTEMPT_TIMEOUT).await;

    assert!(!connected);
    assert_eq!(server.connection_count(), 3);
    assert_eq!(*timeouts.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(
        *states.lock().unwrap(),
        vec![ConnectionState::Connecting, ConnectionState::Disconnected]
    );
    assert_eq!(connector.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn start_fails_fast_when_nothing_listens() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = mindwave::config::ConnectorConfig::new("127.0.0.1", port);
    config.retry = mindwave::config::RetryConfig::immediate();
    let connector = Connector::new(config);
    let (timeouts, on_timeout) = recorder::<u32>();
    let _timeouts = connector.on_timeout(on_timeout);

    let connected = timeout(STEP_TIMEOUT, connector.start(2, ATTEMPT_TIMEOUT))
        .await
        .expect("start hung on a refused port");

    assert!(!connected);
    assert!(timeouts.lock().unwrap().is_empty());
    assert_eq!(connector.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn start_succeeds_on_second_attempt() {
    let mut server = match start_server_or_skip("start_succeeds_on_second_attempt").await {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let (timeouts, on_timeout) = recorder::<u32>();
    let _timeouts = connector.on_timeout(on_timeout);
    let mut states = connector.status_changes();
    let mut readings = connector.readings();

    let driver = tokio::spawn(async move {
        let mut silent = server.accept_connection().await;
        silent.recv_payload().await;
        let mut live = server.accept_connection().await;
        let payload = live.recv_payload().await;
        live.send_esense(40, 60).await;
        (server, live, payload)
    });

    assert!(connector.start(3, ATTEMPT_TIMEOUT).await);
    let (server, _live, payload) = driver.await.unwrap();

    assert_eq!(payload, json!({"enableRawOutput": true, "format": "Json"}));
    assert_eq!(server.connection_count(), 2);
    assert_eq!(*timeouts.lock().unwrap(), vec![1]);
    assert!(connector.is_connected());

    let reading = timeout(STEP_TIMEOUT, readings.next()).await.unwrap().unwrap();
    assert_eq!(reading.attention, Some(40));
    assert_eq!(reading.meditation, Some(60));

    let first = timeout(STEP_TIMEOUT, states.next()).await.unwrap();
    let second = timeout(STEP_TIMEOUT, states.next()).await.unwrap();
    assert_eq!(first, Some(ConnectionState::Connecting));
    assert_eq!(second, Some(ConnectionState::Connected));

    // Already streaming: no new socket.
    assert!(connector.start(1, ATTEMPT_TIMEOUT).await);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn raw_output_flag_is_sent_in_control_payload() {
    let mut server = match start_server_or_skip("raw_output_flag_is_sent_in_control_payload").await
    {
        Some(server) => server,
        None => return,
    };
    let mut config = server.connector_config();
    config.enable_raw_output = false;
    let connector = Connector::new(config);

    let driver = tokio::spawn(async move {
        let mut connection = server.accept_connection().await;
        let payload = connection.recv_payload().await;
        connection.send_esense(1, 1).await;
        (server, connection, payload)
    });

    assert!(connector.start(1, STEP_TIMEOUT).await);
    let (_server, _connection, payload) = driver.await.unwrap();
    assert_eq!(payload["enableRawOutput"], json!(false));
    assert_eq!(payload["format"], json!("Json"));
}

#[tokio::test]
async fn signal_quality_is_published_only_on_change() {
    let mut server = match start_server_or_skip("signal_quality_is_published_only_on_change").await
    {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let (qualities, on_quality) = recorder::<f32>();
    let _quality = connector.on_signal_quality_change(on_quality);
    let mut readings = connector.readings();

    let connection = {
        let connect = connector.start(1, STEP_TIMEOUT);
        let accept = async {
            let mut connection = server.accept_connection().await;
            connection.recv_payload().await;
            connection.send_esense(10, 10).await;
            connection
        };
        let (connected, connection) = tokio::join!(connect, accept);
        assert!(connected);
        connection
    };
    let _ = timeout(STEP_TIMEOUT, readings.next()).await.unwrap();

    for level in [0, 26, 26, 200, 200, 0] {
        connection.send_poor_signal(level).await;
    }
    // Frames are handled in order, so this reading marks the end.
    connection.send_esense(99, 99).await;
    let marker = timeout(STEP_TIMEOUT, readings.next()).await.unwrap().unwrap();
    assert_eq!(marker.attention, Some(99));

    assert_eq!(*qualities.lock().unwrap(), vec![100.0, 87.0, 0.0, 100.0]);
    assert_eq!(connector.signal_quality(), 100.0);
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let mut server = match start_server_or_skip("malformed_frames_are_skipped").await {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let mut readings = connector.readings();

    let connection = {
        let connect = connector.start(1, STEP_TIMEOUT);
        let accept = async {
            let mut connection = server.accept_connection().await;
            connection.recv_payload().await;
            connection.send_esense(5, 6).await;
            connection
        };
        let (connected, connection) = tokio::join!(connect, accept);
        assert!(connected);
        connection
    };
    let _ = timeout(STEP_TIMEOUT, readings.next()).await.unwrap();

    connection.send_raw(&b"{not json\r"[..]).await;
    connection
        .send_frame(json!({"eSense": {"attention": 250, "meditation": 1}}))
        .await;
    connection.send_raw(&b"\r\n\r\n"[..]).await;
    // One frame split across two writes.
    connection.send_raw(&br#"{"eSense":{"attention":7,"#[..]).await;
    connection.send_raw(&b"\"meditation\":8}}\r"[..]).await;

    let reading = timeout(STEP_TIMEOUT, readings.next()).await.unwrap().unwrap();
    assert_eq!(reading.attention, Some(7));
    assert_eq!(reading.meditation, Some(8));
    assert!(connector.is_connected());
}

#[tokio::test]
async fn blink_frames_publish_data_and_blink() {
    let mut server = match start_server_or_skip("blink_frames_publish_data_and_blink").await {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let (blinks, on_blink) = recorder::<u8>();
    let _blinks = connector.on_blink(move |strength, _at| on_blink(strength));
    let mut readings = connector.readings();

    let connect = connector.start(1, STEP_TIMEOUT);
    let accept = async {
        let mut connection = server.accept_connection().await;
        connection.recv_payload().await;
        connection.send_frame(json!({"blinkStrength": 77})).await;
        connection
    };
    let (connected, _connection) = tokio::join!(connect, accept);
    assert!(connected);

    let reading = timeout(STEP_TIMEOUT, readings.next()).await.unwrap().unwrap();
    assert!(reading.is_blink_only());
    assert_eq!(*blinks.lock().unwrap(), vec![77]);
}

#[tokio::test]
async fn closed_socket_reports_connection_lost() {
    let mut server = match start_server_or_skip("closed_socket_reports_connection_lost").await {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let mut states = connector.status_changes();

    let connect = connector.start(1, STEP_TIMEOUT);
    let accept = async {
        let mut connection = server.accept_connection().await;
        connection.recv_payload().await;
        connection.send_esense(1, 2).await;
        connection
    };
    let (connected, connection) = tokio::join!(connect, accept);
    assert!(connected);

    connection.force_close().await;

    let mut seen = Vec::new();
    while let Ok(Some(state)) = timeout(STEP_TIMEOUT, states.next()).await {
        seen.push(state);
        if state == ConnectionState::ConnectionLost {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::ConnectionLost,
        ]
    );
    assert!(!connector.is_connected());

    // A lost connector can be started again.
    let connect = connector.start(1, STEP_TIMEOUT);
    let accept = async {
        let mut connection = server.accept_connection().await;
        connection.recv_payload().await;
        connection.send_esense(3, 4).await;
        connection
    };
    let (connected, _connection) = tokio::join!(connect, accept);
    assert!(connected);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn device_status_frame_while_connected_ends_the_stream() {
    let mut server =
        match start_server_or_skip("device_status_frame_while_connected_ends_the_stream").await {
            Some(server) => server,
            None => return,
        };
    let connector = Connector::new(server.connector_config());
    let (statuses, on_device_status) = recorder::<DeviceStatus>();
    let _device = connector.on_device_status(move |status: &DeviceStatus| {
        on_device_status(status.clone());
    });
    let mut states = connector.status_changes();

    let connect = connector.start(1, STEP_TIMEOUT);
    let accept = async {
        let mut connection = server.accept_connection().await;
        connection.recv_payload().await;
        connection.send_esense(1, 2).await;
        connection
    };
    let (connected, connection) = tokio::join!(connect, accept);
    assert!(connected);

    connection.send_frame(json!({"status": "scanning"})).await;

    let lost = async {
        while let Some(state) = states.next().await {
            if state == ConnectionState::ConnectionLost {
                return;
            }
        }
    };
    timeout(STEP_TIMEOUT, lost)
        .await
        .expect("no ConnectionLost after status frame");
    assert_eq!(*statuses.lock().unwrap(), vec![DeviceStatus::Scanning]);
    assert_eq!(connector.state(), ConnectionState::ConnectionLost);
}

#[tokio::test]
async fn stop_disconnects_and_is_idempotent() {
    let mut server = match start_server_or_skip("stop_disconnects_and_is_idempotent").await
    {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let (events, on_event) = recorder::<HeadsetEvent>();
    let _all = connector.bus().subscribe_all(move |event: &HeadsetEvent| {
        on_event(event.clone());
    });

    let connect = connector.start(1, STEP_TIMEOUT);
    let accept = async {
        let mut connection = server.accept_connection().await;
        connection.recv_payload().await;
        connection.send_esense(1, 2).await;
        connection
    };
    let (connected, connection) = tokio::join!(connect, accept);
    assert!(connected);

    connector.stop().await;
    assert_eq!(connector.state(), ConnectionState::Disconnected);
    assert!(!connector.is_connected());

    // A second stop is a no-op.
    connector.stop().await;
    drop(connection);

    let events = events.lock().unwrap();
    assert_eq!(
        events.last(),
        Some(&HeadsetEvent::Status(ConnectionState::Disconnected))
    );
    let data = events
        .iter()
        .filter(|event| matches!(event, HeadsetEvent::Data(_)))
        .count();
    assert_eq!(data, 1);
}

#[tokio::test]
async fn auto_reconnect_restores_the_stream() {
    let mut server = match start_server_or_skip("auto_reconnect_restores_the_stream").await {
        Some(server) => server,
        None => return,
    };
    let connector = Connector::new(server.connector_config());
    let policy = ReconnectPolicy {
        max_rounds: 3,
        tries_per_round: 1,
        attempt_timeout: STEP_TIMEOUT,
        backoff: RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
    };
    let reconnect = AutoReconnect::spawn(&connector, policy);
    let mut events = reconnect.event_receiver();
    let mut readings = connector.readings();

    let connect = connector.start(1, STEP_TIMEOUT);
    let accept = async {
        let mut connection = server.accept_connection().await;
        connection.recv_payload().await;
        connection.send_esense(1, 1).await;
        connection
    };
    let (connected, connection) = tokio::join!(connect, accept);
    assert!(connected);
    let _ = timeout(STEP_TIMEOUT, readings.next()).await.unwrap();

    connection.force_close().await;

    let mut replacement = server.accept_connection().await;
    replacement.recv_payload().await;
    replacement.send_esense(2, 2).await;

    let mut seen = Vec::new();
    while let Ok(Ok(event)) = timeout(STEP_TIMEOUT, events.recv()).await {
        let done = matches!(event, ReconnectEvent::Reconnected { .. });
        seen.push(event);
        if done {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            ReconnectEvent::Lost,
            ReconnectEvent::Reconnecting { round: 1 },
            ReconnectEvent::Reconnected { round: 1 },
        ]
    );

    // Subscriptions made before the loss still receive data.
    let reading = timeout(STEP_TIMEOUT, readings.next()).await.unwrap().unwrap();
    assert_eq!(reading.attention, Some(2));
    reconnect.shutdown();
}
