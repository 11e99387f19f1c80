#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mindwave::config::{ConnectorConfig, RetryConfig};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

enum ConnectionCommand {
    Send(Vec<u8>),
    ForceClose,
}

/// One client socket accepted by [`MockTgcServer`].
pub struct MockConnection {
    index: usize,
    payload_rx: mpsc::Receiver<Value>,
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Next JSON value the client wrote (the control payload).
    pub async fn recv_payload(&mut self) -> Value {
        timeout(STEP_TIMEOUT, self.payload_rx.recv())
            .await
            .expect("timed out waiting for control payload")
            .expect("mock connection payload channel closed")
    }

    /// Write `value` followed by the `\r` frame delimiter.
    pub async fn send_frame(&self, value: Value) {
        let mut bytes = value.to_string().into_bytes();
        bytes.push(b'\r');
        self.send_raw(bytes).await;
    }

    pub async fn send_raw(&self, bytes: impl Into<Vec<u8>>) {
        self.command_tx
            .send(ConnectionCommand::Send(bytes.into()))
            .await
            .expect("failed to send command to mock connection");
    }

    pub async fn send_esense(&self, attention: u8, meditation: u8) {
        self.send_frame(json!({
            "eSense": {"attention": attention, "meditation": meditation},
            "poorSignalLevel": 0,
        }))
        .await;
    }

    pub async fn send_poor_signal(&self, level: u8) {
        self.send_frame(json!({"poorSignalLevel": level})).await;
    }

    pub async fn force_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::ForceClose).await;
    }
}

/// Local stand-in for the ThinkGear Connector.
pub struct MockTgcServer {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockConnection>,
    accepted: Arc<AtomicUsize>,
    server_task: JoinHandle<()>,
}

impl MockTgcServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };

                let connection_tx = connection_tx.clone();
                let connection_index = counter.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let (payload_tx, payload_rx) = mpsc::channel(16);
                    let (command_tx, mut command_rx) = mpsc::channel(64);

                    let connection = MockConnection {
                        index: connection_index,
                        payload_rx,
                        command_tx,
                    };
                    if connection_tx.send(connection).await.is_err() {
                        return;
                    }

                    let mut pending = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        tokio::select! {
                            maybe_command = command_rx.recv() => {
                                match maybe_command {
                                    Some(ConnectionCommand::Send(bytes)) => {
                                        if writer.write_all(&bytes).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(ConnectionCommand::ForceClose) | None => break,
                                }
                            }
                            read = reader.read(&mut chunk) => {
                                match read {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        pending.extend_from_slice(&chunk[..n]);
                                        for value in drain_json(&mut pending) {
                                            let _ = payload_tx.send(value).await;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            accepted,
            server_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connector config pointed at this server, with no retry backoff.
    pub fn connector_config(&self) -> ConnectorConfig {
        let mut config = ConnectorConfig::new(self.addr.ip().to_string(), self.addr.port());
        config.retry = RetryConfig::immediate();
        config
    }

    /// Sockets accepted so far.
    pub fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock server connection channel closed")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(connection)) => Some(connection),
            _ => None,
        }
    }
}

impl Drop for MockTgcServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

/// Pull every complete JSON value off the front of `pending`.
fn drain_json(pending: &mut Vec<u8>) -> Vec<Value> {
    let mut values = Vec::new();
    let mut stream = serde_json::Deserializer::from_slice(pending).into_iter::<Value>();
    let mut consumed = 0;
    while let Some(Ok(value)) = stream.next() {
        consumed = stream.byte_offset();
        values.push(value);
    }
    pending.drain(..consumed);
    values
}
