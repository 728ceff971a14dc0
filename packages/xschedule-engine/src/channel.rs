//! Push channel to the device
//!
//! One logical, auto-healing WebSocket connection. The device pushes status
//! objects on it unsolicited; queries and commands can be sent back over
//! the same socket while it is up. A background task owns the socket and
//! runs `Disconnected → Connecting → Connected → Backoff → Connecting → …`
//! until shut down, doubling the reconnect delay on consecutive failures
//! (capped) and resetting it on any successful connection.
//!
//! Every received text frame is JSON-decoded; decode failures are logged
//! and dropped without killing the channel, and every decoded JSON object
//! is forwarded to the payload sink unfiltered; deciding what a payload
//! means is the status synchronizer's job, not this layer's.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::protocol::OutboundMessage;

/// Capacity of the outbound message buffer
const OUTGOING_BUFFER: usize = 32;

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not running, or shut down
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Socket is up; pushes flow and sends are accepted
    Connected,
    /// Waiting out the reconnect delay after a failure
    Backoff,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Backoff => write!(f, "backoff"),
        }
    }
}

/// A send was refused because the channel cannot deliver it right now;
/// callers fall back to the HTTP gateway
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelSendError {
    #[error("push channel is not connected")]
    NotConnected,
}

/// Connection parameters the run loop needs
#[derive(Debug, Clone)]
struct ChannelConfig {
    url: String,
    password_hash: Option<String>,
    heartbeat_interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    connect_timeout: Duration,
}

/// Handles for one run of the background task
struct Session {
    outgoing_tx: mpsc::Sender<OutboundMessage>,
    shutdown_tx: mpsc::Sender<()>,
    run_handle: JoinHandle<()>,
}

/// Auto-reconnecting WebSocket client for the device's push feed
pub(crate) struct PushChannel {
    config: ChannelConfig,
    payload_tx: mpsc::Sender<Value>,
    state: Arc<RwLock<ChannelState>>,
    session: Mutex<Option<Session>>,
}

impl PushChannel {
    pub(crate) fn new(device: &DeviceConfig, payload_tx: mpsc::Sender<Value>) -> Self {
        Self {
            config: ChannelConfig {
                url: device.ws_url(),
                password_hash: device.password_hash(),
                heartbeat_interval: device.heartbeat_interval,
                initial_backoff: device.reconnect_initial_delay,
                max_backoff: device.reconnect_max_delay,
                connect_timeout: device.connect_timeout,
            },
            payload_tx,
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            session: Mutex::new(None),
        }
    }

    /// Start the connection loop. Idempotent while already running.
    pub(crate) async fn connect(&self) {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if !existing.run_handle.is_finished() {
                warn!("push channel already running");
                return;
            }
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let run_handle = tokio::spawn(run(
            self.config.clone(),
            Arc::clone(&self.state),
            self.payload_tx.clone(),
            outgoing_rx,
            shutdown_rx,
        ));

        *session = Some(Session {
            outgoing_tx,
            shutdown_tx,
            run_handle,
        });
    }

    /// Stop the connection loop (and with it the heartbeat) and wait for
    /// it to finish. No background activity survives this call.
    pub(crate) async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(session) = session.take() {
            debug!("disconnecting push channel");
            let _ = session.shutdown_tx.send(()).await;
            let _ = session.run_handle.await;
        }
        set_state(&self.state, ChannelState::Disconnected);
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Send a query over the channel; fails fast when not connected
    pub(crate) async fn send_query(
        &self,
        name: &str,
        parameters: &str,
    ) -> Result<(), ChannelSendError> {
        self.send(
            OutboundMessage::query(name, parameters)
                .with_pass(self.config.password_hash.clone()),
        )
        .await
    }

    /// Send a command over the channel; fails fast when not connected
    pub(crate) async fn send_command(
        &self,
        name: &str,
        parameters: &str,
    ) -> Result<(), ChannelSendError> {
        self.send(
            OutboundMessage::command(name, parameters)
                .with_pass(self.config.password_hash.clone()),
        )
        .await
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), ChannelSendError> {
        if !self.is_connected() {
            return Err(ChannelSendError::NotConnected);
        }

        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(ChannelSendError::NotConnected);
        };
        session
            .outgoing_tx
            .send(message)
            .await
            .map_err(|_| ChannelSendError::NotConnected)
    }
}

fn set_state(state: &RwLock<ChannelState>, next: ChannelState) {
    *state.write().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Next reconnect delay: double, capped
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Why the connection loop returned
enum LoopExit {
    /// Shutdown requested; stop for good
    Shutdown,
    /// Socket failed or closed; reconnect after backoff
    ConnectionLost,
    /// The payload receiver is gone; the owner was torn down
    SinkClosed,
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

async fn run(
    config: ChannelConfig,
    state: Arc<RwLock<ChannelState>>,
    payload_tx: mpsc::Sender<Value>,
    mut outgoing_rx: mpsc::Receiver<OutboundMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    info!(url = %config.url, "push channel starting");

    let mut delay = config.initial_backoff;

    loop {
        set_state(&state, ChannelState::Connecting);

        match timeout(config.connect_timeout, connect_async(&config.url)).await {
            Ok(Ok((ws, _response))) => {
                info!(url = %config.url, "push channel connected");
                set_state(&state, ChannelState::Connected);
                delay = config.initial_backoff;

                let exit = connection_loop(
                    &config,
                    ws,
                    &mut outgoing_rx,
                    &payload_tx,
                    &mut shutdown_rx,
                )
                .await;

                match exit {
                    LoopExit::Shutdown | LoopExit::SinkClosed => break,
                    LoopExit::ConnectionLost => {}
                }
            }
            Ok(Err(e)) => warn!(error = %e, "push channel connect failed"),
            Err(_) => warn!(
                timeout_secs = config.connect_timeout.as_secs(),
                "push channel connect timed out"
            ),
        }

        set_state(&state, ChannelState::Backoff);
        debug!(delay_secs = delay.as_secs(), "waiting before reconnect");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => break,
        }

        delay = next_backoff(delay, config.max_backoff);
    }

    set_state(&state, ChannelState::Disconnected);
    info!("push channel stopped");
}

async fn connection_loop(
    config: &ChannelConfig,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outgoing_rx: &mut mpsc::Receiver<OutboundMessage>,
    payload_tx: &mpsc::Sender<Value>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> LoopExit {
    let (mut write, mut read) = ws.split();

    // First tick one full interval after connect; the device pushes real
    // changes on its own, the heartbeat only covers quiet periods
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(message) = outgoing_rx.recv() => {
                debug!(kind = message.kind(), "sending channel message");
                if !write_message(&mut write, &message).await {
                    return LoopExit::ConnectionLost;
                }
            }

            message = read.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Value>(text.as_str()) {
                            // Forward every decoded object, recognized shape
                            // or not
                            Ok(value @ Value::Object(_)) => {
                                if payload_tx.send(value).await.is_err() {
                                    warn!("payload receiver dropped, stopping channel");
                                    return LoopExit::SinkClosed;
                                }
                            }
                            Ok(_) => debug!("ignoring non-object frame"),
                            Err(e) => warn!(error = %e, "dropping undecodable frame"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if write.send(WsMessage::Pong(data)).await.is_err() {
                            return LoopExit::ConnectionLost;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "push channel closed by device");
                        return LoopExit::ConnectionLost;
                    }
                    Some(Ok(_)) => {
                        // Binary and raw frames are not part of the protocol
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "push channel read error");
                        return LoopExit::ConnectionLost;
                    }
                    None => {
                        info!("push channel stream ended");
                        return LoopExit::ConnectionLost;
                    }
                }
            }

            _ = heartbeat.tick() => {
                // Surface state even if the device is not pushing
                for name in ["GetPlayingStatus", "GetQueuedSteps"] {
                    let message = OutboundMessage::query(name, "")
                        .with_pass(config.password_hash.clone());
                    if !write_message(&mut write, &message).await {
                        return LoopExit::ConnectionLost;
                    }
                }
                debug!("sent heartbeat queries");
            }

            _ = shutdown_rx.recv() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return LoopExit::Shutdown;
            }
        }
    }
}

/// Serialize and send one envelope; false means the connection is gone
async fn write_message(write: &mut WsWriter, message: &OutboundMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize channel message");
            return true;
        }
    };

    match write.send(WsMessage::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "channel send failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn test_device(port: u16) -> DeviceConfig {
        DeviceConfig::new("127.0.0.1", port)
            .with_reconnect_delays(Duration::from_millis(50), Duration::from_millis(200))
    }

    async fn wait_connected(channel: &PushChannel) {
        timeout(Duration::from_secs(5), async {
            while !channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("channel should connect");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let max = Duration::from_secs(60);
        let mut delay = Duration::from_secs(5);

        let mut observed = Vec::new();
        for _ in 0..5 {
            delay = next_backoff(delay, max);
            observed.push(delay.as_secs());
        }

        assert_eq!(observed, vec![10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_channel_state_display() {
        assert_eq!(ChannelState::Connected.to_string(), "connected");
        assert_eq!(ChannelState::Backoff.to_string(), "backoff");
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        let (payload_tx, _payload_rx) = mpsc::channel(8);
        let channel = PushChannel::new(&test_device(9), payload_tx);

        let result = channel.send_command("Stop", "").await;
        assert_eq!(result, Err(ChannelSendError::NotConnected));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_forwards_objects_and_drops_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(WsMessage::Text(r#"{"status":"playing"}"#.into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text("definitely not json".into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text(r#"[1,2,3]"#.into())).await.unwrap();
            ws.send(WsMessage::Text(r#"{"status":"paused","unknown":"x"}"#.into()))
                .await
                .unwrap();

            // Hold the socket open until the client closes it
            while let Some(message) = ws.next().await {
                if matches!(message, Ok(WsMessage::Close(_)) | Err(_)) {
                    break;
                }
            }
        });

        let (payload_tx, mut payload_rx) = mpsc::channel(8);
        let channel = PushChannel::new(&test_device(port), payload_tx);
        channel.connect().await;

        let first = timeout(Duration::from_secs(5), payload_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, json!({"status": "playing"}));

        // The garbage frame and the array were dropped, not forwarded
        let second = timeout(Duration::from_secs(5), payload_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            second.get("status").and_then(Value::as_str),
            Some("paused")
        );

        assert!(channel.is_connected());
        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_envelope_over_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let received = loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => break text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("expected a text frame, got {other:?}"),
                }
            };

            while let Some(message) = ws.next().await {
                if matches!(message, Ok(WsMessage::Close(_)) | Err(_)) {
                    break;
                }
            }

            received
        });

        let (payload_tx, _payload_rx) = mpsc::channel(8);
        let channel = PushChannel::new(&test_device(port), payload_tx);
        channel.connect().await;
        wait_connected(&channel).await;

        channel
            .send_command("Play specified playlist", "Halloween")
            .await
            .unwrap();
        channel.disconnect().await;

        let received: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(
            received,
            json!({
                "Type": "Command",
                "Command": "Play specified playlist",
                "Parameters": "Halloween"
            })
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_running() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(message) = ws.next().await {
                if matches!(message, Ok(WsMessage::Close(_)) | Err(_)) {
                    break;
                }
            }
        });

        let (payload_tx, _payload_rx) = mpsc::channel(8);
        let channel = PushChannel::new(&test_device(port), payload_tx);
        channel.connect().await;
        wait_connected(&channel).await;

        // Second connect is a no-op, not a second run loop
        channel.connect().await;
        assert!(channel.is_connected());

        channel.disconnect().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // First connection: accept, push one payload, drop abruptly
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"status":"playing"}"#.into()))
                .await
                .unwrap();
            drop(ws);

            // Second connection: the channel came back on its own
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"status":"idle"}"#.into()))
                .await
                .unwrap();
            while let Some(message) = ws.next().await {
                if matches!(message, Ok(WsMessage::Close(_)) | Err(_)) {
                    break;
                }
            }
        });

        let (payload_tx, mut payload_rx) = mpsc::channel(8);
        let channel = PushChannel::new(&test_device(port), payload_tx);
        channel.connect().await;

        let first = timeout(Duration::from_secs(5), payload_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.get("status").and_then(Value::as_str), Some("playing"));

        let second = timeout(Duration::from_secs(5), payload_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.get("status").and_then(Value::as_str), Some("idle"));

        channel.disconnect().await;
        server.await.unwrap();
    }
}
