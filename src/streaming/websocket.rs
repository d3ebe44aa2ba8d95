// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! WebSocket transport for the event hub.
//!
//! `/ws` joins the broadcast set, `/ws/<device_id>` opens the device's
//! directed channel.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::hub::Connection;
use super::StreamingConfig;
use crate::core::Engine;
use crate::error::SendError;

/// Where a client asked to be attached
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Broadcast,
    Directed(String),
}

fn parse_route(path: &str) -> Option<Route> {
    let path = path.trim_end_matches('/');
    if path == "/ws" {
        return Some(Route::Broadcast);
    }
    let device_id = path.strip_prefix("/ws/")?;
    if device_id.is_empty() || device_id.contains('/') {
        return None;
    }
    Some(Route::Directed(device_id.to_string()))
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// How long a closing connection may spend flushing its queue
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Hub-facing handle; frames are queued to the connection's writer task.
///
/// The queue is bounded. A full queue fails the send, which makes the hub
/// drop the connection, and wakes the connection task so it closes the
/// socket.
struct WsConnection {
    id: String,
    tx: mpsc::Sender<Message>,
    evicted: Arc<Notify>,
}

impl WsConnection {
    fn new(tx: mpsc::Sender<Message>, evicted: Arc<Notify>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
            evicted,
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        match self.tx.try_send(Message::Text(text.to_string())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.evicted.notify_one();
                Err(SendError::Backlogged(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed(self.id.clone())),
        }
    }
}

/// Per-connection settings copied from the server
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    require_token: bool,
    send_queue: usize,
}

/// Holds one of the server's client slots until dropped
struct ClientSlot(Arc<AtomicUsize>);

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// WebSocket server
pub struct WebSocketServer {
    bind_address: String,
    port: u16,
    max_clients: usize,
    settings: ConnectionSettings,
    engine: Arc<Engine>,
    clients: Arc<AtomicUsize>,
}

impl WebSocketServer {
    pub fn new(config: &StreamingConfig, engine: Arc<Engine>) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.websocket_port,
            max_clients: config.websocket_max_clients,
            settings: ConnectionSettings {
                require_token: config.require_device_token,
                send_queue: config.send_queue_capacity.max(1),
            },
            engine,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Bind and serve in the background until `shutdown` fires.
    ///
    /// Returns the bound address, useful when the port is 0.
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!("WebSocket server listening on ws://{}", local_addr);

        let clients = self.clients.clone();
        let max_clients = self.max_clients;
        let settings = self.settings;
        let engine = self.engine.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                if clients.load(Ordering::SeqCst) >= max_clients {
                                    warn!("Max clients reached, rejecting connection from {}", addr);
                                    continue;
                                }
                                clients.fetch_add(1, Ordering::SeqCst);
                                let slot = ClientSlot(clients.clone());

                                tokio::spawn(handle_connection(
                                    stream,
                                    addr,
                                    engine.clone(),
                                    settings,
                                    shutdown.resubscribe(),
                                    slot,
                                ));
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("WebSocket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<Engine>,
    settings: ConnectionSettings,
    mut shutdown: broadcast::Receiver<()>,
    _slot: ClientSlot,
) {
    let mut target: Option<(Route, Option<String>)> = None;
    let callback = |request: &Request, response: Response| {
        let uri = request.uri();
        match parse_route(uri.path()) {
            Some(route) => {
                let token = uri.query().and_then(|q| query_param(q, "token"));
                target = Some((route, token));
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("unknown endpoint".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let Some((route, token)) = target else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(settings.send_queue);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Write to {} failed: {}", addr, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Route::Directed(device_id) = &route {
        let authorized = match token.as_deref() {
            Some(token) => engine.verify_token(device_id, token).await,
            None => false,
        };
        if settings.require_token && !authorized {
            warn!("Rejecting {} from {}: invalid device token", device_id, addr);
            let _ = tx.try_send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "invalid device token".into(),
            })));
            drop(tx);
            finish_writer(writer, addr).await;
            return;
        }
    }

    let evicted = Arc::new(Notify::new());
    let connection = Arc::new(WsConnection::new(tx.clone(), evicted.clone()));
    let connection_id = match &route {
        Route::Broadcast => engine.open_broadcast_connection(connection),
        Route::Directed(device_id) => engine.open_directed_connection(device_id, connection).await,
    };

    info!("WebSocket connection from {} on {:?} (id: {})", addr, route, connection_id);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) {
                            let pong = serde_json::json!({"type": "pong"});
                            let _ = tx.try_send(Message::Text(pong.to_string()));
                        } else {
                            debug!("Ignoring message from {}: {}", addr, text);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.try_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("WebSocket closed by client {}", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
            _ = evicted.notified() => {
                warn!("Dropping {}: outbound queue full", addr);
                break;
            }
            _ = shutdown.recv() => break,
        }
    }

    match &route {
        Route::Broadcast => {
            engine.close_broadcast_connection(&connection_id);
        }
        Route::Directed(device_id) => {
            engine.close_directed_connection(device_id, &connection_id);
        }
    }

    let _ = tx.try_send(Message::Close(None));
    drop(tx);
    finish_writer(writer, addr).await;

    info!("WebSocket client {} disconnected", addr);
}

/// Let the writer flush and close, abandoning a peer that stopped reading
async fn finish_writer(mut writer: JoinHandle<()>, addr: SocketAddr) {
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        debug!("Writer for {} stalled, aborting", addr);
        writer.abort();
    }
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::devices::{DeviceKind, DeviceStatus};
    use crate::streaming::testing::FakeConnection;
    use crate::streaming::EventHub;
    use tokio_tungstenite::connect_async;

    async fn serve(config: Config) -> (Arc<Engine>, SocketAddr, broadcast::Sender<()>) {
        let mut streaming = config.streaming.clone();
        streaming.bind_address = "127.0.0.1".into();
        streaming.websocket_port = 0;

        let engine = Arc::new(Engine::builder(config).in_memory().build().await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = WebSocketServer::new(&streaming, engine.clone());
        let addr = server.start(shutdown_rx).await.unwrap();
        (engine, addr, shutdown_tx)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    #[test]
    fn test_routes() {
        assert_eq!(parse_route("/ws"), Some(Route::Broadcast));
        assert_eq!(parse_route("/ws/"), Some(Route::Broadcast));
        assert_eq!(parse_route("/ws/bike-001"), Some(Route::Directed("bike-001".into())));
        assert_eq!(parse_route("/ws/a/b"), None);
        assert_eq!(parse_route("/metrics"), None);

        assert_eq!(query_param("a=1&token=abc", "token"), Some("abc".into()));
        assert_eq!(query_param("a=1", "token"), None);
    }

    #[tokio::test]
    async fn test_drunken_report_reaches_bike_and_observers() {
        let (engine, addr, _shutdown) = serve(Config::default()).await;

        let (mut observer, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        let (mut bike, _) = connect_async(format!("ws://{}/ws/bike-001", addr)).await.unwrap();
        wait_for(|| engine.hub().observer_count() == 1 && engine.hub().directed_count() == 1).await;

        engine
            .report_status("helmet-001", DeviceStatus::Drunken, "2024-01-01T00:00:00", Some(85))
            .await;

        assert_eq!(next_text(&mut bike).await, "304");

        let event: serde_json::Value = serde_json::from_str(&next_text(&mut observer).await).unwrap();
        assert_eq!(event["type"], "status_update");
        assert_eq!(event["data"]["device"], "helmet-001");
        assert_eq!(event["data"]["status"], "drunken");

        let bike_device = engine.registry().get("bike-001").await.unwrap();
        assert_eq!(bike_device.kind, DeviceKind::Bike);
    }

    #[tokio::test]
    async fn test_ping_and_disconnect() {
        let (engine, addr, _shutdown) = serve(Config::default()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        client
            .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut client).await, r#"{"type":"pong"}"#);

        client.close(None).await.unwrap();
        wait_for(|| engine.hub().observer_count() == 0).await;
    }

    #[tokio::test]
    async fn test_stalled_observer_is_dropped_by_hub() {
        let (tx, _never_read) = mpsc::channel(4);
        let evicted = Arc::new(Notify::new());
        let stalled = Arc::new(WsConnection::new(tx, evicted.clone()));
        let healthy = FakeConnection::new("healthy");

        let hub = EventHub::new();
        hub.accept_broadcast(stalled.clone());
        hub.accept_broadcast(healthy.clone());

        for n in 0..4 {
            let report = hub.broadcast("gps_update", serde_json::json!({ "n": n })).await;
            assert_eq!(report.delivered, 2);
        }

        let report = hub.broadcast("gps_update", serde_json::json!({ "n": 4 })).await;
        assert_eq!(report.dropped, vec![stalled.id().to_string()]);
        assert_eq!(hub.observer_count(), 1);
        assert_eq!(healthy.messages().len(), 5);

        // the connection task is told to close the socket
        tokio::time::timeout(Duration::from_secs(1), evicted.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_outbound_queue_is_bounded() {
        let (tx, _never_read) = mpsc::channel(16);
        let connection = WsConnection::new(tx, Arc::new(Notify::new()));
        let frame = "x".repeat(1024);

        let mut accepted = 0;
        for _ in 0..50_000 {
            match connection.send_text(&frame).await {
                Ok(()) => accepted += 1,
                Err(e) => assert!(matches!(e, SendError::Backlogged(_))),
            }
        }
        assert_eq!(accepted, 16);
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let (_engine, addr, _shutdown) = serve(Config::default()).await;
        assert!(connect_async(format!("ws://{}/nope", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_device_token_required() {
        let mut config = Config::default();
        config.streaming.require_device_token = true;
        let (engine, addr, _shutdown) = serve(config).await;
        engine.register_device("bike-001", DeviceKind::Bike, Some("s3cret")).await;

        let (mut rejected, _) = connect_async(format!("ws://{}/ws/bike-001?token=wrong", addr))
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rejected.next())
            .await
            .unwrap();
        assert!(matches!(msg, Some(Ok(Message::Close(_))) | None));
        assert_eq!(engine.hub().directed_count(), 0);

        let (_accepted, _) = connect_async(format!("ws://{}/ws/bike-001?token=s3cret", addr))
            .await
            .unwrap();
        wait_for(|| engine.hub().is_directed_connected("bike-001")).await;
    }
}
