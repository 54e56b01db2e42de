use crate::error::{ConnectorError, Result};
use crate::protocol::{DigestChallenge, WsFrame, WsResponse, WsSession};
use crate::types::Credentials;
use futures_util::{SinkExt, StreamExt};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

/// Something the device sent that is not a call response
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `NotifyStatus`, `NotifyFullStatus` or `NotifyEvent`
    Notification(WsResponse),
    /// The socket closed; every outstanding call has been failed
    Closed,
}

/// WebSocket connection state
struct ConnectionState {
    /// Calls waiting for their response, by frame id
    pending_requests: HashMap<u64, oneshot::Sender<Result<WsResponse>>>,
    /// Channel for sending outgoing messages
    ws_tx: mpsc::UnboundedSender<Message>,
    /// Digest state once the device challenged us
    session: Option<WsSession>,
    closing: bool,
}

impl ConnectionState {
    /// Fail every outstanding call with `Closing`
    fn reject_pending(&mut self) {
        self.closing = true;
        for (id, tx) in self.pending_requests.drain() {
            tracing::debug!("Rejecting call {} on close", id);
            let _ = tx.send(Err(ConnectorError::Closing));
        }
    }
}

/// JSON-RPC session with one generation 2 device
///
/// Calls are correlated to responses by a per-connection monotonic id.
/// Unsolicited frames are broadcast as [`ConnectionEvent`]s.
pub struct Connection {
    state: Arc<Mutex<ConnectionState>>,
    /// Broadcast channel for notifications (outside mutex to allow non-blocking subscribe)
    event_tx: broadcast::Sender<ConnectionEvent>,
    next_id: AtomicU64,
    source: String,
    credentials: Option<Credentials>,
    call_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Connect to a WebSocket URL, e.g. `ws://192.168.1.40/rpc`
    pub async fn connect(
        url: impl Into<String>,
        source: impl Into<String>,
        credentials: Option<Credentials>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let url = url.into();
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = timeout(call_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                tracing::warn!("Connecting to {} timed out after {:?}", url, call_timeout);
                ConnectorError::Timeout
            })??;
        let (mut write, mut read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, _) = broadcast::channel(100);

        let state = Arc::new(Mutex::new(ConnectionState {
            pending_requests: HashMap::new(),
            ws_tx,
            session: None,
            closing: false,
        }));

        // Spawn task to forward outgoing messages to WebSocket
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Spawn task to receive and process incoming messages
        let state_clone = state.clone();
        let event_tx_clone = event_tx.clone();
        let url_clone = url.clone();
        let read_handle = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        Self::handle_message(&state_clone, &event_tx_clone, &text).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket connection to {} closed", url_clone);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error on {}: {}", url_clone, e);
                        break;
                    }
                    _ => {}
                }
            }

            // Connection closed, fail all pending requests
            state_clone.lock().await.reject_pending();
            let _ = event_tx_clone.send(ConnectionEvent::Closed);
        });

        Ok(Self {
            state,
            event_tx,
            next_id: AtomicU64::new(1),
            source: source.into(),
            credentials,
            call_timeout,
            tasks: vec![write_handle, read_handle],
        })
    }

    /// Handle an incoming text frame
    async fn handle_message(
        state: &Arc<Mutex<ConnectionState>>,
        event_tx: &broadcast::Sender<ConnectionEvent>,
        text: &str,
    ) {
        tracing::debug!("Received: {}", text);

        let raw: serde_json::Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        let response: WsResponse = match serde_json::from_value(raw.clone()) {
            Ok(response) => response,
            Err(e) => {
                // Fail the call the frame was meant for, if we can tell
                if let Some(id) = raw.get("id").and_then(|v| v.as_u64()) {
                    if let Some(tx) = state.lock().await.pending_requests.remove(&id) {
                        let _ = tx.send(Err(ConnectorError::Protocol(format!(
                            "malformed response to call {}: {}",
                            id, e
                        ))));
                        return;
                    }
                }
                tracing::warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match response.id {
            Some(id) => {
                let tx = state.lock().await.pending_requests.remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => tracing::debug!("Response for unknown or expired call {}", id),
                }
            }
            None if response.notification().is_some() => {
                let _ = event_tx.send(ConnectionEvent::Notification(response));
            }
            None => tracing::debug!("Ignoring frame without id: {:?}", response.method),
        }
    }

    /// Call a method, answering a digest challenge once if the device sends one
    pub async fn call(
        &self,
        method: &str,
        params: Option<Map<String, serde_json::Value>>,
    ) -> Result<serde_json::Value> {
        let response = self.send_request(method, params.clone()).await?;
        if !response.is_unauthorized() {
            return response.into_result();
        }

        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ConnectorError::AuthRejected("device requires credentials, none configured".to_string())
        })?;
        let error = response
            .error
            .as_ref()
            .ok_or_else(|| ConnectorError::Protocol("401 without error object".to_string()))?;
        let challenge = DigestChallenge::from_error(error)?;
        let session = WsSession::authenticate(&challenge, credentials, Self::cnonce())?;
        tracing::debug!("Answering digest challenge for realm {}", session.realm);
        self.state.lock().await.session = Some(session);

        let response = self.send_request(method, params).await?;
        if response.is_unauthorized() {
            return Err(ConnectorError::AuthRejected(format!(
                "credentials for {} were refused",
                challenge.realm
            )));
        }
        response.into_result()
    }

    /// Send a frame and wait for the response with the same id
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Map<String, serde_json::Value>>,
    ) -> Result<WsResponse> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Register the pending request
        {
            let mut state = self.state.lock().await;
            if state.closing {
                return Err(ConnectorError::Closing);
            }
            if state.pending_requests.contains_key(&request_id) {
                return Err(ConnectorError::Protocol(format!(
                    "call id {} already in flight",
                    request_id
                )));
            }

            let mut frame = WsFrame::new(request_id, &self.source, method);
            if let Some(params) = params {
                frame = frame.with_params(params);
            }
            if let Some(session) = &state.session {
                frame = frame.with_auth(session.auth());
            }

            let json = serde_json::to_string(&frame)?;
            tracing::debug!("Sending: {}", json);

            state.pending_requests.insert(request_id, tx);
            if state.ws_tx.send(Message::Text(json)).is_err() {
                state.pending_requests.remove(&request_id);
                return Err(ConnectorError::ConnectionClosed);
            }
        }

        // Wait for response with timeout
        match timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectorError::Closing),
            Err(_) => {
                // Timeout - remove from pending requests
                let mut state = self.state.lock().await;
                state.pending_requests.remove(&request_id);
                tracing::warn!("Call {} ({}) timed out", request_id, method);
                Err(ConnectorError::Timeout)
            }
        }
    }

    /// Subscribe to notifications and the close event
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Current digest state, if the device challenged this connection
    pub async fn session(&self) -> Option<WsSession> {
        self.state.lock().await.session.clone()
    }

    /// Number of calls waiting for a response
    pub async fn pending_calls(&self) -> usize {
        self.state.lock().await.pending_requests.len()
    }

    /// Reject outstanding calls and send a close frame
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closing {
            return;
        }
        state.reject_pending();
        let _ = state.ws_tx.send(Message::Close(None));
    }

    fn cnonce() -> u64 {
        Uuid::new_v4().as_u128() as u64
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
