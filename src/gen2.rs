//! Generation 2 protocol client.
//!
//! Each connected device gets a supervisor task that owns its RPC
//! [`Connection`]: it connects, authenticates, describes the device, then
//! forwards notifications until the socket closes and reconnects with
//! exponential backoff.

use crate::client::ProtocolClient;
use crate::components;
use crate::config::Gen2Config;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{ConnectorError, Result};
use crate::messages::{
    DeviceAttribute, DeviceAttributeMessage, DeviceStateMessage, DeviceStatus, Message,
    StoreChannels,
};
use crate::protocol::{Notification, WsResponse};
use crate::queue::QueueSender;
use crate::store::DeviceRecord;
use crate::types::{ConnectionState, Credentials, DeviceId, Generation, Value, format_mac};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Opening the WebSocket
    Connecting,
    /// Socket open, identifying and describing the device. A digest
    /// challenge, if the device sends one, is answered in this phase;
    /// devices without authentication pass through it as well.
    Authenticating,
    /// Described and forwarding notifications
    Connected,
    Closing,
}

struct Session {
    state: SessionState,
    connection: Option<Arc<Connection>>,
    task: Option<JoinHandle<()>>,
}

/// State shared between the client and its supervisor tasks
struct Shared {
    config: Gen2Config,
    source: String,
    queue: QueueSender,
    sessions: Mutex<HashMap<DeviceId, Session>>,
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    if current.is_zero() {
        INITIAL_BACKOFF.min(max)
    } else {
        (current * 2).min(max)
    }
}

impl Shared {
    fn set_state(&self, identifier: &str, state: SessionState) {
        if let Some(session) = self.sessions.lock().get_mut(identifier) {
            tracing::debug!("Gen2 session {}: {:?} -> {:?}", identifier, session.state, state);
            session.state = state;
        }
    }

    fn set_connection(&self, identifier: &str, connection: Option<Arc<Connection>>) {
        if let Some(session) = self.sessions.lock().get_mut(identifier) {
            session.connection = connection;
        }
    }

    fn emit_state(&self, identifier: &str, state: ConnectionState) {
        self.queue.append(Message::DeviceState(DeviceStateMessage {
            device: identifier.to_string(),
            state,
        }));
    }

    fn emit_attribute(&self, identifier: &str, attribute: DeviceAttribute, value: &str) {
        self.queue.append(Message::DeviceAttribute(DeviceAttributeMessage {
            device: identifier.to_string(),
            attribute,
            value: value.to_string(),
        }));
    }

    /// Identify and describe the device over a fresh connection
    async fn describe(&self, identifier: &str, connection: &Connection) -> Result<()> {
        let info = connection.call("Shelly.GetDeviceInfo", None).await?;
        if let Some(firmware) = info.get("ver").and_then(|v| v.as_str()) {
            self.emit_attribute(identifier, DeviceAttribute::Firmware, firmware);
        }
        if let Some(mac) = info.get("mac").and_then(|v| v.as_str()) {
            self.emit_attribute(identifier, DeviceAttribute::MacAddress, &format_mac(mac));
        }
        if let Some(model) = info.get("model").and_then(|v| v.as_str()) {
            self.emit_attribute(identifier, DeviceAttribute::Model, model);
        }

        let config = connection.call("Shelly.GetConfig", None).await?;
        let status = connection.call("Shelly.GetStatus", None).await?;

        let channels = components::describe(&config, Some(&status));
        tracing::info!("Gen2 device {} has {} channel(s)", identifier, channels.len());
        self.queue
            .append(Message::StoreChannels(StoreChannels::new(identifier, channels)));
        self.forward_states(identifier, components::status_states(&status));

        if let Some(address) = components::wifi_address(&status) {
            self.emit_attribute(identifier, DeviceAttribute::IpAddress, address);
        }
        Ok(())
    }

    fn forward_states(&self, identifier: &str, channels: Vec<crate::types::ChannelState>) {
        if !channels.is_empty() {
            self.queue
                .append(Message::ChannelStates(DeviceStatus::new(identifier, channels)));
        }
    }

    fn handle_notification(&self, identifier: &str, notification: &WsResponse) {
        let Some(params) = &notification.params else {
            return;
        };
        match notification.notification() {
            Some(Notification::Status) | Some(Notification::FullStatus) => {
                self.forward_states(identifier, components::status_states(params));
            }
            Some(Notification::Event) => {
                self.forward_states(identifier, components::event_states(params));
            }
            None => {}
        }
    }

    /// Forward notifications until the connection closes
    async fn pump(&self, identifier: &str, events: &mut broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Notification(notification)) => {
                    self.handle_notification(identifier, &notification)
                }
                Ok(ConnectionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Gen2 device {} skipped {} notification(s)", identifier, skipped);
                }
            }
        }
    }

    async fn run_session(
        self: Arc<Self>,
        identifier: DeviceId,
        url: String,
        credentials: Option<Credentials>,
    ) {
        let mut backoff = Duration::ZERO;

        loop {
            if !backoff.is_zero() {
                tracing::info!("Reconnecting to gen2 device {} in {:?}", identifier, backoff);
                sleep(backoff).await;
            }

            self.set_state(&identifier, SessionState::Connecting);
            let connection = match Connection::connect(
                &url,
                &self.source,
                credentials.clone(),
                self.config.call_timeout(),
            )
            .await
            {
                Ok(connection) => Arc::new(connection),
                Err(e) => {
                    tracing::warn!("Failed to connect gen2 device {}: {}", identifier, e);
                    self.set_state(&identifier, SessionState::Disconnected);
                    self.emit_state(&identifier, ConnectionState::Lost);
                    backoff = next_backoff(backoff, self.config.reconnect_max_backoff());
                    continue;
                }
            };

            // Subscribe before the first call so no notification is missed
            let mut events = connection.subscribe();

            // Handshake: digest challenge (if any) plus description
            self.set_state(&identifier, SessionState::Authenticating);
            if let Err(e) = self.describe(&identifier, &connection).await {
                tracing::warn!("Gen2 device {} handshake failed: {}", identifier, e);
                connection.close().await;
                self.set_state(&identifier, SessionState::Disconnected);
                self.emit_state(&identifier, ConnectionState::Lost);
                backoff = next_backoff(backoff, self.config.reconnect_max_backoff());
                continue;
            }

            backoff = Duration::ZERO;
            self.set_connection(&identifier, Some(connection.clone()));
            self.set_state(&identifier, SessionState::Connected);
            self.emit_state(&identifier, ConnectionState::Connected);
            tracing::info!("Gen2 device {} connected", identifier);

            self.pump(&identifier, &mut events).await;

            tracing::warn!("Gen2 device {} connection lost", identifier);
            self.set_connection(&identifier, None);
            self.set_state(&identifier, SessionState::Disconnected);
            self.emit_state(&identifier, ConnectionState::Lost);
            backoff = next_backoff(backoff, self.config.reconnect_max_backoff());
        }
    }
}

/// Client for generation 2 devices
pub struct Gen2Client {
    default_credentials: Option<Credentials>,
    shared: Arc<Shared>,
}

impl Gen2Client {
    pub fn new(config: Gen2Config, queue: QueueSender) -> Self {
        Self {
            default_credentials: None,
            shared: Arc::new(Shared {
                config,
                source: format!("shelly-connector-{}", Uuid::new_v4().simple()),
                queue,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Credentials used for devices without their own
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.default_credentials = credentials;
        self
    }

    /// Source id stamped on every frame
    pub fn source(&self) -> &str {
        &self.shared.source
    }

    /// Session state of a device, `Disconnected` when unknown
    pub fn session_state(&self, identifier: &str) -> SessionState {
        self.shared
            .sessions
            .lock()
            .get(identifier)
            .map_or(SessionState::Disconnected, |s| s.state)
    }

    fn connection(&self, identifier: &str) -> Option<Arc<Connection>> {
        self.shared
            .sessions
            .lock()
            .get(identifier)
            .and_then(|s| s.connection.clone())
    }

    async fn close_session(&self, identifier: &str, session: Session) {
        if let Some(task) = &session.task {
            task.abort();
        }
        if let Some(connection) = &session.connection {
            connection.close().await;
        }
        tracing::info!("Gen2 device {} disconnected", identifier);
        self.shared.emit_state(identifier, ConnectionState::Disconnected);
    }
}

#[async_trait]
impl ProtocolClient for Gen2Client {
    fn generation(&self) -> Generation {
        Generation::Gen2
    }

    async fn connect(&self, device: &DeviceRecord) -> Result<()> {
        let url = format!("ws://{}/rpc", device.address()?);
        let credentials = device
            .credentials
            .clone()
            .or_else(|| self.default_credentials.clone());
        if device.auth_enabled && credentials.is_none() {
            tracing::warn!(
                "Gen2 device {} requires authentication but has no credentials",
                device.identifier
            );
        }

        let previous = self.shared.sessions.lock().insert(
            device.identifier.clone(),
            Session {
                state: SessionState::Connecting,
                connection: None,
                task: None,
            },
        );
        if let Some(previous) = previous {
            if let Some(task) = &previous.task {
                task.abort();
            }
            if let Some(connection) = &previous.connection {
                connection.close().await;
            }
        }

        let task = tokio::spawn(
            self.shared
                .clone()
                .run_session(device.identifier.clone(), url, credentials),
        );
        if let Some(session) = self.shared.sessions.lock().get_mut(&device.identifier) {
            session.task = Some(task);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let sessions: Vec<(DeviceId, Session)> = {
            let mut sessions = self.shared.sessions.lock();
            for session in sessions.values_mut() {
                session.state = SessionState::Closing;
            }
            sessions.drain().collect()
        };
        for (identifier, session) in sessions {
            self.close_session(&identifier, session).await;
        }
        Ok(())
    }

    async fn write_property(
        &self,
        device: &DeviceRecord,
        channel: &str,
        property: &str,
        value: &Value,
    ) -> Result<()> {
        let (method, params) = components::write_call(channel, property, value)?;
        let connection = self
            .connection(&device.identifier)
            .ok_or(ConnectorError::ConnectionClosed)?;

        tracing::debug!("Writing {} to gen2 device {} via {}", value, device.identifier, method);
        connection.call(&method, Some(params)).await?;
        Ok(())
    }
}

impl Drop for Gen2Client {
    fn drop(&mut self) {
        for session in self.shared.sessions.lock().values() {
            if let Some(task) = &session.task {
                task.abort();
            }
        }
    }
}
