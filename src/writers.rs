//! Write-back of desired property values.
//!
//! A write intent is an expected value plus a pending marker in the property
//! store. Writers find intents, send them through the protocol client of the
//! device's generation and record the outcome: success marks the intent
//! `Sent`, failure abandons it. The device confirms by reporting the value,
//! which clears the intent in the consumer.

use crate::client::ClientRegistry;
use crate::config::{WriterConfig, WriterMode};
use crate::error::{ConnectorError, Result};
use crate::store::{DeviceRepository, Pending, PropertyKey, PropertyStore, StoreEvent};
use crate::types::Value;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

/// Sends write intents and keeps the shared bookkeeping
pub struct WriteDispatcher {
    repository: Arc<dyn DeviceRepository>,
    store: Arc<dyn PropertyStore>,
    clients: ClientRegistry,
    /// Properties with an attempt that has not resolved yet
    in_flight: Mutex<HashSet<PropertyKey>>,
}

impl WriteDispatcher {
    pub fn new(
        repository: Arc<dyn DeviceRepository>,
        store: Arc<dyn PropertyStore>,
        clients: ClientRegistry,
    ) -> Self {
        Self {
            repository,
            store,
            clients,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Mark a property in flight; false if an attempt is already running
    pub fn claim(&self, key: &PropertyKey) -> bool {
        self.in_flight.lock().insert(key.clone())
    }

    pub fn is_in_flight(&self, key: &PropertyKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    fn release(&self, key: &PropertyKey) {
        self.in_flight.lock().remove(key);
    }

    /// Whether the store holds an intent for a settable property of a known device
    fn is_writable(&self, key: &PropertyKey) -> bool {
        let Some(channel) = key.channel.as_deref() else {
            return false;
        };
        self.repository
            .device(&key.device)
            .and_then(|device| device.property(Some(channel), &key.property).map(|p| p.settable))
            .unwrap_or(false)
    }

    /// Send the intent of a claimed property and record the outcome
    ///
    /// Releases the claim when done. Returns `Ok(false)` when there was
    /// nothing to send.
    pub async fn dispatch(&self, key: &PropertyKey) -> Result<bool> {
        let result = self.send(key).await;
        self.release(key);
        result
    }

    async fn send(&self, key: &PropertyKey) -> Result<bool> {
        let Some(expected) = self
            .store
            .get(key)
            .filter(|record| record.has_write_intent())
            .and_then(|record| record.expected_value)
        else {
            return Ok(false);
        };

        let device = self
            .repository
            .device(&key.device)
            .ok_or_else(|| ConnectorError::UnknownDevice(key.device.clone()))?;
        let channel = key.channel.as_deref().ok_or_else(|| {
            ConnectorError::InvalidPayload(format!("{} is not a channel property", key))
        })?;

        let outcome = match self.clients.for_device(&device) {
            Ok(client) => {
                tracing::debug!("Writing {} to {}", expected, key);
                client
                    .write_property(&device, channel, &key.property, &expected)
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                // The device may have confirmed while the call was in flight
                let still_expected = self
                    .store
                    .get(key)
                    .is_some_and(|record| record.expected_value.as_ref() == Some(&expected));
                if !still_expected {
                    return Ok(true);
                }
                let confirmable = device
                    .property(Some(channel), &key.property)
                    .is_some_and(|property| property.queryable)
                    && !is_toggle(&expected);
                if confirmable {
                    self.store.set_pending(key, Some(Pending::Sent(Instant::now())));
                } else {
                    // No reading will ever match; the command is done once sent
                    tracing::debug!("Write of {} to {} complete", expected, key);
                    self.store.set_expected(key, None, None);
                }
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Write of {} to {} failed, abandoning it: {}", expected, key, e);
                self.store.set_expected(key, None, None);
                Err(e)
            }
        }
    }

    /// Claim and dispatch on a separate task
    fn spawn(self: &Arc<Self>, key: PropertyKey) -> bool {
        if !self.claim(&key) {
            return false;
        }
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(&key).await {
                tracing::debug!("Write attempt for {} ended with {}", key, e);
            }
        });
        true
    }
}

/// `toggle` flips a switch; the resulting reading never equals it
fn is_toggle(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.eq_ignore_ascii_case("toggle"))
}

/// Write-back strategy
pub trait Writer: Send + Sync {
    /// Start the background task
    fn start(&self);

    /// Stop the background task; running attempts finish on their own
    fn stop(&self);
}

/// Build the writer selected by the configuration
pub fn create_writer(config: &WriterConfig, dispatcher: Arc<WriteDispatcher>) -> Box<dyn Writer> {
    match config.mode {
        WriterMode::Periodic => Box::new(PeriodicWriter::new(config.clone(), dispatcher)),
        WriterMode::Event => Box::new(EventWriter::new(dispatcher)),
    }
}

/// Scans for write intents on a short tick
///
/// At most one write is started per tick. A property is skipped while an
/// attempt is in flight, and for the debounce window after a successful send.
pub struct PeriodicWriter {
    config: WriterConfig,
    dispatcher: Arc<WriteDispatcher>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWriter {
    pub fn new(config: WriterConfig, dispatcher: Arc<WriteDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            task: Mutex::new(None),
        }
    }

    /// First property with an intent that is due
    fn next_due(dispatcher: &WriteDispatcher, debounce: Duration) -> Option<PropertyKey> {
        dispatcher
            .repository
            .devices()
            .iter()
            .flat_map(|device| device.settable_keys())
            .find(|key| {
                if dispatcher.is_in_flight(key) {
                    return false;
                }
                let Some(record) = dispatcher.store.get(key) else {
                    return false;
                };
                if !record.has_write_intent() {
                    return false;
                }
                match record.pending {
                    Some(Pending::Sent(at)) => at.elapsed() >= debounce,
                    Some(Pending::Requested) => true,
                    None => false,
                }
            })
    }

    async fn run(config: WriterConfig, dispatcher: Arc<WriteDispatcher>) {
        sleep(config.startup_delay()).await;
        tracing::info!(
            "Periodic writer started, tick {:?}, debounce {:?}",
            config.tick(),
            config.debounce()
        );

        let mut ticker = interval(config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(key) = Self::next_due(&dispatcher, config.debounce()) {
                dispatcher.spawn(key);
            }
        }
    }
}

impl Writer for PeriodicWriter {
    fn start(&self) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(Self::run(
            self.config.clone(),
            self.dispatcher.clone(),
        )));
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("Periodic writer stopped");
        }
    }
}

/// Writes as soon as the store reports a new intent
pub struct EventWriter {
    dispatcher: Arc<WriteDispatcher>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventWriter {
    pub fn new(dispatcher: Arc<WriteDispatcher>) -> Self {
        Self {
            dispatcher,
            task: Mutex::new(None),
        }
    }

    fn on_event(dispatcher: &Arc<WriteDispatcher>, event: &StoreEvent) {
        let key = event.key();
        let requested = dispatcher
            .store
            .get(key)
            .is_some_and(|record| record.has_write_intent() && record.pending == Some(Pending::Requested));
        if requested && dispatcher.is_writable(key) {
            dispatcher.spawn(key.clone());
        }
    }

    async fn run(dispatcher: Arc<WriteDispatcher>, mut events: broadcast::Receiver<StoreEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => Self::on_event(&dispatcher, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event writer skipped {} store event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Writer for EventWriter {
    fn start(&self) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        // Subscribe here so intents set right after start are seen
        let events = self.dispatcher.store.subscribe();
        *task = Some(tokio::spawn(Self::run(self.dispatcher.clone(), events)));
        tracing::info!("Event writer started");
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("Event writer stopped");
        }
    }
}

impl Drop for PeriodicWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use crate::store::{DeviceRecord, MemoryDeviceRepository, MemoryPropertyStore};
    use crate::consumers::Consumer;
    use crate::messages::{DeviceStatus, Message};
    use crate::types::{
        ChannelDescription, ChannelState, DataType, Format, Generation, PropertyDescription,
        PropertyState,
    };

    const DEVICE: &str = "441793ad07e8-shellyplus2pm";

    struct Fixture {
        dispatcher: Arc<WriteDispatcher>,
        store: Arc<MemoryPropertyStore>,
        client: Arc<MockClient>,
        consumer: Consumer,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(MemoryDeviceRepository::new());
        let mut record = DeviceRecord::new(DEVICE, Some(Generation::Gen2));
        record.ip_address = Some("10.10.0.37".into());
        record.channels = vec![
            ChannelDescription::new(
                "switch_0",
                None,
                vec![
                    PropertyDescription::new("output", DataType::Boolean).settable(true),
                    PropertyDescription::new("active_power", DataType::Float),
                ],
            ),
            ChannelDescription::new(
                "cover_0",
                None,
                vec![PropertyDescription::new("command", DataType::Enum)
                    .with_format(Format::enumeration(&["open", "close", "stop"]))
                    .queryable(false)
                    .settable(true)],
            ),
        ];
        repository.upsert_device(record);

        let store = Arc::new(MemoryPropertyStore::new());
        let client = Arc::new(MockClient::new(Generation::Gen2));
        let clients = ClientRegistry::with_clients(Arc::new(MockClient::new(Generation::Gen1)), client.clone());
        let dispatcher = Arc::new(WriteDispatcher::new(repository.clone(), store.clone(), clients));
        Fixture {
            dispatcher,
            store: store.clone(),
            client,
            consumer: Consumer::new(repository, store.clone()),
        }
    }

    fn output() -> PropertyKey {
        PropertyKey::channel(DEVICE, "switch_0", "output")
    }

    fn config() -> WriterConfig {
        WriterConfig {
            mode: WriterMode::Periodic,
            tick_ms: 10,
            startup_delay_ms: 100,
            debounce_ms: 5_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_writer_debounces_unconfirmed_writes() {
        let f = fixture();
        let writer = PeriodicWriter::new(config(), f.dispatcher.clone());
        f.store
            .set_expected(&output(), Some(Value::Bool(true)), Some(Pending::Requested));
        writer.start();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        assert!(matches!(f.store.get(&output()).unwrap().pending, Some(Pending::Sent(_))));

        // Still inside the debounce window
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(f.client.writes.lock().len(), 1);

        // Never confirmed, so it is sent again once the window has passed
        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(f.client.writes.lock().len(), 2);

        // Device confirmed
        f.store.set_expected(&output(), None, None);
        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(f.client.writes.lock().len(), 2);

        let writes = f.client.writes.lock().clone();
        assert_eq!(
            writes[0],
            (DEVICE.to_string(), "switch_0".to_string(), "output".to_string(), Value::Bool(true))
        );
        writer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_writer_waits_for_startup_delay() {
        let f = fixture();
        let writer = PeriodicWriter::new(config(), f.dispatcher.clone());
        f.store
            .set_expected(&output(), Some(Value::Bool(false)), Some(Pending::Requested));
        writer.start();

        sleep(Duration::from_millis(50)).await;
        assert!(f.client.writes.lock().is_empty());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_abandons_intent() {
        let f = fixture();
        *f.client.fail_writes.lock() = true;
        let writer = PeriodicWriter::new(config(), f.dispatcher.clone());
        f.store
            .set_expected(&output(), Some(Value::Bool(true)), Some(Pending::Requested));
        writer.start();

        sleep(Duration::from_millis(6_000)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        let record = f.store.get(&output()).unwrap();
        assert_eq!(record.expected_value, None);
        assert_eq!(record.pending, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_writer_sends_requested_intents_once() {
        let f = fixture();
        let writer = EventWriter::new(f.dispatcher.clone());
        writer.start();

        f.store
            .set_expected(&output(), Some(Value::Bool(true)), Some(Pending::Requested));
        // Not settable, ignored
        f.store.set_expected(
            &PropertyKey::channel(DEVICE, "switch_0", "active_power"),
            Some(Value::Float(1.0)),
            Some(Pending::Requested),
        );
        sleep(Duration::from_millis(50)).await;

        assert_eq!(f.client.writes.lock().len(), 1);
        assert!(matches!(f.store.get(&output()).unwrap().pending, Some(Pending::Sent(_))));

        // The Sent update itself must not trigger another write
        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        writer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmable_command_is_sent_once() {
        let f = fixture();
        let command = PropertyKey::channel(DEVICE, "cover_0", "command");
        let writer = PeriodicWriter::new(config(), f.dispatcher.clone());
        f.store
            .set_expected(&command, Some(Value::from("open")), Some(Pending::Requested));
        writer.start();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        let record = f.store.get(&command).unwrap();
        assert_eq!(record.expected_value, None);
        assert_eq!(record.pending, None);

        sleep(Duration::from_millis(30_000)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        writer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_is_sent_once() {
        let f = fixture();
        let writer = PeriodicWriter::new(config(), f.dispatcher.clone());
        f.store
            .set_expected(&output(), Some(Value::from("toggle")), Some(Pending::Requested));
        writer.start();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        assert_eq!(f.store.get(&output()).unwrap().expected_value, None);

        // The flipped reading leaves nothing to resend
        f.consumer.consume(Message::ChannelStates(DeviceStatus::new(
            DEVICE,
            vec![ChannelState::new("switch_0", vec![PropertyState::new("output", Value::Bool(false))])],
        )));
        sleep(Duration::from_millis(30_000)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        writer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reading_confirms_equivalent_expected_value() {
        let f = fixture();
        let writer = PeriodicWriter::new(config(), f.dispatcher.clone());
        f.store
            .set_expected(&output(), Some(Value::Int(1)), Some(Pending::Requested));
        writer.start();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        assert!(matches!(f.store.get(&output()).unwrap().pending, Some(Pending::Sent(_))));

        f.consumer.consume(Message::ChannelStates(DeviceStatus::new(
            DEVICE,
            vec![ChannelState::new("switch_0", vec![PropertyState::new("output", Value::Bool(true))])],
        )));
        let record = f.store.get(&output()).unwrap();
        assert_eq!(record.expected_value, None);
        assert_eq!(record.pending, None);

        sleep(Duration::from_millis(30_000)).await;
        assert_eq!(f.client.writes.lock().len(), 1);
        writer.stop();
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let f = fixture();
        assert!(f.dispatcher.claim(&output()));
        assert!(!f.dispatcher.claim(&output()));
        assert!(f.dispatcher.is_in_flight(&output()));

        // Nothing stored, nothing sent; the claim is released
        assert!(!f.dispatcher.dispatch(&output()).await.unwrap());
        assert!(!f.dispatcher.is_in_flight(&output()));
    }
}
