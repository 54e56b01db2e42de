//! Collaborator interfaces for device configuration and property state.
//!
//! The connector does not own persistence: it reads and upserts device
//! records through [`DeviceRepository`] and keeps property readings and write
//! intents in a [`PropertyStore`]. In-memory implementations are provided for
//! standalone use and tests.

use crate::error::{ConnectorError, Result};
use crate::messages::DeviceAttribute;
use crate::types::{
    ChannelDescription, Credentials, DeviceId, Generation, PropertyDescription, Value,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Identifier of the device level connection state property
pub const STATE_PROPERTY: &str = "state";

/// Configuration record of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub identifier: DeviceId,
    /// Missing generation is a configuration error for the client factory
    pub generation: Option<Generation>,
    pub ip_address: Option<String>,
    pub domain: Option<String>,
    pub model: Option<String>,
    pub mac_address: Option<String>,
    pub auth_enabled: bool,
    pub firmware_version: Option<String>,
    pub credentials: Option<Credentials>,
    /// Overrides the generation 1 polling interval
    pub state_reading_delay: Option<Duration>,
    /// Device level properties (connection state)
    pub properties: Vec<PropertyDescription>,
    pub channels: Vec<ChannelDescription>,
}

impl DeviceRecord {
    pub fn new(identifier: impl Into<DeviceId>, generation: Option<Generation>) -> Self {
        Self {
            identifier: identifier.into(),
            generation,
            ip_address: None,
            domain: None,
            model: None,
            mac_address: None,
            auth_enabled: false,
            firmware_version: None,
            credentials: None,
            state_reading_delay: None,
            properties: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Host used to reach the device, IP address preferred over domain
    pub fn address(&self) -> Result<&str> {
        self.ip_address
            .as_deref()
            .or(self.domain.as_deref())
            .ok_or_else(|| {
                ConnectorError::Configuration(format!(
                    "device {} has no IP address or domain",
                    self.identifier
                ))
            })
    }

    /// Protocol generation, required to pick a client
    pub fn generation(&self) -> Result<Generation> {
        self.generation.ok_or_else(|| {
            ConnectorError::Configuration(format!(
                "device {} has no generation configured",
                self.identifier
            ))
        })
    }

    pub fn channel(&self, identifier: &str) -> Option<&ChannelDescription> {
        self.channels.iter().find(|c| c.identifier == identifier)
    }

    pub fn property(&self, channel: Option<&str>, identifier: &str) -> Option<&PropertyDescription> {
        match channel {
            Some(channel) => self.channel(channel)?.property(identifier),
            None => self.properties.iter().find(|p| p.identifier == identifier),
        }
    }

    /// Every settable channel property as a store key
    pub fn settable_keys(&self) -> Vec<PropertyKey> {
        self.channels
            .iter()
            .flat_map(|channel| {
                channel
                    .properties
                    .iter()
                    .filter(|p| p.settable)
                    .map(move |p| PropertyKey::channel(&self.identifier, &channel.identifier, &p.identifier))
            })
            .collect()
    }
}

/// Result of an idempotent upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Upserted {
    pub device_created: bool,
    pub channels_created: usize,
    pub properties_created: usize,
}

/// Device/channel/property configuration repository
pub trait DeviceRepository: Send + Sync {
    fn device(&self, identifier: &str) -> Option<DeviceRecord>;

    fn devices(&self) -> Vec<DeviceRecord>;

    /// Create the device if unseen and any unseen channels or properties;
    /// existing entries are left untouched
    fn upsert_device(&self, record: DeviceRecord) -> Upserted;

    /// Create unseen channels or channel properties of a known device
    fn upsert_channels(&self, device: &str, channels: &[ChannelDescription]) -> Result<Upserted>;

    /// Create a device level property if unseen
    fn upsert_device_property(&self, device: &str, property: PropertyDescription) -> Result<bool>;

    fn set_attribute(&self, device: &str, attribute: DeviceAttribute, value: &str) -> Result<()>;
}

/// In-memory [`DeviceRepository`]
#[derive(Default)]
pub struct MemoryDeviceRepository {
    devices: Mutex<HashMap<DeviceId, DeviceRecord>>,
}

impl MemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_channels(record: &mut DeviceRecord, channels: &[ChannelDescription]) -> Upserted {
    let mut upserted = Upserted::default();
    for channel in channels {
        match record
            .channels
            .iter_mut()
            .find(|c| c.identifier == channel.identifier)
        {
            Some(existing) => {
                for property in &channel.properties {
                    if existing.property(&property.identifier).is_none() {
                        existing.properties.push(property.clone());
                        upserted.properties_created += 1;
                    }
                }
            }
            None => {
                record.channels.push(channel.clone());
                upserted.channels_created += 1;
                upserted.properties_created += channel.properties.len();
            }
        }
    }
    upserted
}

impl DeviceRepository for MemoryDeviceRepository {
    fn device(&self, identifier: &str) -> Option<DeviceRecord> {
        self.devices.lock().get(identifier).cloned()
    }

    fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<_> = self.devices.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        devices
    }

    fn upsert_device(&self, record: DeviceRecord) -> Upserted {
        let mut devices = self.devices.lock();
        match devices.get_mut(&record.identifier) {
            Some(existing) => merge_channels(existing, &record.channels),
            None => {
                let channels = record.channels.len();
                let properties = record.channels.iter().map(|c| c.properties.len()).sum();
                devices.insert(record.identifier.clone(), record);
                Upserted {
                    device_created: true,
                    channels_created: channels,
                    properties_created: properties,
                }
            }
        }
    }

    fn upsert_channels(&self, device: &str, channels: &[ChannelDescription]) -> Result<Upserted> {
        let mut devices = self.devices.lock();
        let record = devices
            .get_mut(device)
            .ok_or_else(|| ConnectorError::UnknownDevice(device.to_string()))?;
        Ok(merge_channels(record, channels))
    }

    fn upsert_device_property(&self, device: &str, property: PropertyDescription) -> Result<bool> {
        let mut devices = self.devices.lock();
        let record = devices
            .get_mut(device)
            .ok_or_else(|| ConnectorError::UnknownDevice(device.to_string()))?;
        if record.properties.iter().any(|p| p.identifier == property.identifier) {
            return Ok(false);
        }
        record.properties.push(property);
        Ok(true)
    }

    fn set_attribute(&self, device: &str, attribute: DeviceAttribute, value: &str) -> Result<()> {
        let mut devices = self.devices.lock();
        let record = devices
            .get_mut(device)
            .ok_or_else(|| ConnectorError::UnknownDevice(device.to_string()))?;
        let value = Some(value.to_string());
        match attribute {
            DeviceAttribute::IpAddress => record.ip_address = value,
            DeviceAttribute::MacAddress => record.mac_address = value,
            DeviceAttribute::Firmware => record.firmware_version = value,
            DeviceAttribute::Model => record.model = value,
        }
        Ok(())
    }
}

/// Address of a property in the state store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey {
    pub device: DeviceId,
    /// `None` for device level properties
    pub channel: Option<String>,
    pub property: String,
}

impl PropertyKey {
    pub fn channel(device: &str, channel: &str, property: &str) -> Self {
        Self {
            device: device.to_string(),
            channel: Some(channel.to_string()),
            property: property.to_string(),
        }
    }

    pub fn device(device: &str, property: &str) -> Self {
        Self {
            device: device.to_string(),
            channel: None,
            property: property.to_string(),
        }
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.channel {
            Some(channel) => write!(f, "{}/{}/{}", self.device, channel, self.property),
            None => write!(f, "{}/{}", self.device, self.property),
        }
    }
}

/// Progress of a write intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Desired value set, nothing sent yet
    Requested,
    /// Write accepted by the device at the given instant, awaiting confirmation
    Sent(Instant),
}

/// Stored state of one property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyStateRecord {
    pub actual_value: Option<Value>,
    pub expected_value: Option<Value>,
    pub pending: Option<Pending>,
    pub valid: bool,
}

impl Default for PropertyStateRecord {
    fn default() -> Self {
        Self {
            actual_value: None,
            expected_value: None,
            pending: None,
            valid: false,
        }
    }
}

impl PropertyStateRecord {
    /// Has a desired value that still needs to reach the device
    pub fn has_write_intent(&self) -> bool {
        self.expected_value.as_ref().is_some_and(|v| !v.is_null()) && self.pending.is_some()
    }
}

/// Change notification emitted by a [`PropertyStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created(PropertyKey),
    Updated(PropertyKey),
}

impl StoreEvent {
    pub fn key(&self) -> &PropertyKey {
        match self {
            Self::Created(key) | Self::Updated(key) => key,
        }
    }
}

/// Property state store
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &PropertyKey) -> Option<PropertyStateRecord>;

    fn set_value(&self, key: &PropertyKey, value: Value);

    fn set_valid(&self, key: &PropertyKey, valid: bool);

    /// Set or clear the write intent
    fn set_expected(&self, key: &PropertyKey, value: Option<Value>, pending: Option<Pending>);

    /// Set only the pending marker, keeping the expected value
    fn set_pending(&self, key: &PropertyKey, pending: Option<Pending>);

    /// Receive change notifications
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// In-memory [`PropertyStore`]
pub struct MemoryPropertyStore {
    records: Mutex<HashMap<PropertyKey, PropertyStateRecord>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryPropertyStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            records: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, key: &PropertyKey, apply: impl FnOnce(&mut PropertyStateRecord)) {
        let event = {
            let mut records = self.records.lock();
            match records.get_mut(key) {
                Some(record) => {
                    let before = record.clone();
                    apply(record);
                    if *record == before {
                        return;
                    }
                    StoreEvent::Updated(key.clone())
                }
                None => {
                    let mut record = PropertyStateRecord::default();
                    apply(&mut record);
                    records.insert(key.clone(), record);
                    StoreEvent::Created(key.clone())
                }
            }
        };
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, key: &PropertyKey) -> Option<PropertyStateRecord> {
        self.records.lock().get(key).cloned()
    }

    fn set_value(&self, key: &PropertyKey, value: Value) {
        self.update(key, |record| record.actual_value = Some(value));
    }

    fn set_valid(&self, key: &PropertyKey, valid: bool) {
        self.update(key, |record| record.valid = valid);
    }

    fn set_expected(&self, key: &PropertyKey, value: Option<Value>, pending: Option<Pending>) {
        self.update(key, |record| {
            record.expected_value = value;
            record.pending = pending;
        });
    }

    fn set_pending(&self, key: &PropertyKey, pending: Option<Pending>) {
        self.update(key, |record| record.pending = pending);
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
