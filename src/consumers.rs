use crate::error::{ConnectorError, Result};
use crate::messages::{
    DeviceAttributeMessage, DeviceStateMessage, DeviceStatus, Message, StoreChannels,
    StoreLocalDevice,
};
use crate::store::{DeviceRecord, DeviceRepository, PropertyKey, PropertyStore, STATE_PROPERTY};
use crate::types::{ConnectionState, DataType, Format, PropertyDescription, Value};
use std::sync::Arc;

/// Outcome of applying one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A device record was created; the caller should connect it
    DeviceCreated(String),
    /// The message was applied (possibly as a no-op)
    Updated,
    /// The message could not be applied and was discarded
    Dropped,
}

/// Applies canonical messages to the repository and the property store
///
/// Every message variant has exactly one handler. Handlers never perform
/// protocol I/O; failures are logged and the message is dropped, since
/// discovery and state reports repeat.
pub struct Consumer {
    repository: Arc<dyn DeviceRepository>,
    store: Arc<dyn PropertyStore>,
}

impl Consumer {
    pub fn new(repository: Arc<dyn DeviceRepository>, store: Arc<dyn PropertyStore>) -> Self {
        Self { repository, store }
    }

    /// Apply one message
    pub fn consume(&self, message: Message) -> Applied {
        let device = message.device().to_string();
        let result = match message {
            Message::StoreLocalDevice(m) => self.store_local_device(m),
            Message::StoreChannels(m) => self.store_channels(m),
            Message::ChannelStates(m) => self.apply_channel_states(m),
            Message::DeviceState(m) => self.apply_device_state(m),
            Message::DeviceAttribute(m) => self.apply_device_attribute(m),
        };

        match result {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!("Dropping message for device {}: {}", device, e);
                Applied::Dropped
            }
        }
    }

    fn store_local_device(&self, message: StoreLocalDevice) -> Result<Applied> {
        let message = message.validated()?;
        let identifier = message.identifier.clone();

        let mut record = DeviceRecord::new(&message.identifier, Some(message.generation));
        record.ip_address = message.ip_address;
        record.domain = message.domain;
        record.model = Some(message.model);
        record.mac_address = message.mac_address;
        record.auth_enabled = message.auth_enabled;
        record.firmware_version = message.firmware_version;
        record.channels = message.channels;

        let upserted = self.repository.upsert_device(record);
        tracing::debug!(
            "Stored device {}: created={}, channels+{}, properties+{}",
            identifier,
            upserted.device_created,
            upserted.channels_created,
            upserted.properties_created
        );

        if upserted.device_created {
            self.on_device_created(&identifier)?;
            tracing::info!("Created device {}", identifier);
            return Ok(Applied::DeviceCreated(identifier));
        }
        Ok(Applied::Updated)
    }

    /// Post-creation hook: every device carries a connection state property
    fn on_device_created(&self, device: &str) -> Result<()> {
        let state = PropertyDescription::new(STATE_PROPERTY, DataType::Enum)
            .with_name("Connection state")
            .with_format(Format::Enumeration(
                ConnectionState::ALL.iter().map(|s| s.as_str().to_string()).collect(),
            ));
        self.repository.upsert_device_property(device, state)?;

        let key = PropertyKey::device(device, STATE_PROPERTY);
        if self.store.get(&key).is_none() {
            self.store
                .set_value(&key, Value::from(ConnectionState::Unknown.as_str()));
            self.store.set_valid(&key, true);
        }
        Ok(())
    }

    fn store_channels(&self, message: StoreChannels) -> Result<Applied> {
        let upserted = self
            .repository
            .upsert_channels(&message.device, &message.channels)?;
        if upserted.channels_created > 0 || upserted.properties_created > 0 {
            tracing::info!(
                "Device {} gained {} channel(s), {} propert(ies)",
                message.device,
                upserted.channels_created,
                upserted.properties_created
            );
        }
        Ok(Applied::Updated)
    }

    fn apply_channel_states(&self, message: DeviceStatus) -> Result<Applied> {
        let device = self
            .repository
            .device(&message.device)
            .ok_or_else(|| ConnectorError::UnknownDevice(message.device.clone()))?;

        for channel in &message.channels {
            for state in &channel.properties {
                let Some(property) = device.property(Some(&channel.identifier), &state.identifier)
                else {
                    tracing::debug!(
                        "Device {} has no property {}/{}",
                        device.identifier,
                        channel.identifier,
                        state.identifier
                    );
                    continue;
                };
                let key = PropertyKey::channel(&device.identifier, &channel.identifier, &state.identifier);
                self.apply_reading(&key, property, &state.value, state.valid);
            }
        }
        Ok(Applied::Updated)
    }

    /// Last write wins; invalid readings never overwrite the stored value
    fn apply_reading(&self, key: &PropertyKey, property: &PropertyDescription, value: &Value, valid: bool) {
        if !valid || property.is_invalid_reading(value) {
            tracing::debug!("Invalid reading for {}, keeping last value", key);
            self.store.set_valid(key, false);
            return;
        }

        let Some(value) = property.normalize(value) else {
            tracing::warn!("Reading {} does not fit property {}", value, key);
            self.store.set_valid(key, false);
            return;
        };

        self.store.set_value(key, value.clone());
        self.store.set_valid(key, true);

        // Device confirmed the desired value; expected values are compared
        // in the same normalized form as readings
        if let Some(record) = self.store.get(key) {
            let expected = record.expected_value.as_ref().and_then(|v| property.normalize(v));
            if expected.as_ref() == Some(&value) {
                tracing::debug!("Write of {} confirmed for {}", value, key);
                self.store.set_expected(key, None, None);
            }
        }
    }

    fn apply_device_state(&self, message: DeviceStateMessage) -> Result<Applied> {
        if self.repository.device(&message.device).is_none() {
            return Err(ConnectorError::UnknownDevice(message.device));
        }
        let key = PropertyKey::device(&message.device, STATE_PROPERTY);
        self.store.set_value(&key, Value::from(message.state.as_str()));
        self.store.set_valid(&key, true);
        Ok(Applied::Updated)
    }

    fn apply_device_attribute(&self, message: DeviceAttributeMessage) -> Result<Applied> {
        self.repository
            .set_attribute(&message.device, message.attribute, &message.value)?;
        Ok(Applied::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeviceAttribute;
    use crate::store::{MemoryDeviceRepository, MemoryPropertyStore, Pending};
    use crate::types::{ChannelDescription, ChannelState, Generation, PropertyState};

    fn fixture() -> (Consumer, Arc<MemoryDeviceRepository>, Arc<MemoryPropertyStore>) {
        let repository = Arc::new(MemoryDeviceRepository::new());
        let store = Arc::new(MemoryPropertyStore::new());
        let consumer = Consumer::new(repository.clone(), store.clone());

        let applied = consumer.consume(Message::StoreLocalDevice(StoreLocalDevice {
            identifier: "441793ad07e8-shellyplus2pm".into(),
            generation: Generation::Gen2,
            ip_address: Some("10.10.0.37".into()),
            domain: None,
            model: "SNSW-102P16EU".into(),
            mac_address: Some("44:17:93:ad:07:e8".into()),
            auth_enabled: false,
            firmware_version: None,
            channels: vec![ChannelDescription::new(
                "switch_0",
                None,
                vec![
                    PropertyDescription::new("output", DataType::Boolean).settable(true),
                    PropertyDescription::new("active_power", DataType::Float).with_unit("W"),
                ],
            )],
        }));
        assert_eq!(applied, Applied::DeviceCreated("441793ad07e8-shellyplus2pm".into()));

        (consumer, repository, store)
    }

    fn power(value: f64, valid: bool) -> Message {
        let state = if valid {
            PropertyState::new("active_power", Value::Float(value))
        } else {
            PropertyState::invalid("active_power", Value::Float(value))
        };
        Message::ChannelStates(DeviceStatus::new(
            "441793ad07e8-shellyplus2pm",
            vec![ChannelState::new("switch_0", vec![state])],
        ))
    }

    fn key(property: &str) -> PropertyKey {
        PropertyKey::channel("441793ad07e8-shellyplus2pm", "switch_0", property)
    }

    #[test]
    fn test_invalid_reading_keeps_value() {
        let (consumer, _, store) = fixture();

        consumer.consume(power(12.5, true));
        consumer.consume(power(0.0, false));

        let record = store.get(&key("active_power")).unwrap();
        assert_eq!(record.actual_value, Some(Value::Float(12.5)));
        assert!(!record.valid);

        consumer.consume(power(13.0, true));
        let record = store.get(&key("active_power")).unwrap();
        assert_eq!(record.actual_value, Some(Value::Float(13.0)));
        assert!(record.valid);
    }

    #[test]
    fn test_applying_twice_is_idempotent() {
        let (consumer, _, store) = fixture();

        consumer.consume(power(7.0, true));
        let once = store.get(&key("active_power")).unwrap();
        consumer.consume(power(7.0, true));
        let twice = store.get(&key("active_power")).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_repeated_store_local_device_is_noop() {
        let (consumer, repository, _) = fixture();
        let device = repository.device("441793ad07e8-shellyplus2pm").unwrap();
        assert_eq!(device.properties[0].identifier, STATE_PROPERTY);

        let applied = consumer.consume(Message::StoreLocalDevice(StoreLocalDevice {
            identifier: "441793ad07e8-shellyplus2pm".into(),
            generation: Generation::Gen2,
            ip_address: Some("10.10.0.99".into()),
            domain: None,
            model: "SNSW-102P16EU".into(),
            mac_address: None,
            auth_enabled: false,
            firmware_version: None,
            channels: Vec::new(),
        }));
        assert_eq!(applied, Applied::Updated);
        assert_eq!(repository.devices().len(), 1);
    }

    #[test]
    fn test_confirmation_clears_write_intent() {
        let (consumer, _, store) = fixture();
        let output = key("output");
        store.set_expected(&output, Some(Value::Bool(true)), Some(Pending::Requested));

        let message = Message::ChannelStates(DeviceStatus::new(
            "441793ad07e8-shellyplus2pm",
            vec![ChannelState::new("switch_0", vec![PropertyState::new("output", Value::Int(1))])],
        ));
        consumer.consume(message);

        let record = store.get(&output).unwrap();
        assert_eq!(record.actual_value, Some(Value::Bool(true)));
        assert_eq!(record.expected_value, None);
        assert_eq!(record.pending, None);
    }

    #[test]
    fn test_confirmation_compares_normalized_expected_value() {
        let (consumer, _, store) = fixture();
        let output = key("output");
        store.set_expected(&output, Some(Value::Int(1)), Some(Pending::Requested));

        consumer.consume(Message::ChannelStates(DeviceStatus::new(
            "441793ad07e8-shellyplus2pm",
            vec![ChannelState::new("switch_0", vec![PropertyState::new("output", Value::Bool(true))])],
        )));

        let record = store.get(&output).unwrap();
        assert_eq!(record.expected_value, None);
        assert_eq!(record.pending, None);
    }

    #[test]
    fn test_unfitting_reading_marks_invalid() {
        let (consumer, _, store) = fixture();
        consumer.consume(power(12.5, true));

        consumer.consume(Message::ChannelStates(DeviceStatus::new(
            "441793ad07e8-shellyplus2pm",
            vec![ChannelState::new(
                "switch_0",
                vec![PropertyState::new("active_power", Value::from("n/a"))],
            )],
        )));

        let record = store.get(&key("active_power")).unwrap();
        assert_eq!(record.actual_value, Some(Value::Float(12.5)));
        assert!(!record.valid);
    }

    #[test]
    fn test_unknown_device_is_dropped() {
        let (consumer, _, _) = fixture();
        let message = Message::ChannelStates(DeviceStatus::new("missing", Vec::new()));
        assert_eq!(consumer.consume(message), Applied::Dropped);
    }

    #[test]
    fn test_device_state_and_attribute() {
        let (consumer, repository, store) = fixture();
        let device = "441793ad07e8-shellyplus2pm";

        let state_key = PropertyKey::device(device, STATE_PROPERTY);
        assert_eq!(store.get(&state_key).unwrap().actual_value, Some(Value::from("unknown")));

        consumer.consume(Message::DeviceState(DeviceStateMessage {
            device: device.into(),
            state: ConnectionState::Connected,
        }));
        assert_eq!(store.get(&state_key).unwrap().actual_value, Some(Value::from("connected")));

        consumer.consume(Message::DeviceAttribute(DeviceAttributeMessage {
            device: device.into(),
            attribute: DeviceAttribute::Firmware,
            value: "1.0.8".into(),
        }));
        assert_eq!(
            repository.device(device).unwrap().firmware_version.as_deref(),
            Some("1.0.8")
        );
    }
}
