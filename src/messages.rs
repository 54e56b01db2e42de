use crate::error::{ConnectorError, Result};
use crate::types::{dedup, ChannelDescription, ChannelState, ConnectionState, DeviceId, Generation};

/// Canonical message produced by discovery and the protocol clients
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A device was found or (re)described by discovery
    StoreLocalDevice(StoreLocalDevice),
    /// Channel descriptions for an already known device
    StoreChannels(StoreChannels),
    /// Property readings for one device
    ChannelStates(DeviceStatus),
    /// Connection state change of a device
    DeviceState(DeviceStateMessage),
    /// Device level attribute update
    DeviceAttribute(DeviceAttributeMessage),
}

impl Message {
    /// Identifier of the device the message concerns
    pub fn device(&self) -> &str {
        match self {
            Self::StoreLocalDevice(m) => &m.identifier,
            Self::StoreChannels(m) => &m.device,
            Self::ChannelStates(m) => &m.device,
            Self::DeviceState(m) => &m.device,
            Self::DeviceAttribute(m) => &m.device,
        }
    }
}

/// Fully resolved device description
#[derive(Debug, Clone, PartialEq)]
pub struct StoreLocalDevice {
    pub identifier: DeviceId,
    pub generation: Generation,
    pub ip_address: Option<String>,
    pub domain: Option<String>,
    pub model: String,
    pub mac_address: Option<String>,
    pub auth_enabled: bool,
    pub firmware_version: Option<String>,
    pub channels: Vec<ChannelDescription>,
}

impl StoreLocalDevice {
    /// Validate the record and collapse structurally equal channels
    pub fn validated(mut self) -> Result<Self> {
        if self.identifier.trim().is_empty() {
            return Err(ConnectorError::InvalidPayload(
                "device identifier is empty".to_string(),
            ));
        }
        if self.ip_address.is_none() && self.domain.is_none() {
            return Err(ConnectorError::InvalidPayload(format!(
                "device {} has neither address nor domain",
                self.identifier
            )));
        }
        self.channels = dedup(self.channels);
        Ok(self)
    }
}

/// Channel descriptions reported by a live session
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChannels {
    pub device: DeviceId,
    pub channels: Vec<ChannelDescription>,
}

impl StoreChannels {
    pub fn new(device: impl Into<DeviceId>, channels: Vec<ChannelDescription>) -> Self {
        Self {
            device: device.into(),
            channels: dedup(channels),
        }
    }
}

/// Readings for several channels of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub device: DeviceId,
    pub channels: Vec<ChannelState>,
}

impl DeviceStatus {
    pub fn new(device: impl Into<DeviceId>, channels: Vec<ChannelState>) -> Self {
        Self {
            device: device.into(),
            channels: dedup(channels),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateMessage {
    pub device: DeviceId,
    pub state: ConnectionState,
}

/// Device attributes a client can learn at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    IpAddress,
    MacAddress,
    Firmware,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAttributeMessage {
    pub device: DeviceId,
    pub attribute: DeviceAttribute,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, PropertyDescription};

    fn device() -> StoreLocalDevice {
        StoreLocalDevice {
            identifier: "c45bbee4c926-shellyrgbw2".into(),
            generation: Generation::Gen1,
            ip_address: Some("10.10.0.239".into()),
            domain: None,
            model: "SHRGBW2".into(),
            mac_address: None,
            auth_enabled: false,
            firmware_version: None,
            channels: Vec::new(),
        }
    }

    #[test]
    fn test_validated_dedups_channels() {
        let channel = ChannelDescription::new(
            "0_light_0",
            None,
            vec![PropertyDescription::new("1101_s_output", DataType::Boolean)],
        );
        let mut message = device();
        message.channels = vec![channel.clone(), channel];
        let message = message.validated().unwrap();
        assert_eq!(message.channels.len(), 1);
    }

    #[test]
    fn test_validated_requires_address() {
        let mut message = device();
        message.ip_address = None;
        assert!(message.validated().is_err());

        let mut message = device();
        message.identifier = " ".into();
        assert!(message.validated().is_err());
    }
}
