//! Generation 1 protocol client.
//!
//! Readings arrive two ways: CoIoT multicast reports pushed by the devices,
//! and a per-device `GET /status` poll. Both are routed through the device's
//! known channel descriptions and forwarded to the queue as `ChannelStates`.
//! Writes go to the legacy HTTP action endpoints.

use crate::client::ProtocolClient;
use crate::coiot::{self, CitDescription, CoapReport};
use crate::config::Gen1Config;
use crate::error::{ConnectorError, Result};
use crate::http::HttpTransport;
use crate::messages::{
    DeviceAttribute, DeviceAttributeMessage, DeviceStateMessage, DeviceStatus, Message,
    StoreChannels,
};
use crate::queue::QueueSender;
use crate::store::DeviceRecord;
use crate::types::{
    ChannelDescription, ChannelState, ConnectionState, Credentials, DeviceId, Generation,
    PropertyDescription, PropertyState, Value,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// One `/status` array and the CIT blocks/sensors its fields map to
struct StatusSection {
    key: &'static str,
    /// Block name prefixes searched in order, suffixed with `_{index}`
    blocks: &'static [&'static str],
    /// `(status field, sensor description)`
    fields: &'static [(&'static str, &'static str)],
}

const STATUS_SECTIONS: &[StatusSection] = &[
    StatusSection {
        key: "relays",
        blocks: &["relay"],
        fields: &[("ison", "output")],
    },
    StatusSection {
        key: "rollers",
        blocks: &["roller"],
        fields: &[
            ("state", "roller"),
            ("current_pos", "rollerPos"),
            ("power", "rollerPower"),
        ],
    },
    StatusSection {
        key: "lights",
        blocks: &["light", "color", "white"],
        fields: &[
            ("ison", "output"),
            ("brightness", "brightness"),
            ("red", "red"),
            ("green", "green"),
            ("blue", "blue"),
            ("white", "white"),
            ("gain", "gain"),
        ],
    },
    StatusSection {
        key: "inputs",
        blocks: &["input", "relay", "roller", "light", "device"],
        fields: &[
            ("input", "input"),
            ("event", "inputEvent"),
            ("event_cnt", "inputEventCnt"),
        ],
    },
    StatusSection {
        key: "meters",
        blocks: &["meter", "relay", "light", "roller"],
        fields: &[("power", "power"), ("total", "energy")],
    },
    StatusSection {
        key: "emeters",
        blocks: &["emeter"],
        fields: &[
            ("power", "power"),
            ("reactive", "reactivePower"),
            ("voltage", "voltage"),
            ("current", "current"),
            ("pf", "powerFactor"),
            ("total", "energy"),
        ],
    },
];

fn find_property<'a>(
    channels: &'a [ChannelDescription],
    blocks: &[&str],
    index: usize,
    sensor: &str,
) -> Option<(&'a ChannelDescription, &'a PropertyDescription)> {
    blocks.iter().find_map(|block| {
        let name = format!("{}_{}", block, index);
        channels
            .iter()
            .filter(|c| c.name.as_deref() == Some(name.as_str()))
            .find_map(|c| {
                c.properties
                    .iter()
                    .find(|p| p.name.as_deref() == Some(sensor))
                    .map(|p| (c, p))
            })
    })
}

/// Map a `/status` document onto the device's channels
///
/// Sections that are absent mean the device has no channel of that kind.
/// `is_valid` flags on meter entries flow into the reading validity.
pub fn status_states(status: &serde_json::Value, channels: &[ChannelDescription]) -> Vec<ChannelState> {
    let mut readings: BTreeMap<String, Vec<PropertyState>> = BTreeMap::new();

    for section in STATUS_SECTIONS {
        let Some(items) = status.get(section.key).and_then(|v| v.as_array()) else {
            continue;
        };
        for (index, item) in items.iter().enumerate() {
            let valid = item.get("is_valid").and_then(|v| v.as_bool()).unwrap_or(true);
            for (field, sensor) in section.fields {
                let Some(raw) = item.get(*field) else {
                    continue;
                };
                let Some((channel, property)) = find_property(channels, section.blocks, index, sensor)
                else {
                    continue;
                };
                let value = Value::from_json(raw);
                let state = if valid && !property.is_invalid_reading(&value) {
                    PropertyState::new(&property.identifier, value)
                } else {
                    PropertyState::invalid(&property.identifier, value)
                };
                readings.entry(channel.identifier.clone()).or_default().push(state);
            }
        }
    }

    readings
        .into_iter()
        .map(|(channel, properties)| ChannelState::new(channel, properties))
        .collect()
}

/// CIT sensor id encoded at the front of a property identifier
fn sensor_id(property: &str) -> Option<u32> {
    property.split('_').next()?.parse().ok()
}

/// Hardware id part of a device identifier (`c45bbee4c926-shellyrgbw2`)
fn hardware_id(identifier: &str) -> &str {
    identifier.split('-').next().unwrap_or(identifier)
}

/// Routing data for one connected device
#[derive(Clone)]
struct Gen1Device {
    identifier: DeviceId,
    address: String,
    credentials: Option<Credentials>,
    channels: Vec<ChannelDescription>,
    /// Sensor id → every `(channel, property)` it is linked to
    routes: HashMap<u32, Vec<(String, PropertyDescription)>>,
    state: ConnectionState,
}

impl Gen1Device {
    fn new(record: &DeviceRecord, default_credentials: Option<&Credentials>) -> Result<Self> {
        let mut device = Self {
            identifier: record.identifier.clone(),
            address: record.address()?.to_string(),
            credentials: record.credentials.clone().or_else(|| default_credentials.cloned()),
            channels: Vec::new(),
            routes: HashMap::new(),
            state: ConnectionState::Init,
        };
        device.set_channels(record.channels.clone());
        Ok(device)
    }

    fn set_channels(&mut self, channels: Vec<ChannelDescription>) {
        let mut routes: HashMap<u32, Vec<(String, PropertyDescription)>> = HashMap::new();
        for channel in &channels {
            for property in &channel.properties {
                if let Some(sensor) = sensor_id(&property.identifier) {
                    routes
                        .entry(sensor)
                        .or_default()
                        .push((channel.identifier.clone(), property.clone()));
                }
            }
        }
        self.routes = routes;
        self.channels = channels;
    }
}

/// State shared between the client and its background tasks
struct Shared {
    transport: Arc<dyn HttpTransport>,
    queue: QueueSender,
    devices: Mutex<HashMap<DeviceId, Gen1Device>>,
}

impl Shared {
    fn device(&self, identifier: &str) -> Option<Gen1Device> {
        self.devices.lock().get(identifier).cloned()
    }

    /// Emit a `DeviceState` message on transitions only
    fn set_state(&self, identifier: &str, state: ConnectionState) {
        let changed = match self.devices.lock().get_mut(identifier) {
            Some(device) if device.state != state => {
                device.state = state;
                true
            }
            _ => false,
        };
        if changed {
            tracing::info!("Gen1 device {} is {}", identifier, state.as_str());
            self.queue.append(Message::DeviceState(DeviceStateMessage {
                device: identifier.to_string(),
                state,
            }));
        }
    }

    fn handle_datagram(&self, data: &[u8], sender: IpAddr) {
        match CoapReport::parse(data, sender) {
            Ok(report) => self.handle_report(&report),
            Err(e) => tracing::trace!("Ignoring datagram from {}: {}", sender, e),
        }
    }

    fn handle_report(&self, report: &CoapReport) {
        let sender = report.sender.to_string();
        let (device, moved) = {
            let mut devices = self.devices.lock();
            let Some(device) = devices.values_mut().find(|d| {
                hardware_id(&d.identifier).eq_ignore_ascii_case(&report.device_id)
            }) else {
                tracing::trace!(
                    "CoIoT report from unknown device {}#{} at {}",
                    report.device_type,
                    report.device_id,
                    sender
                );
                return;
            };
            let moved = device.address != sender;
            if moved {
                device.address = sender.clone();
            }
            (device.clone(), moved)
        };

        if moved {
            tracing::info!("Gen1 device {} now reports from {}", device.identifier, sender);
            self.queue.append(Message::DeviceAttribute(DeviceAttributeMessage {
                device: device.identifier.clone(),
                attribute: DeviceAttribute::IpAddress,
                value: sender,
            }));
        }

        let mut readings: BTreeMap<String, Vec<PropertyState>> = BTreeMap::new();
        for reading in &report.readings {
            let Some(targets) = device.routes.get(&reading.sensor) else {
                tracing::trace!("Device {} reported unknown sensor {}", device.identifier, reading.sensor);
                continue;
            };
            let value = Value::from_json(&reading.value);
            for (channel, property) in targets {
                let state = if property.is_invalid_reading(&value) {
                    PropertyState::invalid(&property.identifier, value.clone())
                } else {
                    PropertyState::new(&property.identifier, value.clone())
                };
                readings.entry(channel.clone()).or_default().push(state);
            }
        }

        if !readings.is_empty() {
            let channels = readings
                .into_iter()
                .map(|(channel, properties)| ChannelState::new(channel, properties))
                .collect();
            self.queue
                .append(Message::ChannelStates(DeviceStatus::new(&device.identifier, channels)));
        }
        self.set_state(&device.identifier, ConnectionState::Connected);
    }

    /// Fetch `/cit/d` for a device registered without channels
    async fn describe(&self, identifier: &str) -> Result<()> {
        let Some(device) = self.device(identifier) else {
            return Err(ConnectorError::UnknownDevice(identifier.to_string()));
        };
        let body = self
            .transport
            .get_json(&device.address, "/cit/d", &[], device.credentials.as_ref())
            .await?;
        let cit: CitDescription = serde_json::from_value(body)?;
        let channels = cit.channels();

        if let Some(device) = self.devices.lock().get_mut(identifier) {
            device.set_channels(channels.clone());
        }
        tracing::info!("Described gen1 device {} with {} channel(s)", identifier, channels.len());
        self.queue
            .append(Message::StoreChannels(StoreChannels::new(identifier, channels)));
        Ok(())
    }

    async fn poll_status(&self, identifier: &str) -> Result<()> {
        let Some(device) = self.device(identifier) else {
            return Err(ConnectorError::UnknownDevice(identifier.to_string()));
        };
        let status = self
            .transport
            .get_json(&device.address, "/status", &[], device.credentials.as_ref())
            .await?;

        let channels = status_states(&status, &device.channels);
        tracing::debug!(
            "Polled gen1 device {}: {} channel state(s)",
            identifier,
            channels.len()
        );
        if !channels.is_empty() {
            self.queue
                .append(Message::ChannelStates(DeviceStatus::new(identifier, channels)));
        }

        if let Some(ip) = status.pointer("/wifi_sta/ip").and_then(|v| v.as_str()) {
            self.queue.append(Message::DeviceAttribute(DeviceAttributeMessage {
                device: identifier.to_string(),
                attribute: DeviceAttribute::IpAddress,
                value: ip.to_string(),
            }));
        }
        Ok(())
    }

    async fn run_poller(self: Arc<Self>, identifier: DeviceId, delay: Duration) {
        let mut described = self
            .device(&identifier)
            .is_some_and(|d| !d.channels.is_empty());
        loop {
            if !described {
                match self.describe(&identifier).await {
                    Ok(()) => described = true,
                    Err(e) => tracing::warn!("Failed to describe gen1 device {}: {}", identifier, e),
                }
            }
            match self.poll_status(&identifier).await {
                Ok(()) => self.set_state(&identifier, ConnectionState::Connected),
                Err(ConnectorError::UnknownDevice(_)) => break,
                Err(e) => {
                    tracing::warn!("Status poll of gen1 device {} failed: {}", identifier, e);
                    self.set_state(&identifier, ConnectionState::Lost);
                }
            }
            sleep(delay).await;
        }
    }

    async fn run_listener(self: Arc<Self>, socket: tokio::net::UdpSocket) {
        let mut buf = vec![0u8; 4096];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from.ip()),
                Err(e) => {
                    tracing::warn!("CoIoT receive failed: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Outbound write request for a generation 1 device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gen1Write {
    pub path: String,
    pub query: Vec<(String, String)>,
}

fn switch_value(value: &Value) -> Result<String> {
    if let Value::String(s) = value {
        if s.eq_ignore_ascii_case("toggle") {
            return Ok("toggle".to_string());
        }
    }
    value
        .as_bool()
        .map(|on| if on { "on" } else { "off" }.to_string())
        .ok_or_else(|| ConnectorError::InvalidPayload(format!("{} is not a switch state", value)))
}

fn integer_value(value: &Value) -> Result<String> {
    value
        .as_f64()
        .map(|v| (v.round() as i64).to_string())
        .ok_or_else(|| ConnectorError::InvalidPayload(format!("{} is not a number", value)))
}

/// Build the action endpoint call for a property write
///
/// `block` is the CIT block name of the channel (`relay_0`, `light_2`, ...),
/// `sensor` the sensor description of the property.
pub fn write_request(block: &str, sensor: &str, value: &Value) -> Result<Gen1Write> {
    let (kind, index) = block
        .rsplit_once('_')
        .filter(|(_, index)| index.parse::<u32>().is_ok())
        .ok_or_else(|| ConnectorError::InvalidPayload(format!("block {} has no index", block)))?;

    let single = |path: String, key: &str, value: String| Gen1Write {
        path,
        query: vec![(key.to_string(), value)],
    };

    match (kind, sensor) {
        ("relay", "output") => Ok(single(format!("/relay/{}", index), "turn", switch_value(value)?)),
        ("light" | "color" | "white", "output") => {
            Ok(single(format!("/light/{}", index), "turn", switch_value(value)?))
        }
        ("light" | "white", "brightness") => Ok(single(
            format!("/light/{}", index),
            "brightness",
            integer_value(value)?,
        )),
        ("light" | "color", "red" | "green" | "blue" | "white" | "gain") => Ok(single(
            format!("/color/{}", index),
            sensor,
            integer_value(value)?,
        )),
        ("roller", "roller") => {
            let go = value.to_string().to_lowercase();
            if !matches!(go.as_str(), "open" | "close" | "stop") {
                return Err(ConnectorError::InvalidPayload(format!(
                    "{} is not a roller command",
                    value
                )));
            }
            Ok(single(format!("/roller/{}", index), "go", go))
        }
        ("roller", "rollerPos") => Ok(Gen1Write {
            path: format!("/roller/{}", index),
            query: vec![
                ("go".to_string(), "to_pos".to_string()),
                ("roller_pos".to_string(), integer_value(value)?),
            ],
        }),
        _ => Err(ConnectorError::InvalidPayload(format!(
            "sensor {} of block {} is not writable",
            sensor, block
        ))),
    }
}

/// Client for generation 1 devices
pub struct Gen1Client {
    config: Gen1Config,
    default_credentials: Option<Credentials>,
    shared: Arc<Shared>,
    pollers: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Gen1Client {
    pub fn new(config: Gen1Config, transport: Arc<dyn HttpTransport>, queue: QueueSender) -> Self {
        Self {
            config,
            default_credentials: None,
            shared: Arc::new(Shared {
                transport,
                queue,
                devices: Mutex::new(HashMap::new()),
            }),
            pollers: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Credentials used for devices without their own
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.default_credentials = credentials;
        self
    }

    /// Start the multicast listener unless it is already running
    ///
    /// Failure to join the group is logged; polling still covers the device.
    fn ensure_listener(&self) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        match coiot::bind_multicast(self.config.coiot_group, self.config.coiot_port) {
            Ok(socket) => {
                tracing::info!(
                    "Listening for CoIoT reports on {}:{}",
                    self.config.coiot_group,
                    self.config.coiot_port
                );
                *listener = Some(tokio::spawn(self.shared.clone().run_listener(socket)));
            }
            Err(e) => tracing::warn!("CoIoT listener unavailable: {}", e),
        }
    }

    /// Register routing data for a device without starting any task
    fn register(&self, device: &DeviceRecord) -> Result<()> {
        let entry = Gen1Device::new(device, self.default_credentials.as_ref())?;
        self.shared
            .devices
            .lock()
            .insert(device.identifier.clone(), entry);
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for Gen1Client {
    fn generation(&self) -> Generation {
        Generation::Gen1
    }

    async fn connect(&self, device: &DeviceRecord) -> Result<()> {
        self.register(device)?;
        self.ensure_listener();

        let delay = device
            .state_reading_delay
            .unwrap_or_else(|| self.config.state_reading_delay());
        tracing::info!(
            "Connecting gen1 device {}, polling every {:?}",
            device.identifier,
            delay
        );

        let handle = tokio::spawn(
            self.shared
                .clone()
                .run_poller(device.identifier.clone(), delay),
        );
        if let Some(previous) = self.pollers.lock().insert(device.identifier.clone(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        for (_, poller) in self.pollers.lock().drain() {
            poller.abort();
        }

        let identifiers: Vec<DeviceId> = self.shared.devices.lock().keys().cloned().collect();
        for identifier in &identifiers {
            self.shared.set_state(identifier, ConnectionState::Disconnected);
        }
        self.shared.devices.lock().clear();
        tracing::info!("Gen1 client disconnected {} device(s)", identifiers.len());
        Ok(())
    }

    async fn write_property(
        &self,
        device: &DeviceRecord,
        channel: &str,
        property: &str,
        value: &Value,
    ) -> Result<()> {
        let channel_description = device
            .channel(channel)
            .ok_or_else(|| ConnectorError::InvalidPayload(format!("unknown channel {}", channel)))?;
        let property_description = channel_description.property(property).ok_or_else(|| {
            ConnectorError::InvalidPayload(format!("unknown property {}/{}", channel, property))
        })?;

        let block = channel_description.name.as_deref().unwrap_or(channel);
        let sensor = property_description.name.as_deref().unwrap_or(property);
        let request = write_request(block, sensor, value)?;

        let address = device.address()?;
        let credentials = device.credentials.as_ref().or(self.default_credentials.as_ref());
        tracing::debug!(
            "Writing {} to gen1 device {} via {} {:?}",
            value,
            device.identifier,
            request.path,
            request.query
        );
        self.shared
            .transport
            .get_json(address, &request.path, &request.query, credentials)
            .await?;
        Ok(())
    }
}

impl Drop for Gen1Client {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        for (_, poller) in self.pollers.lock().drain() {
            poller.abort();
        }
    }
}
