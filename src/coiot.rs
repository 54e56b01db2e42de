//! CoIoT, the CoAP based reporting protocol of generation 1 devices.
//!
//! Devices multicast CoAP non-confirmable messages with code 0.30 to
//! `224.0.1.187:5683`. The device is identified by option 3332
//! (`type#id#version`); the JSON payload `{"G": [[block, sensor, value], ...]}`
//! carries the readings. The sensor ids refer to the description tree served
//! at `/cit/d`.

use crate::error::{ConnectorError, Result};
use crate::types::{ChannelDescription, DataType, Format, PropertyDescription, Value, dedup};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

/// CoAP code 0.30, used by CoIoT status publications
pub const STATUS_CODE: u8 = 30;

const OPTION_DEVICE: u16 = 3332;
const OPTION_VALIDITY: u16 = 3412;
const OPTION_SERIAL: u16 = 3420;

const PAYLOAD_MARKER: u8 = 0xFF;

/// Sensor descriptions the device accepts writes for
const SETTABLE_SENSORS: &[&str] = &[
    "output",
    "brightness",
    "red",
    "green",
    "blue",
    "white",
    "gain",
    "roller",
    "rollerPos",
];

/// One `(block, sensor, value)` entry of a report
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorReading {
    /// Always 0 on current firmware
    pub block: u32,
    pub sensor: u32,
    pub value: serde_json::Value,
}

/// Parsed status publication
#[derive(Debug, Clone, PartialEq)]
pub struct CoapReport {
    pub device_type: String,
    pub device_id: String,
    pub sender: IpAddr,
    /// Seconds until the next publication
    pub validity: Option<u32>,
    pub serial: Option<u32>,
    pub readings: Vec<SensorReading>,
}

#[derive(Deserialize)]
struct ReportPayload {
    #[serde(rename = "G")]
    readings: Vec<(u32, u32, serde_json::Value)>,
}

fn malformed(reason: impl Into<String>) -> ConnectorError {
    ConnectorError::InvalidPayload(format!("CoAP: {}", reason.into()))
}

fn option_int(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// Decode an option delta or length nibble with its extension bytes
fn extended(nibble: u8, data: &[u8], pos: &mut usize) -> Result<u16> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            let b = *data.get(*pos).ok_or_else(|| malformed("truncated option"))?;
            *pos += 1;
            Ok(u16::from(b) + 13)
        }
        14 => {
            let bytes = data
                .get(*pos..*pos + 2)
                .ok_or_else(|| malformed("truncated option"))?;
            *pos += 2;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]).saturating_add(269))
        }
        _ => Err(malformed("reserved option nibble")),
    }
}

impl CoapReport {
    /// Parse a datagram received from `sender`
    pub fn parse(data: &[u8], sender: IpAddr) -> Result<Self> {
        if data.len() < 4 {
            return Err(malformed("datagram shorter than header"));
        }
        let version = data[0] >> 6;
        if version != 1 {
            return Err(malformed(format!("unsupported version {}", version)));
        }
        let token_length = usize::from(data[0] & 0x0F);
        if token_length > 8 {
            return Err(malformed("token longer than 8 bytes"));
        }
        if data[1] != STATUS_CODE {
            return Err(malformed(format!("unexpected code {}", data[1])));
        }

        let mut pos = 4 + token_length;
        if pos > data.len() {
            return Err(malformed("truncated token"));
        }

        let mut number: u16 = 0;
        let mut device = None;
        let mut validity = None;
        let mut serial = None;
        let mut payload: &[u8] = &[];

        while pos < data.len() {
            let byte = data[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                payload = &data[pos..];
                break;
            }
            let delta = extended(byte >> 4, data, &mut pos)?;
            let length = usize::from(extended(byte & 0x0F, data, &mut pos)?);
            number = number.saturating_add(delta);
            let value = data
                .get(pos..pos + length)
                .ok_or_else(|| malformed("truncated option value"))?;
            pos += length;

            match number {
                OPTION_DEVICE => device = Some(String::from_utf8_lossy(value).into_owned()),
                OPTION_VALIDITY => validity = Some(option_int(value)),
                OPTION_SERIAL => serial = Some(option_int(value)),
                _ => {}
            }
        }

        let device = device.ok_or_else(|| malformed("missing device option"))?;
        let mut parts = device.split('#');
        let device_type = parts.next().unwrap_or_default().to_string();
        let device_id = parts.next().unwrap_or_default().to_string();
        if device_type.is_empty() || device_id.is_empty() {
            return Err(malformed(format!("bad device option {:?}", device)));
        }

        let payload: ReportPayload = serde_json::from_slice(payload)
            .map_err(|e| malformed(format!("payload: {}", e)))?;

        Ok(Self {
            device_type,
            device_id,
            sender,
            validity,
            serial,
            readings: payload
                .readings
                .into_iter()
                .map(|(block, sensor, value)| SensorReading { block, sensor, value })
                .collect(),
        })
    }
}

/// Bind a UDP socket joined to the CoIoT multicast group
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        tracing::warn!("Failed to set SO_REUSEADDR for CoIoT socket: {}", e);
    }
    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        tracing::warn!("Failed to set SO_REUSEPORT for CoIoT socket: {}", e);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Description tree served at `/cit/d`
#[derive(Debug, Clone, Deserialize)]
pub struct CitDescription {
    #[serde(rename = "blk")]
    pub blocks: Vec<CitBlock>,
    #[serde(rename = "sen")]
    pub sensors: Vec<CitSensor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CitBlock {
    #[serde(rename = "I")]
    pub id: u32,
    #[serde(rename = "D")]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CitSensor {
    #[serde(rename = "I")]
    pub id: u32,
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(rename = "D")]
    pub description: String,
    #[serde(rename = "U", default)]
    pub unit: Option<String>,
    #[serde(rename = "R", default)]
    pub range: Option<CitRange>,
    #[serde(rename = "L")]
    pub links: CitLinks,
}

/// Value range, optionally followed by the "unknown" sentinel
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CitRange {
    Plain(String),
    WithInvalid(Vec<String>),
}

/// Block(s) a sensor belongs to
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CitLinks {
    One(u32),
    Many(Vec<u32>),
}

impl CitLinks {
    pub fn contains(&self, block: u32) -> bool {
        match self {
            Self::One(id) => *id == block,
            Self::Many(ids) => ids.contains(&block),
        }
    }
}

/// CoIoT sensor type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    Alarm,
    Battery,
    Concentration,
    Energy,
    Event,
    EventCounter,
    Humidity,
    Current,
    Luminosity,
    Power,
    Status,
    Temperature,
    Voltage,
    Other,
}

impl SensorType {
    pub fn parse(code: &str) -> Self {
        match code {
            "A" => Self::Alarm,
            "B" => Self::Battery,
            "C" => Self::Concentration,
            "E" => Self::Energy,
            "EV" => Self::Event,
            "EVC" => Self::EventCounter,
            "H" => Self::Humidity,
            "I" => Self::Current,
            "L" => Self::Luminosity,
            "P" => Self::Power,
            "S" => Self::Status,
            "T" => Self::Temperature,
            "V" => Self::Voltage,
            _ => Self::Other,
        }
    }

    fn default_unit(&self) -> Option<&'static str> {
        match self {
            Self::Energy => Some("Wh"),
            Self::Power => Some("W"),
            Self::Voltage => Some("V"),
            Self::Current => Some("A"),
            Self::Humidity | Self::Battery => Some("%"),
            _ => None,
        }
    }

    fn is_measurement(&self) -> bool {
        matches!(
            self,
            Self::Energy
                | Self::Power
                | Self::Voltage
                | Self::Current
                | Self::Temperature
                | Self::Humidity
                | Self::Luminosity
                | Self::Concentration
        )
    }
}

fn parse_scalar(text: &str) -> Value {
    let text = text.trim();
    if let Ok(i) = text.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = text.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::String(text.to_string())
    }
}

/// Derive data type and format from a range string
fn parse_range(range: &str) -> (DataType, Option<Format>) {
    match range {
        "U8" => return (DataType::Uchar, None),
        "U16" => return (DataType::Ushort, None),
        "U32" => return (DataType::Uint, None),
        "I8" => return (DataType::Char, None),
        "I16" => return (DataType::Short, None),
        "I32" => return (DataType::Int, None),
        "0/1" => return (DataType::Boolean, None),
        _ => {}
    }

    let parts: Vec<&str> = range.split('/').collect();
    if parts.len() == 2 {
        let (min, max) = (parse_scalar(parts[0]), parse_scalar(parts[1]));
        match (&min, &max) {
            (Value::Int(lo), Value::Int(_)) => {
                let data_type = if *lo >= 0 { DataType::Uint } else { DataType::Int };
                return (data_type, Some(Format::Numeric { min: Some(min), max: Some(max) }));
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                return (
                    DataType::Float,
                    Some(Format::Numeric { min: Some(min), max: Some(max) }),
                );
            }
            _ => {}
        }
    }
    if parts.len() >= 2 {
        return (
            DataType::Enum,
            Some(Format::Enumeration(parts.iter().map(|p| p.to_string()).collect())),
        );
    }
    (DataType::String, None)
}

fn normalize_unit(unit: &str) -> String {
    match unit {
        "C" => "°C".to_string(),
        "F" => "°F".to_string(),
        "pct" => "%".to_string(),
        other => other.to_string(),
    }
}

impl CitSensor {
    /// Store identifier, `{id}_{type}_{description}`
    pub fn identifier(&self) -> String {
        format!("{}_{}_{}", self.id, self.kind.to_lowercase(), self.description)
    }

    /// Property description derived from the structured sensor fields
    pub fn property(&self) -> PropertyDescription {
        let kind = SensorType::parse(&self.kind);
        let (range, invalid) = match &self.range {
            Some(CitRange::Plain(range)) => (Some(range.as_str()), None),
            Some(CitRange::WithInvalid(items)) => (
                items.first().map(String::as_str),
                items.get(1).map(|s| parse_scalar(s)),
            ),
            None => (None, None),
        };

        let (mut data_type, format) = range.map(parse_range).unwrap_or((DataType::String, None));
        if kind.is_measurement() && data_type != DataType::Enum {
            data_type = DataType::Float;
        }

        let mut property = PropertyDescription::new(self.identifier(), data_type)
            .with_name(&self.description)
            .settable(kind == SensorType::Status && SETTABLE_SENSORS.contains(&self.description.as_str()));
        if let Some(format) = format {
            property = property.with_format(format);
        }
        if let Some(unit) = self.unit.as_deref().map(normalize_unit).or(kind.default_unit().map(String::from)) {
            property = property.with_unit(unit);
        }
        if let Some(invalid) = invalid {
            property = property.with_invalid(invalid);
        }
        property
    }
}

impl CitDescription {
    /// One channel per block, each holding the block's linked sensors
    pub fn channels(&self) -> Vec<ChannelDescription> {
        let channels = self.blocks.iter().map(|block| {
            let properties = self
                .sensors
                .iter()
                .filter(|sensor| sensor.links.contains(block.id))
                .map(CitSensor::property)
                .collect();
            ChannelDescription::new(
                format!("{}_{}", block.id, block.description),
                Some(block.description.clone()),
                properties,
            )
        });
        dedup(channels)
    }
}
