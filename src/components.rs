//! Generation 2 component model.
//!
//! Configuration and status documents are keyed by component (`switch:0`,
//! `input:1`, ...). Each supported component becomes one channel named
//! `{type}_{id}`; its attributes become properties with a data type, unit and
//! format derived from the attribute.

use crate::error::{ConnectorError, Result};
use crate::types::{ChannelDescription, ChannelState, DataType, Format, PropertyDescription, PropertyState, Value};
use serde_json::{Map, json};
use std::fmt;

/// Events a button input can push
const BUTTON_EVENTS: &[&str] = &[
    "single_push",
    "double_push",
    "triple_push",
    "long_push",
    "btn_down",
    "btn_up",
];

const COVER_STATES: &[&str] = &["open", "closed", "opening", "closing", "stopped", "calibrating"];

const COVER_COMMANDS: &[&str] = &["open", "close", "stop"];

const METERING_FIELDS: &[(&str, &str)] = &[
    ("apower", "active_power"),
    ("voltage", "voltage"),
    ("current", "current"),
    ("pf", "power_factor"),
    ("aenergy.total", "active_energy"),
    ("temperature.tC", "celsius"),
    ("temperature.tF", "fahrenheit"),
];

/// Device components that map to channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Switch,
    Cover,
    Light,
    Input,
    Temperature,
    Humidity,
    DevicePower,
}

impl ComponentType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "switch" => Some(Self::Switch),
            "cover" => Some(Self::Cover),
            "light" => Some(Self::Light),
            "input" => Some(Self::Input),
            "temperature" => Some(Self::Temperature),
            "humidity" => Some(Self::Humidity),
            "devicepower" => Some(Self::DevicePower),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Cover => "cover",
            Self::Light => "light",
            Self::Input => "input",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::DevicePower => "devicepower",
        }
    }

    /// `(status field, property)` pairs reported by this component
    fn fields(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Switch => &[("output", "output")],
            Self::Cover => &[("state", "state"), ("current_pos", "position")],
            Self::Light => &[("output", "output"), ("brightness", "brightness")],
            Self::Input => &[("state", "state"), ("percent", "percent")],
            Self::Temperature => &[("tC", "celsius"), ("tF", "fahrenheit")],
            Self::Humidity => &[("rh", "humidity")],
            Self::DevicePower => &[
                ("battery.percent", "battery"),
                ("battery.V", "voltage"),
                ("external.present", "external_power"),
            ],
        }
    }

    fn is_metered(&self) -> bool {
        matches!(self, Self::Switch | Self::Cover | Self::Light)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component key as used in RPC documents, `switch:0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub component: ComponentType,
    pub id: u32,
}

impl ComponentKey {
    /// Parse `switch:0`; unknown components and keys without id yield `None`
    pub fn parse(key: &str) -> Option<Self> {
        let (component, id) = key.split_once(':')?;
        Some(Self {
            component: ComponentType::parse(component)?,
            id: id.parse().ok()?,
        })
    }

    /// Parse a channel identifier, `switch_0`
    pub fn from_channel(channel: &str) -> Option<Self> {
        let (component, id) = channel.rsplit_once('_')?;
        Some(Self {
            component: ComponentType::parse(component)?,
            id: id.parse().ok()?,
        })
    }

    pub fn channel(&self) -> String {
        format!("{}_{}", self.component, self.id)
    }
}

fn lookup<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn property(component: ComponentType, identifier: &str) -> PropertyDescription {
    let float = |unit: &str| PropertyDescription::new(identifier, DataType::Float).with_unit(unit);
    match (component, identifier) {
        (_, "output") => PropertyDescription::new(identifier, DataType::Boolean).settable(true),
        (_, "brightness") | (_, "position") => PropertyDescription::new(identifier, DataType::Uchar)
            .with_unit("%")
            .with_format(Format::range(0, 100))
            .settable(true),
        (_, "command") => PropertyDescription::new(identifier, DataType::Enum)
            .with_format(Format::enumeration(COVER_COMMANDS))
            .queryable(false)
            .settable(true),
        (ComponentType::Cover, "state") => PropertyDescription::new(identifier, DataType::Enum)
            .with_format(Format::enumeration(COVER_STATES)),
        (_, "state") | (_, "external_power") => PropertyDescription::new(identifier, DataType::Boolean),
        (_, "event") => PropertyDescription::new(identifier, DataType::Enum)
            .with_format(Format::enumeration(BUTTON_EVENTS))
            .queryable(false),
        (_, "active_power") => float("W"),
        (_, "voltage") => float("V"),
        (_, "current") => float("A"),
        (_, "active_energy") => float("Wh"),
        (_, "celsius") => float("°C"),
        (_, "fahrenheit") => float("°F"),
        (_, "humidity") | (_, "percent") => float("%"),
        (_, "battery") => PropertyDescription::new(identifier, DataType::Uchar)
            .with_unit("%")
            .with_format(Format::range(0, 100)),
        _ => PropertyDescription::new(identifier, DataType::Float),
    }
}

/// Properties every component of a type carries, whatever its status holds
fn base_properties(component: ComponentType, config: &serde_json::Value) -> Vec<&'static str> {
    match component {
        ComponentType::Switch => vec!["output"],
        ComponentType::Light => vec!["output", "brightness"],
        ComponentType::Cover => vec!["state", "position", "command"],
        ComponentType::Input => match config.get("type").and_then(|t| t.as_str()) {
            Some("button") => vec!["event"],
            Some("analog") => vec!["percent"],
            _ => vec!["state"],
        },
        ComponentType::Temperature => vec!["celsius", "fahrenheit"],
        ComponentType::Humidity => vec!["humidity"],
        ComponentType::DevicePower => vec!["battery"],
    }
}

fn describe_component(
    key: ComponentKey,
    config: &serde_json::Value,
    status: Option<&serde_json::Value>,
) -> ChannelDescription {
    let mut identifiers = base_properties(key.component, config);

    // Inputs are fully described by their configured type
    if let (Some(status), false) = (status, key.component == ComponentType::Input) {
        let metering: &[(&str, &str)] = if key.component.is_metered() { METERING_FIELDS } else { &[] };
        for (field, identifier) in key.component.fields().iter().chain(metering) {
            if lookup(status, field).is_some() && !identifiers.contains(identifier) {
                identifiers.push(*identifier);
            }
        }
    }

    let name = config
        .get("name")
        .and_then(|n| n.as_str())
        .map(String::from);

    ChannelDescription::new(
        key.channel(),
        name,
        identifiers
            .into_iter()
            .map(|identifier| property(key.component, identifier))
            .collect(),
    )
}

/// Channel descriptions from `Shelly.GetConfig` and `Shelly.GetStatus`
pub fn describe(config: &serde_json::Value, status: Option<&serde_json::Value>) -> Vec<ChannelDescription> {
    let Some(components) = config.as_object() else {
        return Vec::new();
    };
    components
        .iter()
        .filter_map(|(key, config)| {
            let key = ComponentKey::parse(key)?;
            let status = status.and_then(|s| s.get(key_name(&key)));
            Some(describe_component(key, config, status))
        })
        .collect()
}

fn key_name(key: &ComponentKey) -> String {
    format!("{}:{}", key.component, key.id)
}

/// Readings from a status document or a `NotifyStatus` delta
///
/// Only fields present in the document are reported.
pub fn status_states(status: &serde_json::Value) -> Vec<ChannelState> {
    let Some(components) = status.as_object() else {
        return Vec::new();
    };
    components
        .iter()
        .filter_map(|(key, status)| {
            let key = ComponentKey::parse(key)?;
            let metering: &[(&str, &str)] = if key.component.is_metered() { METERING_FIELDS } else { &[] };
            let properties: Vec<PropertyState> = key
                .component
                .fields()
                .iter()
                .chain(metering)
                .filter_map(|(field, identifier)| {
                    lookup(status, field).map(|v| PropertyState::new(*identifier, Value::from_json(v)))
                })
                .collect();
            (!properties.is_empty()).then(|| ChannelState::new(key.channel(), properties))
        })
        .collect()
}

/// Readings from `NotifyEvent` parameters; button events become the
/// input channel's `event` property
pub fn event_states(params: &serde_json::Value) -> Vec<ChannelState> {
    let Some(events) = params.get("events").and_then(|e| e.as_array()) else {
        return Vec::new();
    };
    events
        .iter()
        .filter_map(|event| {
            let key = ComponentKey::parse(event.get("component")?.as_str()?)?;
            let name = event.get("event")?.as_str()?;
            if key.component != ComponentType::Input || !BUTTON_EVENTS.contains(&name) {
                return None;
            }
            Some(ChannelState::new(
                key.channel(),
                vec![PropertyState::new("event", Value::from(name))],
            ))
        })
        .collect()
}

/// IP address reported in the `wifi` status component
pub fn wifi_address(status: &serde_json::Value) -> Option<&str> {
    status.pointer("/wifi/sta_ip").and_then(|v| v.as_str())
}

/// RPC method and parameters writing `value` to a channel property
pub fn write_call(channel: &str, property: &str, value: &Value) -> Result<(String, Map<String, serde_json::Value>)> {
    let key = ComponentKey::from_channel(channel)
        .ok_or_else(|| ConnectorError::InvalidPayload(format!("{} is not a component channel", channel)))?;
    let id = key.id;

    let as_bool = || {
        value
            .as_bool()
            .ok_or_else(|| ConnectorError::InvalidPayload(format!("{} is not a switch state", value)))
    };
    let as_int = || {
        value
            .as_f64()
            .map(|v| v.round() as i64)
            .ok_or_else(|| ConnectorError::InvalidPayload(format!("{} is not a number", value)))
    };

    let (method, params) = match (key.component, property) {
        (ComponentType::Switch, "output") => ("Switch.Set", json!({"id": id, "on": as_bool()?})),
        (ComponentType::Light, "output") => ("Light.Set", json!({"id": id, "on": as_bool()?})),
        (ComponentType::Light, "brightness") => {
            ("Light.Set", json!({"id": id, "brightness": as_int()?}))
        }
        (ComponentType::Cover, "position") => {
            ("Cover.GoToPosition", json!({"id": id, "pos": as_int()?}))
        }
        (ComponentType::Cover, "command") => {
            let method = match value.to_string().to_lowercase().as_str() {
                "open" => "Cover.Open",
                "close" => "Cover.Close",
                "stop" => "Cover.Stop",
                _ => {
                    return Err(ConnectorError::InvalidPayload(format!(
                        "{} is not a cover command",
                        value
                    )))
                }
            };
            (method, json!({"id": id}))
        }
        _ => {
            return Err(ConnectorError::InvalidPayload(format!(
                "property {}/{} is not writable",
                channel, property
            )))
        }
    };

    let params = match params {
        serde_json::Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok((method.to_string(), params))
}
