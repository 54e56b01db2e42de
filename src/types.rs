use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Device identifier (`id-type`, lower case)
pub type DeviceId = String;

/// Device protocol generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// CoIoT reports + HTTP polling
    Gen1,
    /// WebSocket JSON-RPC
    Gen2,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gen1 => write!(f, "gen1"),
            Self::Gen2 => write!(f, "gen2"),
        }
    }
}

/// Loosely typed reading or desired value
///
/// Equality and hashing are structural; floats compare by bit pattern so the
/// type can be used as a set key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::String(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl Value {
    /// Convert a JSON value; arrays and objects are kept as their JSON text
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }

    /// Convert into a JSON value for RPC parameters
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Interpret as a switch state
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            Self::Float(f) if *f == 0.0 => Some(false),
            Self::Float(f) if *f == 1.0 => Some(true),
            Self::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            Self::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        let value = self.as_f64()?;
        if value.fract() == 0.0 && value.is_finite() {
            Some(value as i64)
        } else {
            None
        }
    }
}

/// Property data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Char,
    Uchar,
    Short,
    Ushort,
    Int,
    Uint,
    Float,
    String,
    Enum,
    Unknown,
}

impl DataType {
    /// Coerce a reading into this data type
    pub fn normalize(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            Self::Boolean => value.as_bool().map(Value::Bool),
            Self::Char | Self::Short | Self::Int => value.as_i64().map(Value::Int),
            Self::Uchar | Self::Ushort | Self::Uint => {
                value.as_i64().filter(|v| *v >= 0).map(Value::Int)
            }
            Self::Float => value.as_f64().map(Value::Float),
            Self::String | Self::Enum => Some(Value::String(value.to_string())),
            Self::Unknown => Some(value.clone()),
        }
    }
}

/// Allowed values of a property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Fixed set of string values
    Enumeration(Vec<String>),
    /// Inclusive numeric range, either bound optional
    Numeric {
        min: Option<Value>,
        max: Option<Value>,
    },
}

impl Format {
    /// Build an enumeration format from string slices
    pub fn enumeration(items: &[&str]) -> Self {
        Self::Enumeration(items.iter().map(|s| s.to_string()).collect())
    }

    /// Build an integer range format
    pub fn range(min: i64, max: i64) -> Self {
        Self::Numeric {
            min: Some(Value::Int(min)),
            max: Some(Value::Int(max)),
        }
    }

    /// Whether `value` satisfies the format
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Enumeration(items) => items.iter().any(|i| *i == value.to_string()),
            Self::Numeric { min, max } => {
                let Some(v) = value.as_f64() else {
                    // Booleans and strings are not range checked
                    return true;
                };
                let above = min.as_ref().and_then(Value::as_f64).map_or(true, |m| v >= m);
                let below = max.as_ref().and_then(Value::as_f64).map_or(true, |m| v <= m);
                above && below
            }
        }
    }
}

/// Static description of a channel property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyDescription {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    pub data_type: DataType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub format: Option<Format>,
    /// Reading the device reports when the sensor value is unknown
    #[serde(default)]
    pub invalid: Option<Value>,
    pub queryable: bool,
    pub settable: bool,
}

impl PropertyDescription {
    /// Create a queryable, read-only property
    pub fn new(identifier: impl Into<String>, data_type: DataType) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            data_type,
            unit: None,
            format: None,
            invalid: None,
            queryable: true,
            settable: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_invalid(mut self, invalid: Value) -> Self {
        self.invalid = Some(invalid);
        self
    }

    pub fn queryable(mut self, queryable: bool) -> Self {
        self.queryable = queryable;
        self
    }

    pub fn settable(mut self, settable: bool) -> Self {
        self.settable = settable;
        self
    }

    /// Coerce a reading to this property's data type and check its format
    pub fn normalize(&self, value: &Value) -> Option<Value> {
        let normalized = self.data_type.normalize(value)?;
        if normalized.is_null() {
            return Some(normalized);
        }
        match &self.format {
            Some(format) if !format.accepts(&normalized) => None,
            _ => Some(normalized),
        }
    }

    /// Whether `value` is the device's "unknown" sentinel for this property
    pub fn is_invalid_reading(&self, value: &Value) -> bool {
        match &self.invalid {
            Some(invalid) => {
                invalid == value
                    || matches!((invalid.as_f64(), value.as_f64()), (Some(a), Some(b)) if a == b)
            }
            None => false,
        }
    }
}

/// Static description of a device channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDescription {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    pub properties: Vec<PropertyDescription>,
}

impl ChannelDescription {
    /// Create a channel; structurally equal properties collapse to one
    pub fn new(
        identifier: impl Into<String>,
        name: Option<String>,
        properties: Vec<PropertyDescription>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            name,
            properties: dedup(properties),
        }
    }

    pub fn property(&self, identifier: &str) -> Option<&PropertyDescription> {
        self.properties.iter().find(|p| p.identifier == identifier)
    }
}

/// One property reading
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyState {
    pub identifier: String,
    pub value: Value,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl PropertyState {
    /// A valid reading
    pub fn new(identifier: impl Into<String>, value: Value) -> Self {
        Self {
            identifier: identifier.into(),
            value,
            valid: true,
        }
    }

    /// A reading the device flagged as not trustworthy
    pub fn invalid(identifier: impl Into<String>, value: Value) -> Self {
        Self {
            identifier: identifier.into(),
            value,
            valid: false,
        }
    }
}

/// Readings for one channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelState {
    pub identifier: String,
    pub properties: Vec<PropertyState>,
}

impl ChannelState {
    /// Create a channel snapshot; structurally equal readings collapse to one
    pub fn new(identifier: impl Into<String>, properties: Vec<PropertyState>) -> Self {
        Self {
            identifier: identifier.into(),
            properties: dedup(properties),
        }
    }
}

/// Device found during a discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub generation: Generation,
    pub id: String,
    pub device_type: String,
    pub ip_address: String,
    pub domain: Option<String>,
}

impl DiscoveredDevice {
    /// Identity key, `id-type`
    pub fn identifier(&self) -> DeviceId {
        format!("{}-{}", self.id, self.device_type).to_lowercase()
    }
}

/// Device connection state, stored in the device `state` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Init,
    Connected,
    Disconnected,
    Lost,
    Unknown,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        Self::Init,
        Self::Connected,
        Self::Disconnected,
        Self::Lost,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Lost => "lost",
            Self::Unknown => "unknown",
        }
    }
}

/// Username and password for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Remove structural duplicates, keeping first occurrences in order
pub fn dedup<T: Eq + Hash + Clone>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Format a hardware address as lower case, colon separated octets
pub fn format_mac(raw: &str) -> String {
    let hex: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    hex.chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_descriptions() {
        let output = PropertyDescription::new("1101_s_output", DataType::Boolean).settable(true);
        let channel = ChannelDescription::new(
            "0_relay_0",
            None,
            vec![output.clone(), output.clone(), PropertyDescription::new("4101_p_power", DataType::Float)],
        );
        assert_eq!(channel.properties.len(), 2);
        assert_eq!(channel.properties[0], output);
    }

    #[test]
    fn test_dedup_states_distinguishes_values() {
        let state = ChannelState::new(
            "switch_0",
            vec![
                PropertyState::new("apower", Value::Float(1.5)),
                PropertyState::new("apower", Value::Float(1.5)),
                PropertyState::new("apower", Value::Float(2.5)),
            ],
        );
        assert_eq!(state.properties.len(), 2);
    }

    #[test]
    fn test_value_untagged_json() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 3, 2.5, "on"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(3),
                Value::Float(2.5),
                Value::String("on".into())
            ]
        );
    }

    #[test]
    fn test_normalize() {
        let output = PropertyDescription::new("output", DataType::Boolean);
        assert_eq!(output.normalize(&Value::Int(1)), Some(Value::Bool(true)));
        assert_eq!(output.normalize(&Value::String("off".into())), Some(Value::Bool(false)));
        assert_eq!(output.normalize(&Value::Int(7)), None);

        let brightness = PropertyDescription::new("brightness", DataType::Uchar)
            .with_format(Format::range(0, 100));
        assert_eq!(brightness.normalize(&Value::Float(42.0)), Some(Value::Int(42)));
        assert_eq!(brightness.normalize(&Value::Int(101)), None);

        let roller = PropertyDescription::new("roller", DataType::Enum)
            .with_format(Format::enumeration(&["open", "close", "stop"]));
        assert_eq!(roller.normalize(&Value::from("stop")), Some(Value::from("stop")));
        assert_eq!(roller.normalize(&Value::from("sideways")), None);
    }

    #[test]
    fn test_invalid_sentinel() {
        let temp = PropertyDescription::new("3101_t_exttemp", DataType::Float)
            .with_invalid(Value::Int(999));
        assert!(temp.is_invalid_reading(&Value::Float(999.0)));
        assert!(!temp.is_invalid_reading(&Value::Float(21.5)));
    }

    // Regression: both flags must be serialized from their own field.
    #[test]
    fn test_serialize_queryable_and_settable_independently() {
        let property = PropertyDescription::new("output", DataType::Boolean)
            .queryable(false)
            .settable(true);
        let json = serde_json::to_value(&property).unwrap();
        assert_eq!(json["queryable"], serde_json::Value::Bool(false));
        assert_eq!(json["settable"], serde_json::Value::Bool(true));

        let property = PropertyDescription::new("power", DataType::Float);
        let json = serde_json::to_value(&property).unwrap();
        assert_eq!(json["queryable"], serde_json::Value::Bool(true));
        assert_eq!(json["settable"], serde_json::Value::Bool(false));
    }

    #[test]
    fn test_identifier_and_mac() {
        let device = DiscoveredDevice {
            generation: Generation::Gen1,
            id: "C45BBEE4C926".into(),
            device_type: "shellyrgbw2".into(),
            ip_address: "10.10.0.239".into(),
            domain: None,
        };
        assert_eq!(device.identifier(), "c45bbee4c926-shellyrgbw2");
        assert_eq!(format_mac("C45BBEE4C926"), "c4:5b:be:e4:c9:26");
        assert_eq!(format_mac("44:17:93:AD:07:E8"), "44:17:93:ad:07:e8");
    }
}
