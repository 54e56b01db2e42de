//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use shelly_connector::{ConnectorError, Credentials, HttpTransport, MdnsResponse, Result, ServiceBrowser};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Load a JSON document from `tests/fixtures`
pub fn fixture(name: &str) -> serde_json::Value {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e));
    serde_json::from_str(&text).unwrap_or_else(|e| panic!("{} is not JSON: {}", name, e))
}

/// HTTP surface answering from recorded documents; unknown paths are 404
#[derive(Default)]
pub struct RecordedDevices {
    responses: HashMap<(String, String), std::result::Result<serde_json::Value, u16>>,
    pub requests: Mutex<Vec<(String, String)>>,
}

impl RecordedDevices {
    pub fn with(mut self, address: &str, path: &str, body: serde_json::Value) -> Self {
        self.responses
            .insert((address.to_string(), path.to_string()), Ok(body));
        self
    }

    pub fn with_status(mut self, address: &str, path: &str, status: u16) -> Self {
        self.responses
            .insert((address.to_string(), path.to_string()), Err(status));
        self
    }

    /// The RGBW2 at 10.10.0.239
    pub fn rgbw2(self) -> Self {
        self.with("10.10.0.239", "/shelly", fixture("shrgbw2_shelly.json"))
            .with("10.10.0.239", "/cit/d", fixture("shrgbw2_cit.json"))
            .with("10.10.0.239", "/status", fixture("shrgbw2_status.json"))
    }

    /// The Plus 2PM at 10.10.0.37
    pub fn plus2pm(self) -> Self {
        self.with(
            "10.10.0.37",
            "/rpc/Shelly.GetDeviceInfo",
            fixture("shellyplus2pm_info.json"),
        )
        .with(
            "10.10.0.37",
            "/rpc/Shelly.GetConfig",
            fixture("shellyplus2pm_config.json"),
        )
        .with(
            "10.10.0.37",
            "/rpc/Shelly.GetStatus",
            fixture("shellyplus2pm_status.json"),
        )
    }
}

#[async_trait]
impl HttpTransport for RecordedDevices {
    async fn get_json(
        &self,
        address: &str,
        path: &str,
        _query: &[(String, String)],
        _credentials: Option<&Credentials>,
    ) -> Result<serde_json::Value> {
        self.requests
            .lock()
            .unwrap()
            .push((address.to_string(), path.to_string()));
        match self.responses.get(&(address.to_string(), path.to_string())) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(ConnectorError::HttpStatus {
                path: path.to_string(),
                status: *status,
            }),
            None => Err(ConnectorError::HttpStatus {
                path: path.to_string(),
                status: 404,
            }),
        }
    }
}

/// mDNS answers fixed in advance
pub struct RecordedAnswers(pub Vec<MdnsResponse>);

impl RecordedAnswers {
    pub fn new(answers: &[(&str, &str)]) -> Self {
        Self(
            answers
                .iter()
                .map(|(name, address)| MdnsResponse {
                    address: address.to_string(),
                    name: name.to_string(),
                    domain: Some(format!("{}.local", name)),
                    properties: BTreeMap::new(),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ServiceBrowser for RecordedAnswers {
    async fn browse(&self, _window: Duration) -> Result<Vec<MdnsResponse>> {
        Ok(self.0.clone())
    }
}
