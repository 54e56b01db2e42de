use crate::coiot::CitDescription;
use crate::components;
use crate::config::DiscoveryConfig;
use crate::error::{ConnectorError, Result};
use crate::http::HttpTransport;
use crate::mdns::{MdnsResponse, ServiceBrowser};
use crate::messages::{Message, StoreLocalDevice};
use crate::protocol::UNAUTHORIZED;
use crate::queue::QueueSender;
use crate::types::{format_mac, ChannelDescription, Credentials, DiscoveredDevice, Generation};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;

const GEN1_INFO: &str = "/shelly";
const GEN1_DESCRIPTION: &str = "/cit/d";
const GEN2_INFO: &str = "/rpc/Shelly.GetDeviceInfo";
const GEN2_CONFIG: &str = "/rpc/Shelly.GetConfig";
const GEN2_STATUS: &str = "/rpc/Shelly.GetStatus";

/// Progress of a discovery pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Listening,
    Probing,
    Resolved,
    Failed,
}

/// `GET /shelly` answer of a generation 1 device
#[derive(Debug, Deserialize)]
struct Gen1Info {
    #[serde(rename = "type")]
    device_type: String,
    mac: String,
    #[serde(default)]
    auth: bool,
    #[serde(default)]
    fw: Option<String>,
    #[serde(default)]
    gen: Option<u8>,
}

/// `Shelly.GetDeviceInfo` answer of a generation 2 device
#[derive(Debug, Deserialize)]
struct Gen2Info {
    mac: String,
    model: String,
    #[serde(default)]
    gen: Option<u8>,
    #[serde(default)]
    ver: Option<String>,
    #[serde(default)]
    auth_en: bool,
}

/// Discovers devices on the local network
///
/// A pass browses mDNS for the configured listening window, then probes
/// every responder over HTTP to classify its generation and read its
/// channels. Devices that cannot be resolved are logged and skipped.
///
/// # Example
///
/// ```no_run
/// use shelly_connector::{Discovery, DiscoveryConfig, MdnsBrowser, ReqwestTransport};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DiscoveryConfig::default();
///     let transport = Arc::new(ReqwestTransport::new(config.probe_timeout()));
///     let discovery = Discovery::new(config, Arc::new(MdnsBrowser::new()?), transport);
///
///     for device in discovery.discover().await? {
///         println!("Found {} ({}) at {:?}", device.identifier, device.model, device.ip_address);
///     }
///     Ok(())
/// }
/// ```
pub struct Discovery {
    config: DiscoveryConfig,
    browser: Arc<dyn ServiceBrowser>,
    transport: Arc<dyn HttpTransport>,
    queue: Option<QueueSender>,
    credentials: Option<Credentials>,
    state: Mutex<DiscoveryState>,
}

impl Discovery {
    /// Create a new Discovery coordinator
    pub fn new(
        config: DiscoveryConfig,
        browser: Arc<dyn ServiceBrowser>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            config,
            browser,
            transport,
            queue: None,
            credentials: None,
            state: Mutex::new(DiscoveryState::Idle),
        }
    }

    /// Append every resolved device to the inbound queue
    pub fn with_queue(mut self, queue: QueueSender) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Credentials for probing devices that require authentication
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// State of the current or last pass
    pub fn state(&self) -> DiscoveryState {
        *self.state.lock()
    }

    fn set_state(&self, state: DiscoveryState) {
        *self.state.lock() = state;
    }

    /// Run one discovery pass
    ///
    /// Fails only when the mDNS query itself fails; per-device problems are
    /// logged and the device is left out of the result.
    pub async fn discover(&self) -> Result<Vec<StoreLocalDevice>> {
        self.set_state(DiscoveryState::Listening);
        let responses = match self.browser.browse(self.config.listen_window()).await {
            Ok(responses) => responses,
            Err(e) => {
                tracing::error!("Discovery query failed: {}", e);
                self.set_state(DiscoveryState::Failed);
                return Err(e);
            }
        };

        self.set_state(DiscoveryState::Probing);
        tracing::info!("Probing {} responder(s)", responses.len());

        let results = join_all(responses.iter().map(|response| self.resolve(response))).await;

        let mut devices = Vec::new();
        for (response, result) in responses.iter().zip(results) {
            match result {
                Ok(device) => {
                    tracing::info!(
                        "Resolved {} device {} ({}) at {}",
                        device.generation,
                        device.identifier,
                        device.model,
                        response.address
                    );
                    devices.push(device);
                }
                Err(e) => {
                    tracing::warn!("Could not resolve {} at {}: {}", response.name, response.address, e);
                }
            }
        }

        if let Some(queue) = &self.queue {
            for device in &devices {
                queue.append(Message::StoreLocalDevice(device.clone()));
            }
        }

        self.set_state(DiscoveryState::Resolved);
        Ok(devices)
    }

    /// Bound a probe by the probe timeout
    async fn probe<F>(&self, call: F) -> Result<serde_json::Value>
    where
        F: Future<Output = Result<serde_json::Value>>,
    {
        timeout(self.config.probe_timeout(), call)
            .await
            .map_err(|_| ConnectorError::Timeout)?
    }

    async fn get(&self, address: &str, path: &str) -> Result<serde_json::Value> {
        self.probe(
            self.transport
                .get_json(address, path, &[], self.credentials.as_ref()),
        )
        .await
    }

    async fn resolve(&self, response: &MdnsResponse) -> Result<StoreLocalDevice> {
        let (device_type, id) = response.instance().ok_or_else(|| {
            ConnectorError::InvalidPayload(format!("{} is not a device instance", response.name))
        })?;

        let gen1_error = match self.probe_gen1(&response.address).await {
            Ok(info) => {
                let device = DiscoveredDevice {
                    generation: Generation::Gen1,
                    id,
                    device_type,
                    ip_address: response.address.clone(),
                    domain: response.domain.clone(),
                };
                return self.resolve_gen1(device, info).await;
            }
            Err(e) => e,
        };
        tracing::debug!("{} is not generation 1: {}", response.address, gen1_error);

        let info = self.probe_gen2(&response.address).await.map_err(|e| {
            ConnectorError::InvalidPayload(format!(
                "no generation answered (gen1: {}, gen2: {})",
                gen1_error, e
            ))
        })?;
        let device = DiscoveredDevice {
            generation: Generation::Gen2,
            id,
            device_type,
            ip_address: response.address.clone(),
            domain: response.domain.clone(),
        };
        self.resolve_gen2(device, info).await
    }

    async fn probe_gen1(&self, address: &str) -> Result<Gen1Info> {
        let info: Gen1Info = serde_json::from_value(self.get(address, GEN1_INFO).await?)?;
        if info.gen.is_some_and(|gen| gen >= 2) {
            return Err(ConnectorError::InvalidPayload(format!(
                "{} reports generation {:?}",
                GEN1_INFO, info.gen
            )));
        }
        Ok(info)
    }

    async fn probe_gen2(&self, address: &str) -> Result<Gen2Info> {
        let info: Gen2Info = serde_json::from_value(self.get(address, GEN2_INFO).await?)?;
        if info.gen.is_some_and(|gen| gen < 2) {
            return Err(ConnectorError::InvalidPayload(format!(
                "{} reports generation {:?}",
                GEN2_INFO, info.gen
            )));
        }
        Ok(info)
    }

    async fn resolve_gen1(&self, device: DiscoveredDevice, info: Gen1Info) -> Result<StoreLocalDevice> {
        let channels = match self.get(&device.ip_address, GEN1_DESCRIPTION).await {
            Ok(body) => serde_json::from_value::<CitDescription>(body)?.channels(),
            Err(e) => {
                // The client fetches the description once it connects
                tracing::warn!("No description for {}: {}", device.identifier(), e);
                Vec::new()
            }
        };

        StoreLocalDevice {
            identifier: device.identifier(),
            generation: device.generation,
            ip_address: Some(device.ip_address),
            domain: device.domain,
            model: info.device_type,
            mac_address: Some(format_mac(&info.mac)),
            auth_enabled: info.auth,
            firmware_version: info.fw,
            channels,
        }
        .validated()
    }

    async fn resolve_gen2(&self, device: DiscoveredDevice, info: Gen2Info) -> Result<StoreLocalDevice> {
        let channels = self.gen2_channels(&device).await;

        StoreLocalDevice {
            identifier: device.identifier(),
            generation: device.generation,
            ip_address: Some(device.ip_address),
            domain: device.domain,
            model: info.model,
            mac_address: Some(format_mac(&info.mac)),
            auth_enabled: info.auth_en,
            firmware_version: info.ver,
            channels,
        }
        .validated()
    }

    /// Channels from the RPC configuration; empty while authentication is required
    async fn gen2_channels(&self, device: &DiscoveredDevice) -> Vec<ChannelDescription> {
        let config = match self.get(&device.ip_address, GEN2_CONFIG).await {
            Ok(config) => config,
            Err(ConnectorError::HttpStatus { status, .. }) if i64::from(status) == UNAUTHORIZED => {
                tracing::info!(
                    "{} requires authentication, channels follow once the session connects",
                    device.identifier()
                );
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!("No configuration for {}: {}", device.identifier(), e);
                return Vec::new();
            }
        };

        let status = match self.get(&device.ip_address, GEN2_STATUS).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::debug!("No status for {}: {}", device.identifier(), e);
                None
            }
        };
        components::describe(&config, status.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fixtures::FixtureTransport;
    use crate::queue::queue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct FixtureBrowser(Vec<MdnsResponse>);

    #[async_trait]
    impl ServiceBrowser for FixtureBrowser {
        async fn browse(&self, _window: Duration) -> Result<Vec<MdnsResponse>> {
            Ok(self.0.clone())
        }
    }

    struct FailingBrowser;

    #[async_trait]
    impl ServiceBrowser for FailingBrowser {
        async fn browse(&self, _window: Duration) -> Result<Vec<MdnsResponse>> {
            Err(ConnectorError::Mdns("no interface".into()))
        }
    }

    fn answer(name: &str, address: &str) -> MdnsResponse {
        MdnsResponse {
            address: address.into(),
            name: name.into(),
            domain: Some(format!("{}.local", name)),
            properties: BTreeMap::new(),
        }
    }

    fn gen2_info() -> serde_json::Value {
        json!({
            "id": "shellyplus1-a8032ab12345", "mac": "A8032AB12345", "model": "SNSW-001X16EU",
            "gen": 2, "ver": "1.0.8", "auth_en": true
        })
    }

    #[tokio::test]
    async fn test_gen2_with_auth_has_no_channels() {
        let transport = FixtureTransport::default()
            .with("10.0.0.5", GEN2_INFO, gen2_info())
            .with_status("10.0.0.5", GEN2_CONFIG, 401);
        let (tx, mut rx) = queue();
        let discovery = Discovery::new(
            DiscoveryConfig::default(),
            Arc::new(FixtureBrowser(vec![answer("shellyplus1-A8032AB12345", "10.0.0.5")])),
            Arc::new(transport),
        )
        .with_queue(tx);

        let devices = discovery.discover().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].generation, Generation::Gen2);
        assert!(devices[0].auth_enabled);
        assert!(devices[0].channels.is_empty());
        assert_eq!(devices[0].firmware_version.as_deref(), Some("1.0.8"));
        assert_eq!(discovery.state(), DiscoveryState::Resolved);

        assert!(matches!(rx.try_recv().unwrap(), Some(Message::StoreLocalDevice(_))));
    }

    #[tokio::test]
    async fn test_unresolvable_device_is_skipped() {
        let transport = FixtureTransport::default().with("10.0.0.5", GEN2_INFO, gen2_info());
        let discovery = Discovery::new(
            DiscoveryConfig::default(),
            Arc::new(FixtureBrowser(vec![
                answer("shellyplus1-A8032AB12345", "10.0.0.5"),
                answer("shelly1-98CDAC1F0011", "10.0.0.6"),
                answer("printer-01", "10.0.0.7"),
            ])),
            Arc::new(transport),
        );

        let devices = discovery.discover().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "a8032ab12345-shellyplus1");
    }

    #[tokio::test]
    async fn test_gen2_answer_on_gen1_endpoint_is_not_gen1() {
        let transport = FixtureTransport::default()
            .with("10.0.0.5", GEN1_INFO, json!({"type": "SNSW-001X16EU", "mac": "A8032AB12345", "gen": 2}))
            .with("10.0.0.5", GEN2_INFO, gen2_info());
        let discovery = Discovery::new(
            DiscoveryConfig::default(),
            Arc::new(FixtureBrowser(vec![answer("shellyplus1-A8032AB12345", "10.0.0.5")])),
            Arc::new(transport),
        );
        let devices = discovery.discover().await.unwrap();
        assert_eq!(devices[0].generation, Generation::Gen2);
    }

    #[tokio::test]
    async fn test_browse_failure_fails_the_pass() {
        let discovery = Discovery::new(
            DiscoveryConfig::default(),
            Arc::new(FailingBrowser),
            Arc::new(FixtureTransport::default()),
        );
        assert!(discovery.discover().await.is_err());
        assert_eq!(discovery.state(), DiscoveryState::Failed);
    }
}
