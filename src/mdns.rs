//! mDNS browsing for Shelly devices.
//!
//! Every Shelly generation announces an `_http._tcp.local.` service whose
//! instance name is `<type>-<id>` (for example `shellyrgbw2-C45BBEE4C926`).
//! The resolved record supplies the IPv4 address and host name; TXT fields
//! are kept as key/value metadata.

use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Service type browsed for (trailing dot is required by mdns-sd)
pub const SERVICE_TYPE: &str = "_http._tcp.local.";

const INSTANCE_PREFIX: &str = "shelly";

/// One answer collected during the listening window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsResponse {
    pub address: String,
    /// Service instance name, e.g. `shellyrgbw2-C45BBEE4C926`
    pub name: String,
    /// Host name without the trailing dot, e.g. `shellyrgbw2-C45BBEE4C926.local`
    pub domain: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl MdnsResponse {
    /// Split the instance name into device type and id
    pub fn instance(&self) -> Option<(String, String)> {
        parse_instance(&self.name)
    }
}

/// Multicast service query
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Query and collect answers for `window`
    async fn browse(&self, window: Duration) -> Result<Vec<MdnsResponse>>;
}

/// [`ServiceBrowser`] backed by an `mdns-sd` daemon
pub struct MdnsBrowser {
    daemon: Arc<ServiceDaemon>,
}

impl MdnsBrowser {
    /// Create a browser with its own daemon
    ///
    /// The daemon spawns a background thread; reuse the browser across passes.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| ConnectorError::Mdns(e.to_string()))?;
        Ok(Self {
            daemon: Arc::new(daemon),
        })
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn browse(&self, window: Duration) -> Result<Vec<MdnsResponse>> {
        tracing::debug!("Browsing {} for {}ms", SERVICE_TYPE, window.as_millis());

        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| ConnectorError::Mdns(e.to_string()))?;

        let mut found: HashMap<String, MdnsResponse> = HashMap::new();
        let start = tokio::time::Instant::now();
        while start.elapsed() < window {
            let remaining = window.saturating_sub(start.elapsed());
            match timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(response) = parse_resolved(&info) {
                        tracing::debug!("mDNS answer {} at {}", response.name, response.address);
                        found.insert(response.name.clone(), response);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!("mDNS receiver closed: {:?}", e);
                    break;
                }
                // Listening window elapsed
                Err(_) => break,
            }
        }

        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            tracing::warn!("Failed to stop mDNS browse: {:?}", e);
        }

        let mut responses: Vec<_> = found.into_values().collect();
        responses.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!("mDNS listening window closed, {} Shelly answer(s)", responses.len());
        Ok(responses)
    }
}

fn parse_resolved(info: &ResolvedService) -> Option<MdnsResponse> {
    let name = info
        .fullname
        .split("._")
        .next()
        .unwrap_or_default()
        .to_string();
    parse_instance(&name)?;

    let address = info.addresses.iter().find_map(|addr| match addr {
        ScopedIp::V4(v4) => Some(v4.addr().to_string()),
        _ => None,
    })?;

    let domain = Some(info.host.trim_end_matches('.').to_string()).filter(|d| !d.is_empty());

    let properties = info
        .txt_properties
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    Some(MdnsResponse {
        address,
        name,
        domain,
        properties,
    })
}

/// `shellyplus2pm-441793AD07E8` → (`shellyplus2pm`, `441793AD07E8`)
pub fn parse_instance(name: &str) -> Option<(String, String)> {
    let (device_type, id) = name.rsplit_once('-')?;
    let prefixed = device_type
        .get(..INSTANCE_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(INSTANCE_PREFIX));
    if !prefixed || id.is_empty() {
        return None;
    }
    Some((device_type.to_string(), id.to_string()))
}
