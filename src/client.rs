use crate::config::ConnectorConfig;
use crate::error::Result;
use crate::gen1::Gen1Client;
use crate::gen2::Gen2Client;
use crate::http::HttpTransport;
use crate::queue::QueueSender;
use crate::store::DeviceRecord;
use crate::types::{Generation, Value};
use async_trait::async_trait;
use std::sync::Arc;

/// Protocol client for one device generation
///
/// Clients push everything they learn (readings, connection state,
/// attributes) into the inbound queue; the only synchronous result they
/// return is the outcome of a write.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Generation this client speaks
    fn generation(&self) -> Generation;

    /// Start the session or polling for a device
    ///
    /// Connecting an already connected device restarts its session.
    async fn connect(&self, device: &DeviceRecord) -> Result<()>;

    /// Stop every session and background task of this client
    async fn disconnect(&self) -> Result<()>;

    /// Send a desired property value to the device
    ///
    /// # Example
    ///
    /// ```no_run
    /// use shelly_connector::{
    ///     ConnectorConfig, DeviceRecord, Gen2Client, Generation, ProtocolClient, Value, queue,
    /// };
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let (tx, _rx) = queue();
    ///     let client = Gen2Client::new(ConnectorConfig::default().gen2, tx);
    ///
    ///     let mut device = DeviceRecord::new("441793ad07e8-shellyplus2pm", Some(Generation::Gen2));
    ///     device.ip_address = Some("192.168.1.40".into());
    ///     client.connect(&device).await?;
    ///     client.write_property(&device, "switch_0", "output", &Value::Bool(true)).await?;
    ///     Ok(())
    /// }
    /// ```
    async fn write_property(
        &self,
        device: &DeviceRecord,
        channel: &str,
        property: &str,
        value: &Value,
    ) -> Result<()>;
}

/// Picks the client matching a device's generation
#[derive(Clone)]
pub struct ClientRegistry {
    gen1: Arc<dyn ProtocolClient>,
    gen2: Arc<dyn ProtocolClient>,
}

impl ClientRegistry {
    /// Build both clients from the connector configuration
    pub fn new(config: &ConnectorConfig, transport: Arc<dyn HttpTransport>, queue: QueueSender) -> Self {
        let gen1 = Gen1Client::new(config.gen1.clone(), transport, queue.clone())
            .with_credentials(config.credentials.clone());
        let gen2 = Gen2Client::new(config.gen2.clone(), queue).with_credentials(config.credentials.clone());
        Self::with_clients(Arc::new(gen1), Arc::new(gen2))
    }

    /// Use custom clients
    pub fn with_clients(gen1: Arc<dyn ProtocolClient>, gen2: Arc<dyn ProtocolClient>) -> Self {
        Self { gen1, gen2 }
    }

    /// Client for a device
    ///
    /// Fails with a configuration error when the record has no generation.
    pub fn for_device(&self, device: &DeviceRecord) -> Result<Arc<dyn ProtocolClient>> {
        Ok(self.for_generation(device.generation()?))
    }

    pub fn for_generation(&self, generation: Generation) -> Arc<dyn ProtocolClient> {
        match generation {
            Generation::Gen1 => self.gen1.clone(),
            Generation::Gen2 => self.gen2.clone(),
        }
    }

    /// Both clients, generation 1 first
    pub fn all(&self) -> [Arc<dyn ProtocolClient>; 2] {
        [self.gen1.clone(), self.gen2.clone()]
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockClient;
    use super::*;
    use crate::error::ConnectorError;

    #[test]
    fn test_registry_selects_by_generation() {
        let registry = ClientRegistry::with_clients(
            Arc::new(MockClient::new(Generation::Gen1)),
            Arc::new(MockClient::new(Generation::Gen2)),
        );

        let device = DeviceRecord::new("dev", Some(Generation::Gen2));
        assert_eq!(registry.for_device(&device).unwrap().generation(), Generation::Gen2);

        let device = DeviceRecord::new("dev", None);
        assert!(matches!(
            registry.for_device(&device),
            Err(ConnectorError::Configuration(_))
        ));
    }
}
