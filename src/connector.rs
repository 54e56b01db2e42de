use crate::client::ClientRegistry;
use crate::config::ConnectorConfig;
use crate::consumers::{Applied, Consumer};
use crate::discovery::Discovery;
use crate::error::{ConnectorError, Result};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::mdns::MdnsBrowser;
use crate::messages::{Message, StoreLocalDevice};
use crate::queue::{queue, QueueReceiver, QueueSender};
use crate::store::{DeviceRepository, PropertyStore};
use crate::writers::{create_writer, WriteDispatcher, Writer};
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Runs the device-communication core
///
/// `execute` connects every known device, starts the property writer and
/// applies queued messages until `terminate` is called. Devices created by
/// discovery are connected as soon as their record is stored.
///
/// # Example
///
/// ```no_run
/// use shelly_connector::{Connector, ConnectorConfig, MemoryDeviceRepository, MemoryPropertyStore};
/// use std::sync::Arc;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let connector = Arc::new(Connector::new(
///         ConnectorConfig::default(),
///         Arc::new(MemoryDeviceRepository::new()),
///         Arc::new(MemoryPropertyStore::new()),
///     ));
///
///     connector.discover().await?;
///
///     let runner = connector.clone();
///     let handle = tokio::spawn(async move { runner.execute().await });
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     connector.terminate();
///     handle.await??;
///     Ok(())
/// }
/// ```
pub struct Connector {
    config: ConnectorConfig,
    repository: Arc<dyn DeviceRepository>,
    clients: ClientRegistry,
    consumer: Consumer,
    writer: Box<dyn Writer>,
    queue_tx: QueueSender,
    queue_rx: Mutex<QueueReceiver>,
    discovery: SyncMutex<Option<Arc<Discovery>>>,
    stop_tx: watch::Sender<bool>,
}

impl Connector {
    /// Create a connector with the HTTP, WebSocket and mDNS transports
    pub fn new(
        config: ConnectorConfig,
        repository: Arc<dyn DeviceRepository>,
        store: Arc<dyn PropertyStore>,
    ) -> Self {
        let (tx, rx) = queue();
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(config.gen1.http_timeout()));
        let clients = ClientRegistry::new(&config, transport, tx.clone());
        Self::with_clients(config, repository, store, clients, (tx, rx))
    }

    /// Create a connector around existing clients and the queue they feed
    pub fn with_clients(
        config: ConnectorConfig,
        repository: Arc<dyn DeviceRepository>,
        store: Arc<dyn PropertyStore>,
        clients: ClientRegistry,
        (queue_tx, queue_rx): (QueueSender, QueueReceiver),
    ) -> Self {
        let dispatcher = Arc::new(WriteDispatcher::new(
            repository.clone(),
            store.clone(),
            clients.clone(),
        ));
        let writer = create_writer(&config.writer, dispatcher);
        let (stop_tx, _) = watch::channel(false);

        Self {
            consumer: Consumer::new(repository.clone(), store),
            config,
            repository,
            clients,
            writer,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            discovery: SyncMutex::new(None),
            stop_tx,
        }
    }

    /// Use a preconfigured discovery coordinator
    pub fn with_discovery(self, discovery: Discovery) -> Self {
        *self.discovery.lock() = Some(Arc::new(discovery));
        self
    }

    /// Producer handle of the inbound queue
    pub fn sender(&self) -> QueueSender {
        self.queue_tx.clone()
    }

    fn discovery(&self) -> Result<Arc<Discovery>> {
        let mut discovery = self.discovery.lock();
        if let Some(discovery) = discovery.as_ref() {
            return Ok(discovery.clone());
        }
        let transport = Arc::new(ReqwestTransport::new(self.config.discovery.probe_timeout()));
        let created = Arc::new(
            Discovery::new(
                self.config.discovery.clone(),
                Arc::new(MdnsBrowser::new()?),
                transport,
            )
            .with_queue(self.queue_tx.clone())
            .with_credentials(self.config.credentials.clone()),
        );
        *discovery = Some(created.clone());
        Ok(created)
    }

    /// Run one discovery pass; resolved devices are queued for storage
    pub async fn discover(&self) -> Result<Vec<StoreLocalDevice>> {
        let discovery = self.discovery()?;
        discovery.discover().await
    }

    /// Connect one stored device through the client of its generation
    pub async fn connect_device(&self, identifier: &str) -> Result<()> {
        let device = self
            .repository
            .device(identifier)
            .ok_or_else(|| ConnectorError::UnknownDevice(identifier.to_string()))?;
        let client = self.clients.for_device(&device)?;
        client.connect(&device).await
    }

    /// Apply one message, connecting devices it creates
    async fn apply(&self, message: Message) {
        if let Applied::DeviceCreated(identifier) = self.consumer.consume(message) {
            if let Err(e) = self.connect_device(&identifier).await {
                tracing::warn!("Failed to connect new device {}: {}", identifier, e);
            }
        }
    }

    /// Apply everything currently queued without waiting; returns the count
    pub async fn process_queued(&self) -> usize {
        let messages = self.queue_rx.lock().await.drain();
        let count = messages.len();
        for message in messages {
            self.apply(message).await;
        }
        count
    }

    /// Run until [`terminate`](Self::terminate) is called
    pub async fn execute(&self) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();

        let devices = self.repository.devices();
        tracing::info!("Connector starting with {} known device(s)", devices.len());
        for device in &devices {
            match self.clients.for_device(device) {
                Ok(client) => {
                    if let Err(e) = client.connect(device).await {
                        tracing::warn!("Failed to connect device {}: {}", device.identifier, e);
                    }
                }
                Err(e) => tracing::error!("Skipping device {}: {}", device.identifier, e),
            }
        }

        self.writer.start();

        let mut queue_rx = self.queue_rx.lock().await;
        let mut stopped = *stop_rx.borrow();
        while !stopped {
            tokio::select! {
                changed = stop_rx.changed() => {
                    stopped = changed.is_err() || *stop_rx.borrow();
                }
                message = queue_rx.recv() => match message {
                    Ok(message) => self.apply(message).await,
                    Err(e) => {
                        tracing::error!("Inbound queue closed: {}", e);
                        stopped = true;
                    }
                }
            }
        }
        tracing::info!("Connector stopped");

        self.writer.stop();
        for client in self.clients.all() {
            if let Err(e) = client.disconnect().await {
                tracing::warn!("Failed to disconnect {} client: {}", client.generation(), e);
            }
        }

        // Apply the final connection states
        for message in queue_rx.drain() {
            self.consumer.consume(message);
        }
        self.stop_tx.send_replace(false);
        Ok(())
    }

    /// Ask a running [`execute`](Self::execute) to stop
    pub fn terminate(&self) {
        tracing::info!("Connector terminate requested");
        self.stop_tx.send_replace(true);
    }
}
