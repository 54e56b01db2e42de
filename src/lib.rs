//! Device communication core for Shelly smart-home devices
//!
//! This library discovers Shelly devices on the local network, keeps a live
//! connection to each of them and mirrors their channels and properties into
//! a device repository and a property store. It supports:
//!
//! - Discovery via mDNS with HTTP identification probes
//! - Generation 1 devices over CoIoT multicast and the HTTP API
//! - Generation 2 devices over WebSocket JSON-RPC with digest authentication
//! - A single inbound message queue applied by one consumer
//! - Periodic and event driven property writers with debounce
//!
//! # Quick Start
//!
//! ```no_run
//! use shelly_connector::{Discovery, DiscoveryConfig, MdnsBrowser, ReqwestTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Discovery::new(
//!         DiscoveryConfig::default(),
//!         Arc::new(MdnsBrowser::new()?),
//!         Arc::new(ReqwestTransport::new(Duration::from_secs(5))),
//!     );
//!
//!     for device in discovery.discover().await? {
//!         println!(
//!             "Found {} ({}) at {:?} with {} channel(s)",
//!             device.identifier,
//!             device.model,
//!             device.ip_address,
//!             device.channels.len()
//!         );
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Running the connector
//!
//! [`Connector`] wires discovery, both protocol clients, the consumer and the
//! configured writer together:
//!
//! ```no_run
//! use shelly_connector::{
//!     Connector, ConnectorConfig, MemoryDeviceRepository, MemoryPropertyStore, Pending,
//!     PropertyKey, PropertyStore, Value,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryPropertyStore::new());
//!     let connector = Arc::new(Connector::new(
//!         ConnectorConfig::load("connector.json")?,
//!         Arc::new(MemoryDeviceRepository::new()),
//!         store.clone(),
//!     ));
//!     connector.discover().await?;
//!
//!     let runner = connector.clone();
//!     let handle = tokio::spawn(async move { runner.execute().await });
//!
//!     // Ask the writer to switch a relay on
//!     let key = PropertyKey::channel("441793ad07e8-shellyplus2pm", "switch_0", "output");
//!     store.set_expected(&key, Some(Value::Bool(true)), Some(Pending::Requested));
//!
//!     tokio::signal::ctrl_c().await?;
//!     connector.terminate();
//!     handle.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Discovery**: mDNS browse plus `/shelly` or `Shelly.GetDeviceInfo` probes
//! - **Clients**: one [`ProtocolClient`] per generation, selected by [`ClientRegistry`]
//! - **Connection**: low-level WebSocket RPC correlation and digest retry
//! - **CoIoT**: CoAP status datagrams and `/cit/d` descriptions
//! - **Queue / Consumer**: canonical messages applied to the repository and store
//! - **Writers**: propagate expected values back to devices
//! - **Types**: domain types and data structures

mod client;
pub mod coiot;
pub mod components;
mod config;
mod connection;
mod connector;
mod consumers;
mod discovery;
mod error;
pub mod gen1;
mod gen2;
mod http;
mod mdns;
mod messages;
mod protocol;
mod queue;
mod store;
mod types;
mod writers;

// Public exports
pub use client::{ClientRegistry, ProtocolClient};
pub use coiot::CoapReport;
pub use config::{
    ConnectorConfig, DiscoveryConfig, Gen1Config, Gen2Config, WriterConfig, WriterMode,
    COIOT_GROUP, COIOT_PORT,
};
pub use connection::{Connection, ConnectionEvent};
pub use connector::Connector;
pub use consumers::{Applied, Consumer};
pub use discovery::{Discovery, DiscoveryState};
pub use error::{ConnectorError, ErrorKind, Result};
pub use gen1::Gen1Client;
pub use gen2::{Gen2Client, SessionState};
pub use http::{HttpTransport, ReqwestTransport};
pub use mdns::{parse_instance, MdnsBrowser, MdnsResponse, ServiceBrowser, SERVICE_TYPE};
pub use messages::{
    DeviceAttribute, DeviceAttributeMessage, DeviceStateMessage, DeviceStatus, Message,
    StoreChannels, StoreLocalDevice,
};
pub use protocol::{
    digest_response, DigestAuth, DigestChallenge, Notification, RpcError, WsFrame, WsResponse,
    WsSession, UNAUTHORIZED,
};
pub use queue::{queue, QueueReceiver, QueueSender};
pub use store::{
    DeviceRecord, DeviceRepository, MemoryDeviceRepository, MemoryPropertyStore, Pending,
    PropertyKey, PropertyStateRecord, PropertyStore, StoreEvent, Upserted, STATE_PROPERTY,
};
pub use types::{
    ChannelDescription, ChannelState, ConnectionState, Credentials, DataType, DeviceId,
    DiscoveredDevice, Format, Generation, PropertyDescription, PropertyState, Value,
};
pub use writers::{create_writer, EventWriter, PeriodicWriter, WriteDispatcher, Writer};
