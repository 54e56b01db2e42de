//! Discovery end to end against recorded device answers.

mod common;

use common::{RecordedAnswers, RecordedDevices};
use shelly_connector::{
    queue, Applied, Consumer, DataType, DeviceRepository, Discovery, DiscoveryConfig,
    DiscoveryState, Generation, MemoryDeviceRepository, MemoryPropertyStore, Message,
    PropertyKey, PropertyStore, Value, STATE_PROPERTY,
};
use std::sync::Arc;

fn discovery(answers: &[(&str, &str)], devices: RecordedDevices) -> Discovery {
    Discovery::new(
        DiscoveryConfig::default(),
        Arc::new(RecordedAnswers::new(answers)),
        Arc::new(devices),
    )
}

#[tokio::test]
async fn test_discover_rgbw2() {
    let discovery = discovery(
        &[("shellyrgbw2-C45BBEE4C926", "10.10.0.239")],
        RecordedDevices::default().rgbw2(),
    );

    let devices = discovery.discover().await.unwrap();
    assert_eq!(devices.len(), 1);

    let device = &devices[0];
    assert_eq!(device.identifier, "c45bbee4c926-shellyrgbw2");
    assert_eq!(device.generation, Generation::Gen1);
    assert_eq!(device.ip_address.as_deref(), Some("10.10.0.239"));
    assert_eq!(device.domain.as_deref(), Some("shellyrgbw2-C45BBEE4C926.local"));
    assert_eq!(device.model, "SHRGBW2");
    assert_eq!(device.mac_address.as_deref(), Some("c4:5b:be:e4:c9:26"));
    assert!(!device.auth_enabled);

    let channels: Vec<_> = device.channels.iter().map(|c| c.identifier.as_str()).collect();
    assert_eq!(
        channels,
        vec!["1_light_0", "2_light_1", "3_light_2", "4_light_3", "5_device"]
    );

    let light_0 = &device.channels[0];
    assert_eq!(light_0.name.as_deref(), Some("light_0"));
    let output = light_0.property("1101_s_output").unwrap();
    assert!(output.settable);
    assert_eq!(output.data_type, DataType::Boolean);
    let power = light_0.property("4101_p_power").unwrap();
    assert!(!power.settable);
    assert_eq!(power.data_type, DataType::Float);
    assert_eq!(power.unit.as_deref(), Some("W"));
    // Overpower is linked to every light block
    assert!(device.channels[..4]
        .iter()
        .all(|channel| channel.property("6101_a_overpower").is_some()));
    assert!(device.channels[4].property("6101_a_overpower").is_none());
    assert_eq!(discovery.state(), DiscoveryState::Resolved);
}

#[tokio::test]
async fn test_discover_plus2pm() {
    let discovery = discovery(
        &[("shellyplus2pm-441793AD07E8", "10.10.0.37")],
        RecordedDevices::default().plus2pm(),
    );

    let devices = discovery.discover().await.unwrap();
    assert_eq!(devices.len(), 1);

    let device = &devices[0];
    assert_eq!(device.identifier, "441793ad07e8-shellyplus2pm");
    assert_eq!(device.generation, Generation::Gen2);
    assert_eq!(device.model, "SNSW-102P16EU");
    assert_eq!(device.mac_address.as_deref(), Some("44:17:93:ad:07:e8"));
    assert_eq!(device.firmware_version.as_deref(), Some("1.0.8"));
    assert!(!device.auth_enabled);

    let channels: Vec<_> = device.channels.iter().map(|c| c.identifier.as_str()).collect();
    assert_eq!(channels, vec!["input_0", "input_1", "switch_0", "switch_1"]);
    assert_eq!(device.channels[2].name.as_deref(), Some("Kitchen"));
    assert!(device.channels[2].property("output").unwrap().settable);
}

#[tokio::test]
async fn test_discovered_devices_reach_the_repository() {
    let (tx, mut rx) = queue();
    let discovery = discovery(
        &[
            ("shellyrgbw2-C45BBEE4C926", "10.10.0.239"),
            ("shellyplus2pm-441793AD07E8", "10.10.0.37"),
            ("shellyplus1-A8032AB12345", "10.10.0.99"),
        ],
        RecordedDevices::default().rgbw2().plus2pm(),
    )
    .with_queue(tx);

    let devices = discovery.discover().await.unwrap();
    assert_eq!(devices.len(), 2);

    let repository = Arc::new(MemoryDeviceRepository::new());
    let store = Arc::new(MemoryPropertyStore::new());
    let consumer = Consumer::new(repository.clone(), store.clone());

    let mut created = Vec::new();
    for message in rx.drain() {
        assert!(matches!(message, Message::StoreLocalDevice(_)));
        if let Applied::DeviceCreated(identifier) = consumer.consume(message) {
            created.push(identifier);
        }
    }
    created.sort();
    assert_eq!(
        created,
        vec!["441793ad07e8-shellyplus2pm", "c45bbee4c926-shellyrgbw2"]
    );

    let plus2pm = repository.device("441793ad07e8-shellyplus2pm").unwrap();
    assert_eq!(plus2pm.generation, Some(Generation::Gen2));
    assert_eq!(plus2pm.channels.len(), 4);

    // Every created device gets a connection state property
    let state = store
        .get(&PropertyKey::device("c45bbee4c926-shellyrgbw2", STATE_PROPERTY))
        .unwrap();
    assert_eq!(state.actual_value, Some(Value::from("unknown")));

    // A second pass updates in place
    let again = discovery.discover().await.unwrap();
    assert_eq!(again.len(), 2);
    for message in rx.drain() {
        assert_eq!(consumer.consume(message), Applied::Updated);
    }
    assert_eq!(repository.devices().len(), 2);
}
