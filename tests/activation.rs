//! Device lifecycle: open, activate, deactivate, close.

mod common;

use common::*;

#[tokio::test]
async fn test_plain_activation_reads_firmware() {
    let mut device = open_plain(SimulatedSensor::new()).await;
    device.activate().await.unwrap();

    assert!(device.context().active);
    assert_eq!(device.firmware_version(), Some(FIRMWARE_VERSION_SUPPORTED));
    assert_eq!(device.tls_phase(), None);
    assert_eq!(
        device.transport().opcodes(),
        vec![Opcode::Nop, Opcode::EnableChip, Opcode::Nop, Opcode::FirmwareVersion]
    );
    assert!(!device.sequencer().is_running());
}

#[tokio::test]
async fn test_firmware_mismatch_fails_and_resets_context() {
    let sensor = SimulatedSensor::new().with_firmware("GF_ST411SEC_APP_12117");
    let mut device = open_5110(sensor).await;

    let err = device.activate().await.unwrap_err();
    match err {
        Error::UnsupportedFirmware { found, expected } => {
            assert_eq!(found, "GF_ST411SEC_APP_12117");
            assert_eq!(expected, FIRMWARE_VERSION_SUPPORTED);
        }
        other => panic!("expected UnsupportedFirmware, got {other:?}"),
    }

    assert!(!device.context().active);
    assert!(device.context().fw_version.is_none());
    assert!(device.context().last_read.is_none());
    // No TLS traffic once the firmware is rejected.
    assert!(!device.transport().opcodes().contains(&Opcode::RequestTlsConnection));
    assert_eq!(device.tls_phase(), None);
}

#[tokio::test]
async fn test_5110_activation_establishes_tls() {
    let mut device = open_5110(SimulatedSensor::new()).await;
    device.activate().await.unwrap();

    assert_eq!(device.tls_phase(), Some(TlsPhase::Established));
    let sensor = device.transport();
    assert_eq!(
        sensor.opcodes(),
        vec![
            Opcode::Nop,
            Opcode::EnableChip,
            Opcode::Nop,
            Opcode::FirmwareVersion,
            Opcode::RequestTlsConnection,
            Opcode::PresetPskWriteR,
            Opcode::PresetPskReadR,
            Opcode::TlsSuccessfullyEstablished,
        ]
    );
    assert_eq!(sensor.stored_psk.as_deref(), Some([0u8; 32].as_slice()));
    assert_eq!(sensor.tls_records().len(), 2);
    assert_eq!(sensor.tls_records()[1].as_ref(), CLIENT_FINISHED);
}

#[tokio::test]
async fn test_encrypted_capture_is_decrypted() {
    let mut device = open_5110(SimulatedSensor::new()).await;
    device.activate().await.unwrap();

    let image = device.capture_image().await.unwrap();
    assert_eq!(image.as_ref(), device.transport().image.as_slice());
}

#[tokio::test]
async fn test_plain_capture_returns_raw_image() {
    let mut device = open_plain(SimulatedSensor::new()).await;
    assert_eq!(device.capture_image().await.unwrap_err().kind(), ErrorKind::ProtocolStateError);

    device.activate().await.unwrap();
    let image = device.capture_image().await.unwrap();
    assert_eq!(image.len(), 100);
    assert_eq!(device.context().last_read.as_ref(), Some(&image));
}

#[tokio::test]
async fn test_plain_capture_uses_image_endpoint() {
    let variant = PlainSensor {
        image_endpoint: Some(0x83),
        ..plain_sensor()
    };
    let mut device = GoodixDevice::new(SimulatedSensor::new(), variant, &DeviceConfig::default()).unwrap();
    device.open().await.unwrap();
    device.activate().await.unwrap();

    let before = device.transport().reads_from.len();
    device.capture_image().await.unwrap();
    let reads = &device.transport().reads_from[before..];
    assert_eq!(reads[0], 0x81);
    assert!(reads[1..].iter().all(|&ep| ep == 0x83));
}

#[tokio::test]
async fn test_tls_disabled_by_config() {
    let mut device = GoodixDevice::new(SimulatedSensor::new(), Goodix5110, &config_without_tls()).unwrap();
    device.open().await.unwrap();
    device.activate().await.unwrap();

    assert_eq!(device.tls_phase(), None);
    assert!(!device.transport().opcodes().contains(&Opcode::RequestTlsConnection));
}

#[tokio::test]
async fn test_tls_without_engine_is_a_config_error() {
    let mut device = GoodixDevice::new(SimulatedSensor::new(), Goodix5110, &DeviceConfig::default()).unwrap();
    device.open().await.unwrap();

    let err = device.activate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
    assert!(!device.context().active);
}

#[tokio::test]
async fn test_lifecycle_order_is_enforced() {
    let mut device = GoodixDevice::new(SimulatedSensor::new(), plain_sensor(), &DeviceConfig::default()).unwrap();

    assert_eq!(device.activate().await.unwrap_err().kind(), ErrorKind::ProtocolStateError);
    assert_eq!(device.close().await.unwrap_err().kind(), ErrorKind::ProtocolStateError);

    device.open().await.unwrap();
    assert!(device.open().await.is_err());

    device.activate().await.unwrap();
    assert_eq!(device.activate().await.unwrap_err().kind(), ErrorKind::ProtocolStateError);
}

#[tokio::test]
async fn test_change_state_requires_activation() {
    let mut device = open_plain(SimulatedSensor::new()).await;

    let err = device.change_state(ImageDeviceState::AwaitFingerOn).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolStateError);
    device.change_state(ImageDeviceState::Inactive).unwrap();

    device.activate().await.unwrap();
    device.change_state(ImageDeviceState::AwaitFingerOn).unwrap();
    assert_eq!(device.context().state, ImageDeviceState::AwaitFingerOn);

    device.deactivate().await.unwrap();
    assert_eq!(device.context().state, ImageDeviceState::Inactive);
    assert!(!device.context().active);
}

#[tokio::test]
async fn test_close_deactivates_and_drops_tunnel() {
    let mut device = open_5110(SimulatedSensor::new()).await;
    device.activate().await.unwrap();
    device.set_background(bytes::Bytes::from_static(b"frame"));

    device.close().await.unwrap();
    assert!(!device.context().active);
    assert_eq!(device.tls_phase(), None);
    assert!(device.background().is_none());
    assert!(device.context().fw_version.is_none());

    // Re-open and re-activate from scratch with a fresh engine.
    device.open().await.unwrap();
    device.activate().await.unwrap();
    assert_eq!(device.tls_phase(), Some(TlsPhase::Established));
}

#[tokio::test]
async fn test_deactivate_when_inactive_is_a_no_op() {
    let mut device = open_plain(SimulatedSensor::new()).await;
    device.deactivate().await.unwrap();
    assert!(device.transport().writes.is_empty());
}

#[tokio::test]
async fn test_open_claims_and_close_releases_interface() {
    let mut device = GoodixDevice::new(SimulatedSensor::new(), plain_sensor(), &DeviceConfig::default()).unwrap();
    assert!(!device.transport().claimed);

    device.open().await.unwrap();
    assert!(device.transport().claimed);
    device.activate().await.unwrap();

    device.close().await.unwrap();
    assert!(!device.transport().claimed);

    device.open().await.unwrap();
    assert!(device.transport().claimed);
    assert_eq!(device.transport().claims, 2);
}
