// SPDX-License-Identifier: AGPL-3.0-only

//! Device session integration tests
//!
//! Version gate, negotiation caching and end-to-end command flow on the
//! emulated device.

use std::sync::Arc;
use std::time::Duration;

use etsoc_runtime::api::mgmt::{CurrentTemperature, DmCmd, FirmwareRevisions};
use etsoc_runtime::api::ops::{DmaListRsp, DmaStatus, MsgId};
use etsoc_runtime::api::{ApiVersion, HOST_API_VERSION};
use etsoc_runtime::{DeviceSession, EmulatedConfig, EmulatedDevice, EtError, SessionConfig};

fn open(config: EmulatedConfig) -> (Arc<EmulatedDevice>, DeviceSession) {
    let device = Arc::new(EmulatedDevice::with_config(config));
    let session = DeviceSession::open(
        Arc::clone(&device),
        SessionConfig::default().with_request_timeout(Duration::from_secs(5)),
    )
    .expect("session should open on the emulated device");
    (device, session)
}

#[test]
fn negotiation_is_queried_once() {
    let (dev, session) = open(EmulatedConfig::default());

    for _ in 0..5 {
        let negotiated = session.negotiate().unwrap();
        assert_eq!(negotiated.device, HOST_API_VERSION);
    }

    assert_eq!(dev.commands_received(MsgId::CheckApiCompatibilityCmd.as_u16()), 1);
}

#[test]
fn version_gate() {
    let host = HOST_API_VERSION;
    let cases = [
        (ApiVersion::new(host.major, host.minor, host.patch + 1), true),
        (ApiVersion::new(host.major, 0, 0), true),
        (ApiVersion::new(host.major, host.minor + 1, 0), false),
        (ApiVersion::new(host.major + 1, host.minor, 0), false),
    ];

    for (device_version, supported) in cases {
        let (_dev, session) = open(EmulatedConfig::default().with_api_version(device_version));
        let result = session.negotiate();
        assert_eq!(result.is_ok(), supported, "device {device_version}");
        assert_eq!(session.is_negotiated(), supported);
        if !supported {
            assert!(matches!(result, Err(EtError::IncompatibleDevice { .. })));
        }
    }
}

#[test]
fn refused_compatibility_fails_closed() {
    let (dev, session) = open(EmulatedConfig::default().rejecting_compatibility());

    assert!(session.negotiate().is_err());
    assert!(session.echo(1).is_err());
    assert_eq!(dev.commands_received(MsgId::EchoCmd.as_u16()), 0);
}

#[test]
fn memory_is_usable_without_negotiation() {
    let (_dev, session) = open(EmulatedConfig::default());

    let buf = session.memory().malloc_placeholder(4096).unwrap();
    assert!(session.memory().device_dram().is_ptr_alloced(buf.allocation_ptr()));
}

#[test]
fn write_then_read_back() -> anyhow::Result<()> {
    let (dev, session) = open(EmulatedConfig::default());
    session.negotiate()?;

    let staging = session.memory().malloc_host(1 << 16)?;
    let dram = session.memory().malloc_placeholder(1 << 16)?;

    let write = session.dma_write(&staging, &dram, 1 << 16)?;
    let read = session.dma_read(&dram, &staging, 1 << 16)?;

    for rsp in [write.wait(), read.wait()] {
        let rsp = rsp.into_result()?;
        assert_eq!(rsp.decode::<DmaListRsp>()?.dma_status(), DmaStatus::Complete);
    }
    assert_eq!(dev.commands_received(MsgId::DmaWriteListCmd.as_u16()), 1);
    assert_eq!(dev.commands_received(MsgId::DmaReadListCmd.as_u16()), 1);
    assert_eq!(dram.ref_count(), 1);
    Ok(())
}

#[test]
fn management_queries() {
    let (_dev, session) = open(EmulatedConfig::default());
    session.negotiate().unwrap();

    let revisions = session
        .service_request(DmCmd::GET_MODULE_FIRMWARE_REVISIONS, &[])
        .unwrap();
    FirmwareRevisions::decode(&revisions.payload).unwrap();

    let temperature = session
        .service_request(DmCmd::GET_MODULE_CURRENT_TEMPERATURE, &[])
        .unwrap();
    CurrentTemperature::decode(&temperature.payload).unwrap();
    assert!(temperature.device_latency_usec > 0);
}

#[test]
fn fw_hash_is_cached_per_session() {
    let config = EmulatedConfig::default().with_fw_git_hash(0xabcd_ef01_2345_6789);
    let (dev, first) = open(config);
    let second = DeviceSession::open(Arc::clone(&dev), SessionConfig::default()).unwrap();

    assert_eq!(first.fw_hash().unwrap(), 0xabcd_ef01_2345_6789);
    assert_eq!(first.fw_hash().unwrap(), 0xabcd_ef01_2345_6789);
    assert_eq!(second.fw_hash().unwrap(), 0xabcd_ef01_2345_6789);

    assert_eq!(dev.commands_received(MsgId::FwVersionCmd.as_u16()), 2);
}
