// SPDX-License-Identifier: AGPL-3.0-only

//! Echo round trip
//!
//! Negotiates the API version and echoes a word through the firmware.
//! Uses the first discovered card, or the emulated device when none exists.

use std::sync::Arc;
use std::time::Instant;

use etsoc_runtime::{DeviceManager, DeviceSession, EmulatedDevice, Result, SessionConfig};

const ROUNDS: u64 = 1000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("etsoc_runtime=info")
        .init();

    println!("🔁 ETSoC Echo Round Trip\n");

    let session = match DeviceManager::discover() {
        Ok(manager) => {
            println!("Found {} device(s)", manager.device_count());
            let transport = manager.open_transport()?;
            DeviceSession::open(Arc::new(transport), SessionConfig::default())?
        }
        Err(_) => {
            println!("ℹ️  No hardware, using emulated device");
            DeviceSession::open(Arc::new(EmulatedDevice::new()), SessionConfig::default())?
        }
    };

    let negotiated = session.negotiate()?;
    println!("✅ Device API {}", negotiated.device);
    println!("✅ Firmware hash {:016x}\n", session.fw_hash()?);

    let start = Instant::now();
    let echoed = session.echo(0xDEAD_BEEF)?;
    println!("📤 Sent 0xDEADBEEF, 📥 got {echoed:#X} in {:?}", start.elapsed());

    let start = Instant::now();
    for i in 0..ROUNDS {
        session.echo(i)?;
    }
    let per_call = start.elapsed() / u32::try_from(ROUNDS).unwrap_or(u32::MAX);
    println!("⏱️  {ROUNDS} sequential echoes: {per_call:?} per call");

    println!("\n✅ Echo test complete");
    Ok(())
}
