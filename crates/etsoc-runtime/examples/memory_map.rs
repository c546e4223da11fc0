// SPDX-License-Identifier: AGPL-3.0-only

//! Device memory map
//!
//! Prints the region layout of an emulated card, then walks a buffer through
//! sharing, aliasing and release.

use std::sync::Arc;

use etsoc_runtime::{DeviceSession, EmulatedDevice, MemRegion, Result, SessionConfig};

fn print_region(region: &MemRegion) {
    println!(
        "  {:<12} {:#014x}..{:#014x}  {:>6} MiB  ({} allocation(s))",
        region.name(),
        region.base(),
        region.base() + region.size(),
        region.size() >> 20,
        region.allocation_count()
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("etsoc_runtime=trace")
        .init();

    println!("🗺️  ETSoC Memory Map\n");

    let session = DeviceSession::open(Arc::new(EmulatedDevice::new()), SessionConfig::default())?;
    let memory = session.memory();

    let code = memory.malloc_code(64 << 10)?;
    let weights = memory.malloc_constant(8 << 20)?;
    let staging = memory.malloc_host(1 << 20)?;

    print_region(memory.device_code());
    print_region(memory.device_dram());
    print_region(memory.host_staging());

    println!("\n📦 Buffers");
    for buf in [&code, &weights, &staging] {
        println!("  {buf:?}");
    }

    let alias = &weights + 4096;
    println!(
        "\n🔗 Alias at {:#x} shares allocation: {}",
        alias.device_address(),
        alias.shares_allocation(&weights)
    );
    println!("   ref count {}", weights.ref_count());

    drop(weights);
    println!(
        "   original dropped, allocation still live: {}",
        memory.device_dram().is_ptr_alloced(alias.allocation_ptr())
    );

    let freed = alias.release()?;
    println!("   alias released, allocation freed: {freed}");

    memory.check_accounting()?;
    println!("\n✅ Accounting clean");
    Ok(())
}
