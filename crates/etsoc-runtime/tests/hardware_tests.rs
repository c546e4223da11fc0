// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware tests over the kernel device nodes
//!
//! Skipped unless an ETSoC-1 card is present.

use std::sync::Arc;
use std::thread;

use etsoc_runtime::api::ops::{EchoCmd, EchoRsp};
use etsoc_runtime::{
    Command, DeviceManager, DeviceQuery, DeviceSession, DeviceTransport, Dispatcher,
    DispatcherConfig, NodeTransport, SessionConfig, VirtualQueue,
};

fn open_transport() -> Option<Arc<NodeTransport>> {
    let Ok(manager) = DeviceManager::discover() else {
        println!("ℹ️  Skipping test (no hardware)");
        return None;
    };
    let transport = manager
        .open_transport()
        .expect("Failed to open device nodes");
    Some(Arc::new(transport))
}

fn open_first() -> Option<DeviceSession> {
    let transport = open_transport()?;
    let session =
        DeviceSession::open(transport, SessionConfig::default()).expect("Failed to open session");
    Some(session)
}

#[test]
#[ignore] // Requires ETSoC-1 hardware
fn test_hardware_negotiation() {
    let Some(session) = open_first() else { return };

    let negotiated = session.negotiate().expect("Negotiation failed");
    println!("✅ Device API {}", negotiated.device);
    println!("✅ Firmware hash {:016x}", session.fw_hash().expect("FW query failed"));
}

#[test]
#[ignore] // Requires ETSoC-1 hardware
fn test_hardware_echo() {
    let Some(session) = open_first() else { return };

    session.negotiate().expect("Negotiation failed");
    assert_eq!(session.echo(0xDEAD_BEEF).expect("Echo failed"), 0xDEAD_BEEF);
}

#[test]
#[ignore] // Requires ETSoC-1 hardware
fn test_hardware_queues_keep_their_own_replies() {
    let Some(transport) = open_transport() else { return };
    if transport.virtual_queues_count(0).expect("device 0") < 2 {
        println!("ℹ️  Skipping test (single submission queue)");
        return;
    }
    let session = DeviceSession::open(transport.clone(), SessionConfig::default())
        .expect("Failed to open session");
    session.negotiate().expect("Negotiation failed");

    let shared: Arc<dyn DeviceTransport> = transport;
    let workers: Vec<_> = (0..2usize)
        .map(|queue| {
            let dispatcher = Dispatcher::start(
                shared.clone(),
                0,
                VirtualQueue::Ops(queue),
                DispatcherConfig::default(),
            )
            .expect("Failed to start dispatcher");
            thread::spawn(move || {
                // Both queues use the same tags on purpose.
                for round in 0..200u64 {
                    let word = ((queue as u64) << 32) | round;
                    let cmd = Command::ops(&EchoCmd { payload: word })
                        .expect("echo encodes")
                        .with_tag(1);
                    let rsp = dispatcher.submit(cmd).expect("submit").wait();
                    assert!(rsp.is_ok(), "queue {queue}: {:?}", rsp.error);
                    assert_eq!(rsp.tag_id, 1);
                    assert_eq!(rsp.decode::<EchoRsp>().expect("echo rsp").payload, word);
                }
                dispatcher.shutdown();
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("queue worker panicked");
    }
    println!("✅ 2 queues × 200 echoes routed to their senders");
}
