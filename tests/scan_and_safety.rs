//! Black-box scenarios driving `MasterCore` end to end over an in-memory
//! loopback bus: discovery during a scan, debounced offline detection
//! across repeated scans, and scan pause/resume/stop control.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oht50_master_core::core::MasterCore;
use oht50_master_core::modbus::crc;
use oht50_master_core::safety::estop::NullEstopOutput;
use oht50_master_core::safety::led::NullLedEffects;
use oht50_master_core::scheduler::NullTelemetrySink;
use oht50_master_core::transport::serial::{LoopbackAdapter, SerialConfig};

fn read_holding_response(slave: u8, values: &[u16]) -> Vec<u8> {
    let mut resp = vec![slave, 0x03, (values.len() * 2) as u8];
    for v in values {
        resp.extend_from_slice(&v.to_be_bytes());
    }
    let c = crc::crc16(&resp);
    let [lo, hi] = crc::to_bytes(c);
    resp.push(lo);
    resp.push(hi);
    resp
}

fn parse_request(req: &[u8]) -> (u8, u16, u16) {
    let slave = req[0];
    let start = u16::from_be_bytes([req[2], req[3]]);
    let qty = u16::from_be_bytes([req[4], req[5]]);
    (slave, start, qty)
}

fn new_core(adapter: LoopbackAdapter) -> Arc<MasterCore> {
    let core = Arc::new(MasterCore::new(
        Box::new(adapter),
        Arc::new(NullTelemetrySink),
        Box::new(NullEstopOutput),
        Arc::new(NullLedEffects),
    ));
    core.open(SerialConfig::default()).unwrap();
    core
}

fn wait_for_scan_to_finish(core: &MasterCore) {
    while core.is_scanning() {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn discovers_a_power_module_during_scan() {
    let adapter = LoopbackAdapter::new(|req| {
        let (slave, start, qty) = parse_request(req);
        if slave != 0x02 {
            return None;
        }
        let values = match start {
            0x0100 => vec![1u16],
            0x0104 => vec![0x0002],
            0x0105 => vec![0x00FF],
            _ => vec![0u16; qty as usize],
        };
        Some(read_holding_response(slave, &values))
    });
    let core = new_core(adapter);

    assert!(core.start_scan(0x02, 0x02));
    wait_for_scan_to_finish(&core);

    let snapshot = core.registry_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].address, 0x02);
    assert_eq!(snapshot[0].module_type.as_str(), "Power");
}

#[test]
fn module_goes_offline_after_n_miss_consecutive_scan_misses() {
    let online = Arc::new(AtomicBool::new(true));
    let online_for_adapter = online.clone();
    let adapter = LoopbackAdapter::new(move |req| {
        if !online_for_adapter.load(Ordering::SeqCst) {
            return None;
        }
        let (slave, start, qty) = parse_request(req);
        if slave != 0x05 {
            return None;
        }
        let values = match start {
            0x0100 => vec![1u16],
            0x0104 => vec![0x0005],
            _ => vec![0u16; qty as usize],
        };
        Some(read_holding_response(slave, &values))
    });
    let core = new_core(adapter);

    assert!(core.start_scan(0x05, 0x05));
    wait_for_scan_to_finish(&core);
    assert_eq!(core.registry_snapshot()[0].status.as_str(), "Online");

    online.store(false, Ordering::SeqCst);

    // First miss: still online (n_miss defaults to 2).
    assert!(core.start_scan(0x05, 0x05));
    wait_for_scan_to_finish(&core);
    assert_eq!(core.registry_snapshot()[0].status.as_str(), "Online");

    // Second consecutive miss: crosses the debounce threshold.
    assert!(core.start_scan(0x05, 0x05));
    wait_for_scan_to_finish(&core);
    assert_eq!(core.registry_snapshot()[0].status.as_str(), "Offline");
}

#[test]
fn pause_resume_and_stop_control_an_in_progress_scan() {
    let visited = Arc::new(AtomicUsize::new(0));
    let visited_for_adapter = visited.clone();
    let adapter = LoopbackAdapter::new(move |req| {
        visited_for_adapter.fetch_add(1, Ordering::SeqCst);
        let (slave, _start, _qty) = parse_request(req);
        Some(read_holding_response(slave, &[1u16]))
    });
    let core = new_core(adapter);

    assert!(core.start_scan(0x02, 0x08));
    std::thread::sleep(Duration::from_millis(15));
    core.pause_scan();
    let visited_at_pause = visited.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(150));
    // No forward progress while paused.
    assert_eq!(visited.load(Ordering::SeqCst), visited_at_pause);
    assert!(core.is_scanning());

    core.resume_scan();
    wait_for_scan_to_finish(&core);
    assert_eq!(core.registry_snapshot().len(), 7);
}

#[test]
fn stop_scan_halts_before_the_full_range_completes() {
    let adapter = LoopbackAdapter::new(|req| {
        let (slave, _start, _qty) = parse_request(req);
        Some(read_holding_response(slave, &[1u16]))
    });
    let core = new_core(adapter);

    assert!(core.start_scan(0x02, 0x20));
    std::thread::sleep(Duration::from_millis(15));
    core.stop_scan();
    wait_for_scan_to_finish(&core);

    assert!(core.registry_snapshot().len() < (0x20 - 0x02 + 1));
}
