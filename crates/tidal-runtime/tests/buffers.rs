//! Device slot reuse under contention.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tidal_runtime::{AsyncHandle, Runtime, RuntimeConfig, SimulatedDevice, SubmitOptions, Value};

use common::*;

// ============================================================================
// Slot integrity
// ============================================================================

#[test]
fn test_slots_never_overwritten_while_read() {
    let rt = Runtime::new(RuntimeConfig { pipeline_depth: 2, ..config() }).unwrap();
    let models: Vec<_> = (0..3)
        .map(|i| checked_model(&format!("m{i}"), 3, 64, 1.0, Duration::from_millis(2)))
        .collect();

    let mut rng = StdRng::seed_from_u64(11);
    let handles: Vec<(AsyncHandle, Value)> = (0..24)
        .map(|_| {
            let model = &models[rng.gen_range(0..models.len())];
            let n = rng.gen_range(1..=4);
            let input = rows(4, 2);
            let h = rt
                .submit_async(model, input.clone(), SubmitOptions::default().microbatches(n))
                .unwrap();
            (h, add_all(&Value::Tensor(input), 3.0))
        })
        .collect();

    for (h, expected) in &handles {
        assert_eq!(&expect_ok(h.get_result()), expected, "{}", h.id());
    }
    let stats = rt.stats();
    assert_eq!((stats.completed, stats.failed), (24, 0));
    assert_eq!(stats.transfer.failures, 0);
}

#[test]
fn test_concurrent_callers() {
    let rt = Arc::new(Runtime::new(config()).unwrap());
    let model = checked_model("shared", 4, 32, 0.25, Duration::from_millis(1));

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let rt = rt.clone();
            let model = model.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    let input = rows(2 + (w + i) % 3, 3);
                    let out = rt
                        .submit(&model, input.clone(), SubmitOptions::default().microbatches(2))
                        .unwrap()
                        .into_value()
                        .unwrap();
                    assert_eq!(out, add_all(&Value::Tensor(input), 1.0));
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(rt.stats().completed, 20);
}

#[test]
fn test_throttled_copies_stay_correct() {
    let config = RuntimeConfig {
        simulated_bandwidth: Some(64 * 1024),
        ..config()
    };
    let rt = Runtime::new(config).unwrap();
    let model = checked_model("throttled", 3, 256, 1.0, Duration::ZERO);

    let handles: Vec<AsyncHandle> = (0..4)
        .map(|_| rt.submit_async(&model, rows(4, 1), SubmitOptions::default().microbatches(2)).unwrap())
        .collect();
    for h in &handles {
        assert_eq!(expect_ok(h.get_result()), add_all(&Value::Tensor(rows(4, 1)), 3.0));
    }
    assert!(rt.stats().transfer.bytes_staged >= model.total_footprint() as u64);
}

// ============================================================================
// Reuse
// ============================================================================

#[test]
fn test_resident_stage_is_reused() {
    let rt = Runtime::paused(config(), Arc::new(SimulatedDevice::default())).unwrap();
    let model = add_model("resident", 1, 1.0);
    let handles: Vec<AsyncHandle> = (0..3)
        .map(|_| rt.submit_async(&model, rows(1, 1), SubmitOptions::default()).unwrap())
        .collect();
    rt.resume();
    for h in &handles {
        expect_ok(h.get_result());
    }
    let stats = rt.stats().transfer;
    assert_eq!(stats.stagings, 1, "{stats}");
    assert!(stats.resident_hits >= 2, "{stats}");
}

#[test]
fn test_harvest_detaches_slots() {
    let rt = Runtime::new(config()).unwrap();
    let model = add_model("detach", 2, 1.0);
    rt.run(&model, rows(2, 2)).unwrap();
    wait_until("slots detached", || rt.stats().transfer.detached > 0);
}
