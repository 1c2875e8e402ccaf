//! Ordering, workload propagation and admission control.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tidal_core::{Device, Result, Tensor};
use tidal_runtime::{
    AsyncHandle, DeviceBackend, PipelineModel, Runtime, RuntimeConfig, SimulatedDevice,
    SubmitOptions, Value,
};

use common::*;

fn paused(config: RuntimeConfig) -> Runtime {
    Runtime::paused(config, Arc::new(SimulatedDevice::default())).unwrap()
}

fn submit(rt: &Runtime, model: &Arc<PipelineModel>, input: Value) -> AsyncHandle {
    rt.submit_async(model, input, SubmitOptions::default()).unwrap()
}

// ============================================================================
// Workload propagation
// ============================================================================

#[test]
fn test_diamond_workload_counted_once() {
    let rt = paused(config());
    let model = add_model("diamond", 1, 1.0);
    let f = model.total_footprint() as u64;

    let a = submit(&rt, &model, Tensor::from_f32(&[1.0], &[1]).into());
    let b = submit(&rt, &model, Value::List(vec![a.clone().into()]));
    let c = submit(&rt, &model, Value::List(vec![a.clone().into()]));
    let d = submit(&rt, &model, Value::List(vec![b.clone().into(), c.clone().into()]));

    assert_eq!(a.outstanding_workload(), 4 * f);
    assert_eq!(b.outstanding_workload(), 2 * f);
    assert_eq!(c.outstanding_workload(), 2 * f);
    assert_eq!(d.outstanding_workload(), f);
    assert_eq!(d.dependencies().len(), 2);

    wait_until("admission", || {
        let s = rt.stats();
        s.submitted == 4 && s.blocked == 3 && s.running == 1
    });
    rt.resume();

    let out = expect_ok(d.get_result());
    let expected = Value::List(vec![
        Value::List(vec![Value::Tensor(Tensor::from_f32(&[4.0], &[1]))]),
        Value::List(vec![Value::Tensor(Tensor::from_f32(&[4.0], &[1]))]),
    ]);
    assert_eq!(out, expected);
    for h in [&a, &b, &c, &d] {
        assert!(h.is_resolved());
        assert_eq!(h.priority(), 0);
        assert!(h.dependencies().is_empty());
    }
}

#[test]
fn test_random_dags_propagate_to_every_ancestor() {
    let mut rng = StdRng::seed_from_u64(0x7D1A);
    for _ in 0..5 {
        let rt = paused(config());
        let model = add_model("dag", 2, 1.0);
        let f = model.total_footprint() as u64;
        let n = rng.gen_range(4..14);

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut handles: Vec<AsyncHandle> = Vec::with_capacity(n);
        let mut expected: Vec<Value> = Vec::with_capacity(n);
        for i in 0..n {
            let picked: Vec<usize> = (0..i).filter(|_| rng.gen_bool(0.3)).collect();
            let (input, resolved) = if picked.is_empty() {
                let t = Value::Tensor(Tensor::from_f32(&[i as f32], &[1]));
                (t.clone(), t)
            } else {
                (
                    Value::List(picked.iter().map(|&p| handles[p].clone().into()).collect()),
                    Value::List(picked.iter().map(|&p| expected[p].clone()).collect()),
                )
            };
            handles.push(submit(&rt, &model, input));
            expected.push(add_all(&resolved, 2.0));
            deps.push(picked);
        }

        // descendants[i]: every node that transitively consumes node i
        let mut descendants: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for node in (0..n).rev() {
            for &parent in &deps[node] {
                let mut below = descendants[node].clone();
                below.insert(node);
                descendants[parent].extend(below);
            }
        }
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(
                h.outstanding_workload(),
                f * (1 + descendants[i].len() as u64),
                "node {i} of {n}"
            );
        }

        rt.resume();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(expect_ok(h.get_result()), expected[i], "node {i}");
            assert_eq!(h.priority(), 0);
        }
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_less_remaining_work_dispatches_first() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let big = recording_model("A", 10, &log);
    let small = recording_model("B", 2, &log);

    let rt = paused(config());
    let a = submit(&rt, &big, Tensor::from_f32(&[1.0], &[1]).into());
    let b = submit(&rt, &small, Tensor::from_f32(&[1.0], &[1]).into());
    assert_eq!((a.priority(), b.priority()), (10, 2));

    rt.resume();
    a.wait().unwrap();
    b.wait().unwrap();
    assert_eq!(*log.lock(), vec!["B".to_string(), "A".to_string()]);
}

#[test]
fn test_equal_work_runs_in_arrival_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let first = recording_model("first", 8, &log);
    let second = recording_model("second", 8, &log);

    let rt = paused(config());
    let a = submit(&rt, &first, Tensor::from_f32(&[1.0], &[1]).into());
    let b = submit(&rt, &second, Tensor::from_f32(&[1.0], &[1]).into());
    rt.resume();
    a.wait().unwrap();
    b.wait().unwrap();
    assert_eq!(*log.lock(), vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn test_priority_only_decreases_and_ends_at_zero() {
    let rt = Runtime::new(config()).unwrap();
    let model = checked_model("slow", 4, 8, 1.0, Duration::from_millis(5));
    let h = rt
        .submit_async(&model, rows(4, 2), SubmitOptions::default().microbatches(2))
        .unwrap();

    let mut samples = vec![h.priority()];
    while !h.is_resolved() {
        samples.push(h.priority());
        std::thread::sleep(Duration::from_millis(1));
    }
    samples.push(h.priority());

    assert_eq!(samples[0], model.total_footprint() as u64);
    assert!(samples.windows(2).all(|w| w[1] <= w[0]), "{samples:?}");
    assert_eq!(samples.last(), Some(&0));
    assert_eq!(h.current_stage(), 4);
    assert_eq!(h.completed_workload(), h.outstanding_workload());
}

// ============================================================================
// Admission control
// ============================================================================

#[test]
fn test_stage_depth_never_exceeds_limit() {
    for depth in [1, 2, 3] {
        let rt = Runtime::new(RuntimeConfig { pipeline_depth: depth, ..config() }).unwrap();
        let model = checked_model("deep", 3, 4, 1.0, Duration::from_millis(1));
        let handles: Vec<AsyncHandle> = (0..5)
            .map(|_| {
                rt.submit_async(&model, rows(8, 2), SubmitOptions::default().microbatches(4))
                    .unwrap()
            })
            .collect();
        for h in &handles {
            let out = expect_ok(h.get_result());
            assert_eq!(out, add_all(&Value::Tensor(rows(8, 2)), 3.0));
        }
        let stats = rt.stats();
        assert!(stats.peak_stage_in_flight >= 1);
        assert!(
            stats.peak_stage_in_flight <= depth,
            "peak {} exceeds depth {depth}",
            stats.peak_stage_in_flight
        );
    }
}

#[test]
fn test_depth_bound_under_random_concurrent_load() {
    let mut rng = StdRng::seed_from_u64(0xDE97);
    for depth in 1..=3 {
        let rt = Arc::new(Runtime::new(RuntimeConfig { pipeline_depth: depth, ..config() }).unwrap());
        let models: Vec<_> = (0..3)
            .map(|i| {
                let stages = rng.gen_range(1..=4);
                let delay = Duration::from_micros(rng.gen_range(0..500));
                checked_model(&format!("load{depth}.{i}"), stages, 8, 1.0, delay)
            })
            .collect();

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let rt = rt.clone();
                let models = models.clone();
                let seed: u64 = rng.gen();
                std::thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut pending: Vec<(AsyncHandle, Value)> = Vec::new();
                    for _ in 0..8 {
                        let model = &models[rng.gen_range(0..models.len())];
                        let (input, base): (Value, Value) = match pending.last() {
                            Some((prev, expected)) if rng.gen_bool(0.25) => {
                                (prev.clone().into(), expected.clone())
                            }
                            _ => (rows(6, 2).into(), Value::Tensor(rows(6, 2))),
                        };
                        let options = SubmitOptions::default().microbatches(rng.gen_range(1..=6));
                        let h = rt.submit_async(model, input, options).unwrap();
                        pending.push((h, add_all(&base, model.num_stages() as f32)));
                    }
                    for (h, expected) in pending {
                        assert_eq!(expect_ok(h.get_result()), expected, "{}", h.id());
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let stats = rt.stats();
        assert_eq!((stats.completed, stats.failed), (24, 0));
        assert!(
            stats.peak_stage_in_flight <= depth,
            "peak {} exceeds depth {depth}",
            stats.peak_stage_in_flight
        );
    }
}

/// Holds every copy of at least `threshold` bytes until opened.
struct GatedBackend {
    threshold: usize,
    open: Mutex<bool>,
    cv: Condvar,
}

impl GatedBackend {
    fn new(threshold: usize) -> Arc<Self> {
        Arc::new(Self { threshold, open: Mutex::new(false), cv: Condvar::new() })
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

impl DeviceBackend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    fn copy_to_device(&self, device: Device, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        if src.len() >= self.threshold {
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
        }
        SimulatedDevice::default().copy_to_device(device, src, dst)
    }
}

#[test]
fn test_chained_admission_does_not_stall_scheduling() {
    let gate = GatedBackend::new(256);
    let rt = Runtime::with_backend(config(), gate.clone()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let slow = recording_model("slow", 400, &log);
    let model = add_model("fast", 1, 1.0);

    let upstream = submit(&rt, &model, rows(2, 2).into());
    upstream.wait().unwrap();
    let stalled = submit(&rt, &slow, rows(2, 2).into());
    let chained = submit(&rt, &model, upstream.clone().into());
    let unrelated = submit(&rt, &model, rows(2, 2).into());

    // The slow stage's copy holds the copy stream; submissions still get handled.
    wait_until("every submission handled", || rt.stats().submitted == 4);
    assert!(!stalled.is_resolved());
    assert!(!chained.is_resolved());

    gate.open();
    assert_eq!(expect_ok(chained.get_result()), add_all(&Value::Tensor(rows(2, 2)), 2.0));
    assert_eq!(expect_ok(unrelated.get_result()), add_all(&Value::Tensor(rows(2, 2)), 1.0));
    assert_eq!(expect_ok(stalled.get_result()), Value::Tensor(rows(2, 2)));
    assert_eq!(*log.lock(), vec!["slow".to_string()]);
}

#[test]
fn test_stats_settle_when_idle() {
    let rt = Runtime::new(config()).unwrap();
    let model = add_model("idle", 2, 1.0);
    let handles: Vec<AsyncHandle> = (0..4)
        .map(|i| submit(&rt, &model, Tensor::from_f32(&[i as f32], &[1]).into()))
        .collect();
    for h in &handles {
        expect_ok(h.get_result());
    }
    wait_until("idle scheduler", || {
        let s = rt.stats();
        s.completed == 4 && s.running == 0
    });
    let stats = rt.stats();
    assert_eq!((stats.submitted, stats.failed, stats.in_flight_workload), (4, 0, 0));
    assert!(stats.transfer.stagings >= 2);
    assert!(stats.to_string().contains("4 completed"));
}
