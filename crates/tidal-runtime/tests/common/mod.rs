//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidal_core::{Result, Tensor, TidalError};
use tidal_runtime::{weights_from_f32, PipelineModel, RuntimeConfig, Stage, Value};

pub fn config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/// A model whose stage `i` holds `floats` copies of `i` and adds `delta` to
/// every input element. Each stage checks its weights before computing, so a
/// slot overwritten mid-read fails the request.
pub fn checked_model(name: &str, stages: usize, floats: usize, delta: f32, delay: Duration) -> Arc<PipelineModel> {
    let stages = (0..stages)
        .map(|i| {
            Stage::from_fn(
                format!("{name}.{i}"),
                weights_from_f32([("w", vec![i as f32; floats])]),
                move |ctx, params, inputs| {
                    let w = params
                        .f32("w")
                        .ok_or_else(|| TidalError::compute(ctx.stage, "missing weights"))?;
                    if w.len() != floats || w.iter().any(|&v| v != ctx.stage as f32) {
                        return Err(TidalError::compute(ctx.stage, "weights changed under compute"));
                    }
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    if w.iter().any(|&v| v != ctx.stage as f32) {
                        return Err(TidalError::compute(ctx.stage, "weights changed under compute"));
                    }
                    Ok(inputs.iter().map(|t| t.map(|v| v + delta)).collect())
                },
            )
        })
        .collect();
    PipelineModel::sequential(name, stages).unwrap()
}

pub fn add_model(name: &str, stages: usize, delta: f32) -> Arc<PipelineModel> {
    checked_model(name, stages, 4, delta, Duration::ZERO)
}

/// Single-stage model with a raw parameter of `bytes` bytes that appends
/// `name` to `log` when it runs.
pub fn recording_model(name: &str, bytes: usize, log: &Arc<Mutex<Vec<String>>>) -> Arc<PipelineModel> {
    let log = log.clone();
    let tag = name.to_string();
    let weights = Arc::new(vec![("w".to_string(), vec![0u8; bytes])]);
    let stage = Stage::from_fn(name, weights, move |_, _, inputs| {
        log.lock().push(tag.clone());
        Ok(inputs)
    });
    PipelineModel::sequential(name, vec![stage]).unwrap()
}

/// What a chain of `add_model` stages would produce for `value`.
pub fn add_all(value: &Value, delta: f32) -> Value {
    match value {
        Value::Tensor(t) => Value::Tensor(t.map(|v| v + delta)),
        Value::List(items) => Value::List(items.iter().map(|v| add_all(v, delta)).collect()),
        Value::Map(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), add_all(v, delta))).collect()),
        other => other.clone(),
    }
}

pub fn rows(n: usize, width: usize) -> Tensor {
    let data: Vec<f32> = (0..n * width).map(|v| v as f32).collect();
    Tensor::from_vec(data, &[n, width])
}

/// Poll `cond` until it holds or a generous timeout expires.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn expect_ok(result: Result<Value>) -> Value {
    match result {
        Ok(v) => v,
        Err(e) => panic!("request failed: {e}"),
    }
}
