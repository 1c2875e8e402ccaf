//! In-order work streams.
//!
//! A [`Stream`] is a named worker thread that runs submitted jobs strictly in
//! submission order, the way work queued on one accelerator stream executes.
//! The runtime keeps one stream for compute and one for copies; ordering
//! between them is expressed with [`Event`]s.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tidal_core::{Result, TidalError};

use crate::event::Event;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO executor backed by a dedicated thread.
pub struct Stream {
    name: String,
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Spawn the worker thread for a new stream.
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread_name = name.to_string();
        let worker = thread::Builder::new()
            .name(format!("tidal-{name}"))
            .spawn(move || {
                // Drains every queued job before exiting once all senders are gone.
                while let Ok(job) = rx.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("job on stream '{}' panicked", thread_name);
                    }
                }
            })
            .map_err(|e| {
                TidalError::ResourceExhaustion(format!("failed to spawn stream '{name}': {e}"))
            })?;

        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` behind everything already submitted.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(TidalError::SchedulerClosed)?
            .send(Box::new(job))
            .map_err(|_| TidalError::SchedulerClosed)
    }

    /// Signal `event` once every job queued so far has run.
    pub fn record(&self, event: &Event) -> Result<()> {
        let marker = event.clone();
        self.enqueue(move || {
            marker.signal();
        })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream '{}' worker terminated abnormally", self.name);
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn drain(stream: &Stream) -> Result<()> {
        let done = Event::new();
        stream.record(&done)?;
        done.wait()
    }

    #[test]
    fn test_jobs_run_in_order() {
        let stream = Stream::new("test-order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            stream
                .enqueue(move || {
                    if i % 3 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    log.lock().push(i);
                })
                .unwrap();
        }
        drain(&stream).unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_cross_stream_wait() {
        let copy = Stream::new("test-copy").unwrap();
        let compute = Stream::new("test-compute").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let gate = Event::new();
        {
            let log = log.clone();
            let gate = gate.clone();
            compute
                .enqueue(move || {
                    if gate.wait().is_ok() {
                        log.lock().push("compute");
                    }
                })
                .unwrap();
        }
        {
            let log = log.clone();
            let gate = gate.clone();
            copy.enqueue(move || {
                std::thread::sleep(Duration::from_millis(10));
                log.lock().push("copy");
                gate.signal();
            })
            .unwrap();
        }
        drain(&compute).unwrap();
        assert_eq!(*log.lock(), vec!["copy", "compute"]);
    }

    #[test]
    fn test_panicking_job_does_not_kill_stream() {
        let stream = Stream::new("test-panic").unwrap();
        stream.enqueue(|| panic!("boom")).unwrap();
        assert_eq!(drain(&stream), Ok(()));
    }

    #[test]
    fn test_drop_drains_queue() {
        let done = Event::new();
        {
            let stream = Stream::new("test-drain").unwrap();
            let done = done.clone();
            stream
                .enqueue(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    done.signal();
                })
                .unwrap();
        }
        assert!(done.is_set());
    }
}
