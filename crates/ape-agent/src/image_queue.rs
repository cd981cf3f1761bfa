//! Screenshot writer pool
//!
//! A fixed set of worker threads, each draining its own queue. Requests are
//! handed out round-robin so a slow disk never blocks the step loop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use ape_common::{ApeError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

#[derive(Debug)]
struct ImageRequest {
    path: PathBuf,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<ImageRequest>,
    in_flight: usize,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    drained: Condvar,
}

impl Shared {
    fn run(&self) {
        loop {
            let request = {
                let mut state = self.state.lock();
                while state.requests.is_empty() && !state.stopping {
                    self.available.wait(&mut state);
                }
                match state.requests.pop_front() {
                    Some(request) => {
                        state.in_flight += 1;
                        request
                    }
                    None => return,
                }
            };

            if let Err(e) = std::fs::write(&request.path, &request.bytes) {
                warn!(path = %request.path.display(), error = %e, "failed to write screenshot");
            }

            let mut state = self.state.lock();
            state.in_flight -= 1;
            if state.requests.is_empty() && state.in_flight == 0 {
                self.drained.notify_all();
            }
        }
    }

    fn wait_drained(&self) {
        let mut state = self.state.lock();
        while !state.requests.is_empty() || state.in_flight > 0 {
            self.drained.wait(&mut state);
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

pub struct ImageWriterQueue {
    workers: Vec<Worker>,
    next: usize,
}

impl ImageWriterQueue {
    pub fn new(count: usize) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for i in 0..count.max(1) {
            let shared = Arc::new(Shared::default());
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("ape-image-writer-{}", i))
                .spawn(move || worker_shared.run())
                .map_err(|e| ApeError::Internal(format!("cannot spawn image writer: {}", e)))?;
            workers.push(Worker {
                shared,
                handle: Some(handle),
            });
        }
        debug!(workers = workers.len(), "image writers started");
        Ok(Self { workers, next: 0 })
    }

    pub fn add(&mut self, path: PathBuf, bytes: Vec<u8>) {
        let worker = &self.workers[self.next % self.workers.len()];
        self.next = self.next.wrapping_add(1);
        worker
            .shared
            .state
            .lock()
            .requests
            .push_back(ImageRequest { path, bytes });
        worker.shared.available.notify_one();
    }

    /// Block until every queued screenshot is on disk
    pub fn flush(&self) {
        for worker in &self.workers {
            worker.shared.wait_drained();
        }
    }

    /// Drain the queues and stop the workers
    pub fn tear_down(&mut self) {
        for worker in &self.workers {
            worker.shared.state.lock().stopping = true;
            worker.shared.available.notify_all();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("image writer panicked");
                }
            }
        }
    }
}

impl Drop for ImageWriterQueue {
    fn drop(&mut self) {
        self.tear_down();
    }
}
