//! Shadow learning recorder.
//!
//! Strictly an observer of the request path: the router enqueues each
//! `DecisionEvent` with a non-blocking send, and a background worker drains
//! the bounded queue in batches into the outcome store. Overflow drops the
//! oldest queued event and bumps a counter; the caller is never blocked and
//! the chosen result is never affected.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::event::DecisionEvent;
use crate::metrics::RouterMetrics;
use crate::store::OutcomeStore;

/// Shadow recorder tuning.
#[derive(Debug, Clone)]
pub struct ShadowConfig {
    /// Max queued events before drop-oldest applies.
    pub queue_capacity: usize,

    /// Max events written to the outcome store per batch.
    pub batch_size: usize,

    /// Max time a partial batch waits before being flushed.
    pub flush_interval: Duration,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 256,
            flush_interval: Duration::from_millis(200),
        }
    }
}

/// Asynchronous sink for decision events.
pub struct ShadowRecorder {
    tx: Sender<DecisionEvent>,
    // Kept so overflow can evict the oldest queued event from the sender side.
    rx: Receiver<DecisionEvent>,
    metrics: Arc<RouterMetrics>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ShadowRecorder {
    /// Starts the recorder and its drain worker.
    #[must_use]
    pub fn start(
        config: ShadowConfig,
        store: Arc<dyn OutcomeStore>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<DecisionEvent>(capacity);

        let worker_rx = rx.clone();
        let worker_config = config;
        let join = thread::Builder::new()
            .name("shadowroute-shadow".to_string())
            .spawn(move || drain_loop(&worker_config, &worker_rx, store.as_ref()))
            .expect("failed to spawn shadow drain worker");

        Self {
            tx,
            rx,
            metrics,
            join: Mutex::new(Some(join)),
        }
    }

    /// Enqueues an event. O(1), no I/O, never blocks.
    ///
    /// On a full queue the oldest queued event is dropped and
    /// `dropped_events` is incremented; the incoming event is then enqueued
    /// on a best-effort basis.
    pub fn enqueue(&self, event: DecisionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
                let _ = self.rx.try_recv();
                // A racing drain may have freed space; if not, the event is
                // dropped too.
                if self.tx.try_send(event).is_err() {
                    self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

impl Drop for ShadowRecorder {
    fn drop(&mut self) {
        // Close the channel: the worker drains remaining events then exits.
        let (closed_tx, _closed_rx) = bounded::<DecisionEvent>(1);
        drop(std::mem::replace(&mut self.tx, closed_tx));
        let handle = self
            .join
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn drain_loop(config: &ShadowConfig, rx: &Receiver<DecisionEvent>, store: &dyn OutcomeStore) {
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<DecisionEvent> = Vec::with_capacity(batch_size);

    loop {
        match rx.recv_timeout(config.flush_interval) {
            Ok(event) => {
                batch.push(event);
                while batch.len() < batch_size {
                    match rx.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }
                flush(&mut batch, store);
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&mut batch, store);
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Final drain: the sender side is gone.
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                }
                flush(&mut batch, store);
                return;
            }
        }
    }
}

fn flush(batch: &mut Vec<DecisionEvent>, store: &dyn OutcomeStore) {
    if batch.is_empty() {
        return;
    }
    // Shadow recording is best-effort by contract; a failed write must not
    // ripple anywhere.
    let _ = store.append_events(std::mem::take(batch));
}
