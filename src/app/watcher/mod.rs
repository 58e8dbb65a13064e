pub mod matcher;
pub mod queue;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::app::config::WatcherSettings;
use crate::app::error::RunError;
use crate::app::models::{DetectionResult, DeviceSpec, DumpSnapshot, ElementQuery};
use crate::app::tools::Toolchain;

use queue::SnapshotQueue;

fn epoch_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// One-shot slot for the pipeline's terminal value. Only the analyzer that
/// wins the found-flag compare-and-set ever writes it.
struct ResultSlot {
    slot: Mutex<Option<DetectionResult>>,
    ready: Condvar,
}

impl ResultSlot {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn record(&self, result: DetectionResult) {
        let mut guard = self.slot.lock().expect("result slot poisoned");
        *guard = Some(result);
        self.ready.notify_all();
    }

    fn wait_until(&self, deadline: Instant) -> Option<DetectionResult> {
        let mut guard = self.slot.lock().expect("result slot poisoned");
        loop {
            if let Some(result) = guard.clone() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .ready
                .wait_timeout(guard, deadline - now)
                .expect("result slot poisoned");
            guard = next;
        }
    }
}

/// Concurrent UI-element detection: producer workers capture UI-tree dumps
/// while analyzer workers scan them for the target element. The first match
/// wins; everything stops cooperatively once the shared flag flips.
pub struct ElementWatcher {
    toolchain: Arc<dyn Toolchain>,
    settings: WatcherSettings,
}

impl ElementWatcher {
    pub fn new(toolchain: Arc<dyn Toolchain>, settings: WatcherSettings) -> Self {
        Self { toolchain, settings }
    }

    /// Blocks until the element is detected or the budget elapses. Exactly
    /// one `DetectionResult` is produced per invocation; a timeout is the
    /// error path and also flips the flag so workers stop.
    pub fn watch(
        &self,
        spec: &DeviceSpec,
        query: &ElementQuery,
        trace_id: &str,
    ) -> Result<DetectionResult, RunError> {
        let scratch = TempDir::new().map_err(|err| {
            RunError::system(format!("Failed to create dump scratch dir: {err}"), trace_id)
        })?;

        let queue = Arc::new(SnapshotQueue::new(self.settings.queue_capacity));
        let found = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(ResultSlot::new());
        let sequence = Arc::new(AtomicU64::new(0));
        let poll_interval = self.settings.poll_interval();
        let started = Instant::now();

        info!(
            trace_id = %trace_id,
            target = %query.target_identifier,
            producers = self.settings.producers,
            analyzers = self.settings.analyzers,
            budget_ms = query.timeout_budget.as_millis() as u64,
            "element watch started"
        );

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for producer_id in 0..self.settings.producers {
            workers.push(spawn_producer(
                producer_id,
                Arc::clone(&self.toolchain),
                spec.clone(),
                scratch.path().to_path_buf(),
                Arc::clone(&queue),
                Arc::clone(&found),
                Arc::clone(&sequence),
                poll_interval,
                trace_id.to_string(),
            ));
        }
        for analyzer_id in 0..self.settings.analyzers {
            workers.push(spawn_analyzer(
                analyzer_id,
                query.target_identifier.clone(),
                Arc::clone(&queue),
                Arc::clone(&found),
                Arc::clone(&slot),
                started,
                poll_interval,
                trace_id.to_string(),
            ));
        }

        let outcome = slot.wait_until(started + query.timeout_budget);

        // Whoever flips the flag first is authoritative: an analyzer that
        // already won keeps its result; otherwise this is the timeout.
        let timed_out = found
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let result = if timed_out {
            None
        } else {
            // A winner exists but may still be between the compare-and-set
            // and recording its result; give it a moment.
            outcome.or_else(|| slot.wait_until(Instant::now() + self.settings.shutdown_grace()))
        };

        self.reap_workers(workers, trace_id);

        match result {
            Some(result) => {
                info!(
                    trace_id = %trace_id,
                    target = %query.target_identifier,
                    elapsed_ms = result.elapsed_ms,
                    "element detected"
                );
                Ok(result)
            }
            None => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(
                    trace_id = %trace_id,
                    target = %query.target_identifier,
                    elapsed_ms,
                    "element not found within budget"
                );
                Err(RunError::element_timeout(
                    format!(
                        "Element {} not found within {elapsed_ms}ms",
                        query.target_identifier
                    ),
                    trace_id,
                ))
            }
        }
    }

    /// Waits up to the grace period for workers to observe the flag, then
    /// abandons stragglers. A worker stuck in an external capture call is
    /// left to finish on its own rather than holding up run teardown.
    fn reap_workers(&self, workers: Vec<JoinHandle<()>>, trace_id: &str) {
        let deadline = Instant::now() + self.settings.shutdown_grace();
        while Instant::now() < deadline {
            if workers.iter().all(|worker| worker.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let mut abandoned = 0usize;
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(trace_id = %trace_id, abandoned, "abandoning watcher workers still in flight");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_producer(
    producer_id: usize,
    toolchain: Arc<dyn Toolchain>,
    spec: DeviceSpec,
    scratch_dir: PathBuf,
    queue: Arc<SnapshotQueue>,
    found: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    poll_interval: Duration,
    trace_id: String,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !found.load(Ordering::Acquire) {
            let raw_content = match toolchain.capture_ui_tree(&spec, &trace_id) {
                Ok(xml) => xml,
                Err(err) => {
                    warn!(
                        trace_id = %trace_id,
                        producer_id,
                        error = %err,
                        "ui tree capture failed; retrying"
                    );
                    thread::sleep(poll_interval);
                    continue;
                }
            };

            let captured_at_ms = epoch_millis();
            let sequence_id = sequence.fetch_add(1, Ordering::Relaxed);
            let snapshot = DumpSnapshot {
                sequence_id,
                captured_at_ms,
                raw_content,
                producer_id,
            };

            let dump_path = scratch_dir.join(format!("dump_{captured_at_ms}_{sequence_id:06}.xml"));
            if let Err(err) = fs::write(&dump_path, &snapshot.raw_content) {
                // The scratch dir disappears when the run ends; a straggling
                // producer hitting that is harmless.
                debug!(trace_id = %trace_id, producer_id, error = %err, "failed to persist snapshot");
            }

            if !queue.offer(snapshot, &found) {
                break;
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_analyzer(
    analyzer_id: usize,
    target_identifier: String,
    queue: Arc<SnapshotQueue>,
    found: Arc<AtomicBool>,
    slot: Arc<ResultSlot>,
    started: Instant,
    poll_interval: Duration,
    trace_id: String,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !found.load(Ordering::Acquire) {
            let Some(snapshot) = queue.poll(poll_interval) else {
                continue;
            };
            if !matcher::contains_matching_element(&snapshot.raw_content, &target_identifier) {
                continue;
            }

            // First match wins; the compare-and-set decides, later matches
            // are discarded.
            if found
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let discovered_at_ms = epoch_millis();
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(
                    trace_id = %trace_id,
                    analyzer_id,
                    producer_id = snapshot.producer_id,
                    sequence_id = snapshot.sequence_id,
                    elapsed_ms,
                    "matched target element"
                );
                slot.record(DetectionResult {
                    found: true,
                    discovered_at_ms,
                    elapsed_ms,
                });
            }
            return;
        }
    })
}
