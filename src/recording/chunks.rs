use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{RecorderError, Result};

/// One encoded buffer. Cheap to clone so a consolidation round can hold on
/// to the originals while the worker reads them.
pub type Chunk = Arc<[u8]>;

#[derive(Debug, Default)]
struct StoreInner {
    chunks: Vec<Chunk>,
    generation: u64,
    in_flight: bool,
}

/// Ordered buffer of encoded chunks for one session.
///
/// `generation` changes every time the buffer is cleared, so late results
/// from the encoder thread or a consolidation round never land in a newer
/// session's buffer.
#[derive(Debug, Default)]
pub struct ChunkStore {
    inner: Mutex<StoreInner>,
    settled: Notify,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn push(&self, bytes: Vec<u8>) {
        let generation = self.generation();
        self.push_for(generation, bytes);
    }

    /// Appends unless the buffer was cleared since `generation` was read.
    /// Empty buffers are ignored.
    pub fn push_for(&self, generation: u64, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.chunks.push(Arc::from(bytes));
        true
    }

    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    /// Bytes currently in the live buffer. Chunks detached by an in-flight
    /// consolidation round are not counted.
    pub fn total_bytes(&self) -> usize {
        self.lock().chunks.iter().map(|c| c.len()).sum()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.lock().chunks.clone()
    }

    /// Concatenates every chunk into one buffer.
    pub fn assemble(&self) -> Vec<u8> {
        let chunks = self.chunks();
        let mut blob = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
        for chunk in &chunks {
            blob.extend_from_slice(chunk);
        }
        blob
    }

    pub fn is_consolidating(&self) -> bool {
        self.lock().in_flight
    }

    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.chunks.clear();
            inner.generation += 1;
            inner.in_flight = false;
        }
        self.settled.notify_waiters();
    }

    /// Resolves once no consolidation round is in flight.
    pub async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_consolidating() {
                return;
            }
            notified.await;
        }
    }

    /// Removes all but the newest `keep_recent` chunks from the live buffer
    /// when it holds more than `threshold`, and marks a round in flight.
    fn detach_oldest(&self, threshold: usize, keep_recent: usize) -> Option<(u64, Vec<Chunk>)> {
        let mut inner = self.lock();
        if inner.in_flight || inner.chunks.len() <= threshold {
            return None;
        }
        let count = inner.chunks.len().saturating_sub(keep_recent);
        if count < 2 {
            return None;
        }
        let detached: Vec<Chunk> = inner.chunks.drain(..count).collect();
        inner.in_flight = true;
        Some((inner.generation, detached))
    }

    fn splice_front(&self, generation: u64, front: Vec<Chunk>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.chunks.splice(0..0, front);
        true
    }

    fn finish_round(&self, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.in_flight = false;
        }
        self.settled.notify_waiters();
    }
}

/// Merges detached chunks into one. Runs on a worker thread.
pub trait ChunkMerger: Send + Sync {
    fn merge(&self, chunks: &[Chunk]) -> Result<Vec<u8>>;
}

/// Byte concatenation, the consolidation every streamed container supports.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatMerger;

impl ChunkMerger for ConcatMerger {
    fn merge(&self, chunks: &[Chunk]) -> Result<Vec<u8>> {
        let total = chunks.iter().map(|c| c.len()).sum();
        let mut merged = Vec::with_capacity(total);
        for chunk in chunks {
            merged.extend_from_slice(chunk);
        }
        Ok(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    /// Below threshold, or another round is still running.
    Skipped,
    Merged { chunks: usize, bytes: usize },
    /// The worker failed and the originals went back in place.
    Restored { chunks: usize, reason: String },
    /// The buffer was cleared while the worker ran.
    Discarded,
}

/// Holds the detached originals until the round completes. Dropping it
/// early (an aborted sweep) puts them back.
struct Round<'a> {
    store: &'a ChunkStore,
    generation: u64,
    originals: Option<Vec<Chunk>>,
}

impl Round<'_> {
    fn complete(mut self, merged: Option<Vec<u8>>) -> ConsolidationOutcome {
        let originals = self.originals.take().unwrap_or_default();
        let count = originals.len();
        let outcome = match merged {
            Some(bytes) => {
                let size = bytes.len();
                if self.store.splice_front(self.generation, vec![Arc::from(bytes)]) {
                    ConsolidationOutcome::Merged {
                        chunks: count,
                        bytes: size,
                    }
                } else {
                    ConsolidationOutcome::Discarded
                }
            }
            None => {
                if self.store.splice_front(self.generation, originals) {
                    ConsolidationOutcome::Restored {
                        chunks: count,
                        reason: String::new(),
                    }
                } else {
                    ConsolidationOutcome::Discarded
                }
            }
        };
        self.store.finish_round(self.generation);
        outcome
    }
}

impl Drop for Round<'_> {
    fn drop(&mut self) {
        if let Some(originals) = self.originals.take() {
            self.store.splice_front(self.generation, originals);
            self.store.finish_round(self.generation);
        }
    }
}

/// Bounds the chunk count of long sessions by periodically merging the
/// oldest chunks off the async runtime.
pub struct Consolidator {
    store: Arc<ChunkStore>,
    merger: Arc<dyn ChunkMerger>,
    threshold: usize,
    keep_recent: usize,
}

impl Consolidator {
    pub fn new(
        store: Arc<ChunkStore>,
        merger: Arc<dyn ChunkMerger>,
        threshold: usize,
        keep_recent: usize,
    ) -> Self {
        Self {
            store,
            merger,
            threshold,
            keep_recent,
        }
    }

    /// One consolidation round. Total bytes are unchanged whatever the
    /// outcome.
    pub async fn run_once(&self) -> ConsolidationOutcome {
        let Some((generation, detached)) = self.store.detach_oldest(self.threshold, self.keep_recent)
        else {
            return ConsolidationOutcome::Skipped;
        };

        let expected: usize = detached.iter().map(|c| c.len()).sum();
        let count = detached.len();
        let round = Round {
            store: &self.store,
            generation,
            originals: Some(detached.clone()),
        };

        debug!(chunks = count, bytes = expected, "consolidating chunks");
        let merged = merge_on_worker(Arc::clone(&self.merger), detached).await;

        match merged {
            Ok(bytes) if bytes.len() == expected => {
                let outcome = round.complete(Some(bytes));
                if let ConsolidationOutcome::Merged { chunks, bytes } = &outcome {
                    info!(chunks, bytes, "chunks consolidated");
                }
                outcome
            }
            Ok(bytes) => {
                let reason = format!("merged size {} differs from {}", bytes.len(), expected);
                warn!(%reason, "consolidation rejected, restoring chunks");
                with_reason(round.complete(None), reason)
            }
            Err(e) => {
                warn!(error = %e, "consolidation failed, restoring chunks");
                with_reason(round.complete(None), e.to_string())
            }
        }
    }

    /// Runs a round every `interval` until `alive` clears. The first round
    /// happens one interval after start.
    pub async fn run_sweep(self: Arc<Self>, alive: Arc<AtomicBool>, interval: Duration) {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            self.run_once().await;
        }
        debug!("consolidation sweep finished");
    }
}

fn with_reason(outcome: ConsolidationOutcome, reason: String) -> ConsolidationOutcome {
    match outcome {
        ConsolidationOutcome::Restored { chunks, .. } => {
            ConsolidationOutcome::Restored { chunks, reason }
        }
        other => other,
    }
}

/// Spawns a worker thread for this round only and waits for its reply.
async fn merge_on_worker(merger: Arc<dyn ChunkMerger>, chunks: Vec<Chunk>) -> Result<Vec<u8>> {
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("chunk-consolidator".to_string())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| merger.merge(&chunks)));
            let reply = match result {
                Ok(merged) => merged,
                Err(_) => Err(RecorderError::Consolidation("worker panicked".to_string())),
            };
            let _ = tx.send(reply);
        })
        .map_err(|e| RecorderError::Consolidation(format!("could not spawn worker: {}", e)))?;

    rx.await
        .map_err(|_| RecorderError::Consolidation("worker exited without replying".to_string()))?
}
