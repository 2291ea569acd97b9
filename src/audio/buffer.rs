//! # Inbound Audio Aggregation
//!
//! Collects the caller's PCM16 audio between flushes so the realtime AI
//! service receives a few larger `input_audio_buffer.append` messages instead
//! of one message per 20ms telephony frame.
//!
//! ## Flush Policy:
//! - **Threshold**: Nothing is sent until at least `threshold_samples` are buffered
//! - **Debounce**: Once the threshold is reached, a flush is scheduled after `debounce`;
//!   every further append re-arms the timer, so bursts coalesce into one flush
//! - **Teardown**: `cancel_and_flush_if_ready` flushes what is ready and discards a
//!   sub-threshold tail
//!
//! ## Thread Safety:
//! Buffer state lives behind a `std::sync::Mutex`. The lock is never held across
//! an `.await`; the sink is synchronous (it only enqueues on a channel), so chunks
//! are handed over while the lock is held and arrival order is preserved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BridgeResult;

/// Destination of flushed audio (the realtime AI connection in production).
pub trait AudioSink: Send + Sync {
    /// Send one PCM16 chunk. Must not block.
    fn append_audio(&self, pcm: &[u8]) -> BridgeResult<()>;
}

/// When buffered audio is released to the sink.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Minimum number of buffered samples before anything is sent
    pub threshold_samples: usize,

    /// Quiet period after the last append before a scheduled flush fires
    pub debounce: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            threshold_samples: 2400, // 150ms at 16kHz
            debounce: Duration::from_millis(150),
        }
    }
}

struct BufferState {
    chunks: VecDeque<Vec<u8>>,
    pending_samples: usize,
    scheduled: Option<JoinHandle<()>>,
    /// Bumped on every schedule/cancel; a woken flush task with an older value does nothing
    generation: u64,
}

struct Inner {
    state: Mutex<BufferState>,
    sink: Arc<dyn AudioSink>,
    policy: FlushPolicy,
    flushes: Arc<AtomicU64>,
    label: String,
}

/// Per-session accumulator of inbound audio.
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct AudioBufferAggregator {
    inner: Arc<Inner>,
}

impl AudioBufferAggregator {
    #[cfg(test)]
    pub fn new(label: impl Into<String>, sink: Arc<dyn AudioSink>, policy: FlushPolicy) -> Self {
        Self::with_flush_counter(label, sink, policy, Arc::new(AtomicU64::new(0)))
    }

    /// Create an aggregator that releases audio to `sink`, counting completed
    /// flushes into `flushes`.
    ///
    /// `label` is only used in log lines (normally the stream id).
    pub fn with_flush_counter(
        label: impl Into<String>,
        sink: Arc<dyn AudioSink>,
        policy: FlushPolicy,
        flushes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BufferState {
                    chunks: VecDeque::new(),
                    pending_samples: 0,
                    scheduled: None,
                    generation: 0,
                }),
                sink,
                policy,
                flushes,
                label: label.into(),
            }),
        }
    }

    /// Buffer one PCM16 chunk and (re)arm the debounced flush once the threshold is met.
    ///
    /// Must be called from within a tokio runtime.
    pub fn append(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }

        let mut state = self.lock();
        state.pending_samples += chunk.len() / 2;
        state.chunks.push_back(chunk);

        if state.pending_samples >= self.inner.policy.threshold_samples {
            self.schedule(&mut state);
        }
    }

    /// Send every buffered chunk in arrival order if the threshold is met.
    ///
    /// Returns how many chunks were sent (0 below threshold). Chunks are handed
    /// to the sink while the lock is held, so concurrent flushes cannot reorder them.
    pub fn flush(&self) -> BridgeResult<usize> {
        let mut state = self.lock();
        if state.pending_samples < self.inner.policy.threshold_samples {
            return Ok(0);
        }

        let samples = state.pending_samples;
        let chunks: Vec<Vec<u8>> = state.chunks.drain(..).collect();
        state.pending_samples = 0;

        for chunk in &chunks {
            self.inner.sink.append_audio(chunk)?;
        }

        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(
            stream_id = %self.inner.label,
            chunks = chunks.len(),
            samples,
            "Flushed inbound audio"
        );
        Ok(chunks.len())
    }

    /// Cancel any scheduled flush, then flush synchronously if the threshold is
    /// met. A sub-threshold tail is discarded.
    pub fn cancel_and_flush_if_ready(&self) -> BridgeResult<usize> {
        {
            let mut state = self.lock();
            if let Some(handle) = state.scheduled.take() {
                handle.abort();
            }
            state.generation += 1;

            if state.pending_samples < self.inner.policy.threshold_samples {
                if state.pending_samples > 0 {
                    debug!(
                        stream_id = %self.inner.label,
                        discarded_samples = state.pending_samples,
                        "Discarding sub-threshold audio tail"
                    );
                }
                state.chunks.clear();
                state.pending_samples = 0;
                return Ok(0);
            }
        }

        self.flush()
    }

    /// Samples buffered and not yet sent.
    pub fn pending_samples(&self) -> usize {
        self.lock().pending_samples
    }

    #[cfg(test)]
    pub fn pending_chunks(&self) -> usize {
        self.lock().chunks.len()
    }

    #[cfg(test)]
    pub fn has_scheduled_flush(&self) -> bool {
        self.lock()
            .scheduled
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    #[cfg(test)]
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, state: &mut BufferState) {
        if let Some(previous) = state.scheduled.take() {
            previous.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let buffer = self.clone();

        state.scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(buffer.inner.policy.debounce).await;

            {
                let mut state = buffer.lock();
                if state.generation != generation {
                    return;
                }
                state.scheduled = None;
            }
            if let Err(err) = buffer.flush() {
                warn!(stream_id = %buffer.inner.label, error = %err, "Scheduled audio flush failed");
            }
        }));
    }
}
