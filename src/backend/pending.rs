//! Bounded queue for audio awaiting backend readiness
//!
//! While the remote session is still being established, resampled chunks are
//! parked here instead of being sent. The queue holds at most ~5 seconds of
//! audio; when full, the oldest chunk is evicted first - bounded staleness
//! beats unbounded memory.
//!
//! # Memory Budget
//!
//! At 16 kHz mono i16 with 20 ms chunks:
//! - Chunk size: 320 samples x 2 bytes = 640 bytes
//! - 5 seconds: 250 chunks x 640 bytes = 160 KB

use std::collections::VecDeque;

/// Default capacity: 5 seconds of 20 ms chunks.
pub const DEFAULT_CAPACITY: usize = 250;

/// FIFO of resampled chunks with automatic oldest-first eviction.
///
/// Not internally synchronized; owned by the remote backend's writer task.
#[derive(Debug)]
pub struct PendingAudioQueue {
    chunks: VecDeque<Vec<i16>>,
    max_chunks: usize,
    dropped: u64,
}

impl PendingAudioQueue {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks),
            max_chunks,
            dropped: 0,
        }
    }

    /// Park a chunk. Evicts the oldest chunk when at capacity.
    pub fn push(&mut self, samples: Vec<i16>) {
        if self.chunks.len() >= self.max_chunks {
            self.chunks.pop_front();
            self.dropped += 1;
            if self.dropped % 50 == 1 {
                log::warn!(
                    "Pending audio queue full; {} oldest chunk(s) dropped so far",
                    self.dropped
                );
            }
        }
        self.chunks.push_back(samples);
    }

    /// Remove all parked chunks in their original arrival order.
    pub fn drain_all(&mut self) -> Vec<Vec<i16>> {
        self.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for PendingAudioQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
