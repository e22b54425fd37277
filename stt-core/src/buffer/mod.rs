//! Per-utterance PCM buffer manager (C1).
//!
//! Owns all utterance sample storage exclusively; every other component
//! references an utterance only by id (§3 ownership summary).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::UtteranceId;

const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();
const AGGRESSIVE_EVICTION_FRACTION: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of utterances tracked concurrently; oldest (by
    /// `last_access_time`) is evicted to make room for a new one.
    pub max_utterances: usize,
    /// Per-utterance cap used when `create` is not given an explicit override.
    pub default_max_buffer_mb: usize,
    pub max_idle_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Whether new utterances default to circular (overwrite-oldest) storage.
    pub circular: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_utterances: 32,
            default_max_buffer_mb: 8,
            max_idle_ms: 60_000,
            cleanup_interval_ms: 5_000,
            circular: true,
        }
    }
}

fn max_samples_for(mb: usize) -> usize {
    (mb * (1 << 20)) / BYTES_PER_SAMPLE
}

struct UtteranceBuffer {
    data: Vec<f32>,
    max_samples: usize,
    write_position: usize,
    circular: bool,
    start_time: Instant,
    last_access_time: Instant,
    active: bool,
    dropped_samples: u64,
}

impl UtteranceBuffer {
    fn new(max_samples: usize, circular: bool) -> Self {
        let now = Instant::now();
        Self {
            data: Vec::new(),
            max_samples,
            write_position: 0,
            circular,
            start_time: now,
            last_access_time: now,
            active: true,
            dropped_samples: 0,
        }
    }

    fn push_one(&mut self, sample: f32) -> bool {
        if self.data.len() < self.max_samples {
            self.data.push(sample);
            true
        } else if self.circular {
            self.data[self.write_position] = sample;
            self.write_position = (self.write_position + 1) % self.max_samples.max(1);
            true
        } else {
            false
        }
    }

    /// Returns `true` iff every sample was retained (nothing dropped).
    fn add(&mut self, samples: &[f32]) -> bool {
        self.last_access_time = Instant::now();
        if !self.active {
            self.dropped_samples += samples.len() as u64;
            return false;
        }
        let mut all_kept = true;
        for &s in samples {
            if !self.push_one(s) {
                self.dropped_samples += 1;
                all_kept = false;
            }
        }
        all_kept
    }

    fn read_all(&mut self) -> Vec<f32> {
        self.last_access_time = Instant::now();
        if self.data.len() < self.max_samples || !self.circular {
            self.data.clone()
        } else {
            let mut out = Vec::with_capacity(self.data.len());
            out.extend_from_slice(&self.data[self.write_position..]);
            out.extend_from_slice(&self.data[..self.write_position]);
            out
        }
    }

    fn read_recent(&mut self, n: usize) -> Vec<f32> {
        let all = self.read_all();
        if all.len() <= n {
            all
        } else {
            all[all.len() - n..].to_vec()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub total_utterances: usize,
    pub active_count: usize,
    pub current_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub total_samples: u64,
    pub dropped_samples: u64,
    pub utilization: f64,
}

struct Inner {
    buffers: HashMap<UtteranceId, UtteranceBuffer>,
    peak_memory_mb: f64,
    last_cleanup: Instant,
}

pub struct AudioBufferManager {
    config: BufferConfig,
    inner: Mutex<Inner>,
}

impl AudioBufferManager {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                buffers: HashMap::new(),
                peak_memory_mb: 0.0,
                last_cleanup: Instant::now(),
            }),
        }
    }

    fn memory_mb(buffers: &HashMap<UtteranceId, UtteranceBuffer>) -> f64 {
        let bytes: usize = buffers.values().map(|b| b.data.len() * BYTES_PER_SAMPLE).sum();
        bytes as f64 / (1 << 20) as f64
    }

    fn budget_mb(&self) -> f64 {
        self.config.max_utterances as f64 * self.config.default_max_buffer_mb as f64
    }

    /// Creates the utterance if absent, evicting the oldest (by last access)
    /// to stay within `max_utterances` first.
    pub fn create(&self, utterance_id: UtteranceId, max_size_mb: Option<usize>) -> bool {
        let mut inner = self.inner.lock();
        if inner.buffers.contains_key(&utterance_id) {
            return true;
        }
        if inner.buffers.len() >= self.config.max_utterances {
            if let Some(oldest) = inner
                .buffers
                .iter()
                .min_by_key(|(_, b)| b.last_access_time)
                .map(|(id, _)| *id)
            {
                debug!(evicted = oldest, "evicting oldest utterance to make room");
                inner.buffers.remove(&oldest);
            }
        }
        let mb = max_size_mb.unwrap_or(self.config.default_max_buffer_mb);
        let buf = UtteranceBuffer::new(max_samples_for(mb), self.config.circular);
        inner.buffers.insert(utterance_id, buf);
        true
    }

    pub fn add(&self, utterance_id: UtteranceId, samples: &[f32]) -> bool {
        let mut inner = self.inner.lock();
        if !inner.buffers.contains_key(&utterance_id) {
            let mb = self.config.default_max_buffer_mb;
            let buf = UtteranceBuffer::new(max_samples_for(mb), self.config.circular);
            inner.buffers.insert(utterance_id, buf);
        }
        let added_all = inner
            .buffers
            .get_mut(&utterance_id)
            .map(|b| b.add(samples))
            .unwrap_or(false);
        let mem = Self::memory_mb(&inner.buffers);
        if mem > inner.peak_memory_mb {
            inner.peak_memory_mb = mem;
        }
        self.maybe_cleanup(&mut inner, mem);
        added_all
    }

    pub fn read_all(&self, utterance_id: UtteranceId) -> Vec<f32> {
        let mut inner = self.inner.lock();
        inner
            .buffers
            .get_mut(&utterance_id)
            .map(|b| b.read_all())
            .unwrap_or_default()
    }

    pub fn read_recent(&self, utterance_id: UtteranceId, n: usize) -> Vec<f32> {
        let mut inner = self.inner.lock();
        inner
            .buffers
            .get_mut(&utterance_id)
            .map(|b| b.read_recent(n))
            .unwrap_or_default()
    }

    pub fn finalize(&self, utterance_id: UtteranceId) {
        let mut inner = self.inner.lock();
        if let Some(b) = inner.buffers.get_mut(&utterance_id) {
            b.active = false;
        }
    }

    pub fn remove(&self, utterance_id: UtteranceId) {
        self.inner.lock().buffers.remove(&utterance_id);
    }

    pub fn set_active(&self, utterance_id: UtteranceId, active: bool) {
        if let Some(b) = self.inner.lock().buffers.get_mut(&utterance_id) {
            b.active = active;
        }
    }

    pub fn is_active(&self, utterance_id: UtteranceId) -> bool {
        self.inner
            .lock()
            .buffers
            .get(&utterance_id)
            .map(|b| b.active)
            .unwrap_or(false)
    }

    pub fn has_utterance(&self, utterance_id: UtteranceId) -> bool {
        self.inner.lock().buffers.contains_key(&utterance_id)
    }

    pub fn get_active_utterances(&self) -> Vec<UtteranceId> {
        self.inner
            .lock()
            .buffers
            .iter()
            .filter(|(_, b)| b.active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get_utterance_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    fn maybe_cleanup(&self, inner: &mut Inner, current_mem_mb: f64) {
        let elapsed = inner.last_cleanup.elapsed();
        let over_budget = current_mem_mb > self.budget_mb();
        if elapsed < Duration::from_millis(self.config.cleanup_interval_ms) && !over_budget {
            return;
        }
        inner.last_cleanup = Instant::now();
        self.evict_idle(inner);
        self.evict_inactive(inner);
        let mem_after = Self::memory_mb(&inner.buffers);
        if mem_after > self.budget_mb() {
            self.evict_aggressive(inner);
        }
    }

    fn evict_idle(&self, inner: &mut Inner) {
        let max_idle = Duration::from_millis(self.config.max_idle_ms);
        let now = Instant::now();
        let stale: Vec<UtteranceId> = inner
            .buffers
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_access_time) > max_idle)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            inner.buffers.remove(&id);
        }
    }

    fn evict_inactive(&self, inner: &mut Inner) {
        let inactive: Vec<UtteranceId> = inner
            .buffers
            .iter()
            .filter(|(_, b)| !b.active)
            .map(|(id, _)| *id)
            .collect();
        for id in inactive {
            inner.buffers.remove(&id);
        }
    }

    fn evict_aggressive(&self, inner: &mut Inner) {
        let n = inner.buffers.len();
        if n == 0 {
            return;
        }
        let evict_count = ((n as f64) * AGGRESSIVE_EVICTION_FRACTION).ceil() as usize;
        let mut by_access: Vec<(UtteranceId, Instant)> =
            inner.buffers.iter().map(|(id, b)| (*id, b.last_access_time)).collect();
        by_access.sort_by_key(|(_, t)| *t);
        for (id, _) in by_access.into_iter().take(evict_count) {
            warn!(utterance_id = id, "aggressive eviction under memory pressure");
            inner.buffers.remove(&id);
        }
    }

    pub fn cleanup_old(&self) {
        let mut inner = self.inner.lock();
        self.evict_idle(&mut inner);
    }

    pub fn cleanup_inactive(&self) {
        let mut inner = self.inner.lock();
        self.evict_inactive(&mut inner);
    }

    pub fn force_cleanup(&self) {
        self.inner.lock().buffers.clear();
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        let total_utterances = inner.buffers.len();
        let active_count = inner.buffers.values().filter(|b| b.active).count();
        let current_memory_mb = Self::memory_mb(&inner.buffers);
        let total_samples: u64 = inner.buffers.values().map(|b| b.data.len() as u64).sum();
        let dropped_samples: u64 = inner.buffers.values().map(|b| b.dropped_samples).sum();
        let budget = self.budget_mb();
        let utilization = if budget > 0.0 { current_memory_mb / budget } else { 0.0 };
        BufferStats {
            total_utterances,
            active_count,
            current_memory_mb,
            peak_memory_mb: inner.peak_memory_mb,
            total_samples,
            dropped_samples,
            utilization,
        }
    }

    pub fn is_healthy(&self) -> bool {
        Self::memory_mb(&self.inner.lock().buffers) <= 0.9 * self.budget_mb()
    }

    pub fn health_status(&self) -> String {
        let stats = self.stats();
        format!(
            "{} utterances ({} active), {:.2}/{:.2} MB ({:.1}% utilized)",
            stats.total_utterances,
            stats.active_count,
            stats.current_memory_mb,
            self.budget_mb(),
            stats.utilization * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_utterances: usize, per_buffer_mb: usize, circular: bool) -> AudioBufferManager {
        AudioBufferManager::new(BufferConfig {
            max_utterances,
            default_max_buffer_mb: per_buffer_mb,
            max_idle_ms: 60_000,
            cleanup_interval_ms: 1_000_000, // disable opportunistic cleanup in these tests
            circular,
        })
    }

    #[test]
    fn non_circular_read_all_is_prefix_and_counts_drops() {
        let mgr = manager(4, 1, false);
        // 1 MB / 4 bytes = 262144 samples capacity.
        let cap = max_samples_for(1);
        mgr.create(1, None);
        let chunk = vec![1.0f32; cap - 10];
        assert!(mgr.add(1, &chunk));
        let overflow = vec![2.0f32; 20];
        assert!(!mgr.add(1, &overflow));
        let all = mgr.read_all(1);
        assert_eq!(all.len(), cap);
        assert_eq!(mgr.stats().dropped_samples, 10);
    }

    #[test]
    fn circular_buffer_returns_last_max_samples_in_order() {
        let mgr = manager(4, 1, true);
        let cap = max_samples_for(1);
        mgr.create(1, None);
        // Fill exactly to capacity with increasing values, then wrap with a marker tail.
        let base: Vec<f32> = (0..cap as i64).map(|i| i as f32).collect();
        assert!(mgr.add(1, &base));
        let tail = vec![-1.0f32, -2.0, -3.0];
        assert!(mgr.add(1, &tail));
        let all = mgr.read_all(1);
        assert_eq!(all.len(), cap);
        assert_eq!(&all[all.len() - 3..], &tail[..]);
        // oldest 3 samples (0.0, 1.0, 2.0) should have been evicted from the front
        assert_eq!(all[0], 3.0);
    }

    #[test]
    fn eviction_makes_room_for_new_utterance_by_oldest_access() {
        let mgr = manager(5, 1, true);
        for id in 1..=5u32 {
            mgr.create(id, None);
            mgr.add(id, &[0.0]);
        }
        // id=1 is now the oldest by last_access_time.
        assert!(mgr.create(6, None));
        assert!(!mgr.has_utterance(1));
        assert!(mgr.has_utterance(6));
    }

    #[test]
    fn missing_utterance_reads_are_empty() {
        let mgr = manager(4, 1, true);
        assert!(mgr.read_all(99).is_empty());
        assert!(mgr.read_recent(99, 10).is_empty());
    }

    #[test]
    fn inactive_utterance_drops_everything() {
        let mgr = manager(4, 1, true);
        mgr.create(1, None);
        mgr.set_active(1, false);
        assert!(!mgr.add(1, &[1.0, 2.0, 3.0]));
        assert_eq!(mgr.stats().dropped_samples, 3);
    }

    #[test]
    fn force_cleanup_evicts_everything() {
        let mgr = manager(4, 1, true);
        mgr.create(1, None);
        mgr.create(2, None);
        mgr.force_cleanup();
        assert_eq!(mgr.get_utterance_count(), 0);
    }
}
