//! Process-wide counters for decode failures and cache effectiveness.
//!
//! These are fire-and-forget: nothing in the crate reads them back to make a
//! decision.

use std::sync::atomic::{AtomicU64, Ordering};

static SIZE_MISMATCH: AtomicU64 = AtomicU64::new(0);
static OUT_OF_RANGE: AtomicU64 = AtomicU64::new(0);
static CHECKSUM_MISMATCH: AtomicU64 = AtomicU64::new(0);
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static FETCHES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub size_mismatch: u64,
    pub out_of_range: u64,
    pub checksum_mismatch: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fetches: u64,
}

pub(crate) fn record_size_mismatch() {
    SIZE_MISMATCH.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_out_of_range() {
    OUT_OF_RANGE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_checksum_mismatch() {
    CHECKSUM_MISMATCH.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_hit() {
    CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_miss() {
    CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_fetch() {
    FETCHES.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        size_mismatch: SIZE_MISMATCH.load(Ordering::Relaxed),
        out_of_range: OUT_OF_RANGE.load(Ordering::Relaxed),
        checksum_mismatch: CHECKSUM_MISMATCH.load(Ordering::Relaxed),
        cache_hits: CACHE_HITS.load(Ordering::Relaxed),
        cache_misses: CACHE_MISSES.load(Ordering::Relaxed),
        fetches: FETCHES.load(Ordering::Relaxed),
    }
}

impl StatsSnapshot {
    /// Hit ratio over all cache lookups so far, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
