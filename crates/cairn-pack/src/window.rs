use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::WindowCacheConfig;
use crate::error::{PackError, PackResult};
use crate::segment::{PackSegment, SegmentKey};

/// One aligned slice of a pack data file held in memory.
#[derive(Debug)]
pub struct Window {
    start: u64,
    data: Vec<u8>,
}

impl Window {
    /// Pack offset of the first byte in this window.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Pack offset one past the last byte in this window.
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.end()
    }

    /// Bytes from pack offset `pos` to the end of the window.
    pub fn slice_from(&self, pos: u64) -> &[u8] {
        if !self.contains(pos) {
            return &[];
        }
        &self.data[(pos - self.start) as usize..]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct WindowKey {
    segment: SegmentKey,
    start: u64,
}

/// Bookkeeping for a segment the cache considers open.
struct OpenSegment {
    segment: Weak<PackSegment>,
    windows: usize,
}

struct CacheState {
    config: WindowCacheConfig,
    windows: LruCache<WindowKey, Arc<Window>>,
    open: LruCache<SegmentKey, OpenSegment>,
    resident_bytes: u64,
}

impl CacheState {
    /// Drop every window belonging to `key`, returning how many went.
    fn drop_windows_of(&mut self, key: SegmentKey) -> usize {
        let keys: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(k, _)| k.segment == key)
            .map(|(k, _)| *k)
            .collect();
        for k in &keys {
            if let Some(w) = self.windows.pop(k) {
                self.resident_bytes = self.resident_bytes.saturating_sub(w.len() as u64);
            }
        }
        keys.len()
    }

    /// Mark `segment` as most recently used in the open table.
    fn touch_open(&mut self, segment: &Arc<PackSegment>) -> &mut OpenSegment {
        self.open.get_or_insert_mut(segment.key(), || OpenSegment {
            segment: Arc::downgrade(segment),
            windows: 0,
        })
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
}

/// Point-in-time statistics of a [`WindowCache`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Windows dropped to honour the byte budget.
    pub evictions: u64,
    /// Data handles opened by segments reading through this cache.
    pub opens: u64,
    /// Segments closed by the cache (handle budget, last window, purge).
    pub closes: u64,
    pub open_segments: usize,
    pub resident_windows: usize,
    pub resident_bytes: u64,
}

/// Bounded LRU cache of windows into pack data files.
///
/// Multiplexes at most `max_open_segments` open data handles and at most
/// `max_cached_bytes` of resident windows across any number of segments.
/// Evicting the last window of a segment, or pushing a segment out of the
/// open-segment budget, closes its handle; the next read through the segment
/// reopens it. Cache pressure never turns into a read error.
///
/// Locking: the state mutex is never held across file I/O or while calling
/// into a segment. Segments are closed after the mutex is released, but
/// before the operation that evicted them returns.
///
/// The cache is an ordinary value. Share it through an `Arc` between the
/// directories and segments that should compete for the same budget, or
/// build separate instances for isolation.
pub struct WindowCache {
    state: Mutex<CacheState>,
    counters: Counters,
}

impl WindowCache {
    pub fn new(config: WindowCacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                config: config.normalized(),
                windows: LruCache::unbounded(),
                open: LruCache::unbounded(),
                resident_bytes: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// The configuration currently enforced.
    pub fn config(&self) -> WindowCacheConfig {
        self.state.lock().config.clone()
    }

    /// Apply new bounds immediately.
    ///
    /// Excess segments are closed oldest-first and excess windows dropped
    /// before this returns. Changing the window size drops every window.
    pub fn reconfigure(&self, config: WindowCacheConfig) {
        let config = config.normalized();
        let closing = {
            let mut state = self.state.lock();
            let mut closing = Vec::new();
            if state.config.window_size != config.window_size {
                state.windows.clear();
                state.resident_bytes = 0;
                while let Some((_, open)) = state.open.pop_lru() {
                    closing.extend(open.segment.upgrade());
                }
            }
            debug!(
                max_open_segments = config.max_open_segments,
                max_cached_bytes = config.max_cached_bytes,
                window_size = config.window_size,
                "window cache reconfigured"
            );
            state.config = config;
            closing.extend(self.enforce(&mut state));
            closing
        };
        self.close_segments(closing);
    }

    /// Return the window of `segment` containing pack offset `pos`, loading
    /// it from disk on a miss.
    pub fn get(&self, segment: &Arc<PackSegment>, pos: u64) -> PackResult<Arc<Window>> {
        if !segment.is_valid() {
            return Err(PackError::CorruptSegment {
                name: segment.name().short_hex(),
                reason: "segment was invalidated".into(),
            });
        }
        if pos >= segment.data_len() {
            return Err(PackError::CorruptEntry {
                offset: pos,
                reason: "read beyond end of pack data".into(),
            });
        }

        let window_size = {
            let mut state = self.state.lock();
            let window_size = state.config.window_size;
            let key = WindowKey {
                segment: segment.key(),
                start: align_down(pos, window_size),
            };
            if let Some(window) = state.windows.get(&key).cloned() {
                state.open.promote(&key.segment);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(window);
            }
            window_size
        };

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let start = align_down(pos, window_size);
        let len = window_size.min(segment.data_len() - start);
        let data = segment.load_window(start, len)?;
        trace!(pack = %segment.name().short_hex(), start, len, "loaded window");
        let loaded = Arc::new(Window { start, data });

        let (window, closing) = {
            let mut state = self.state.lock();
            let key = WindowKey {
                segment: segment.key(),
                start,
            };
            let window = if !segment.is_valid() {
                // Purged while loading.
                loaded
            } else if state.config.window_size != window_size {
                // Resized while loading: hand the window out, keep it out of the table.
                state.touch_open(segment);
                loaded
            } else if let Some(existing) = state.windows.get(&key).cloned() {
                state.touch_open(segment);
                existing
            } else {
                state.touch_open(segment).windows += 1;
                state.resident_bytes += loaded.len() as u64;
                state.windows.put(key, Arc::clone(&loaded));
                loaded
            };
            let closing = self.enforce(&mut state);
            (window, closing)
        };
        self.close_segments(closing);
        Ok(window)
    }

    /// Copy `len` bytes starting at pack offset `pos`, spanning as many
    /// windows as needed.
    pub fn read(&self, segment: &Arc<PackSegment>, pos: u64, len: u64) -> PackResult<Vec<u8>> {
        let end = pos
            .checked_add(len)
            .filter(|&end| end <= segment.data_len())
            .ok_or_else(|| PackError::CorruptEntry {
                offset: pos,
                reason: format!("range of {len} bytes extends beyond pack data"),
            })?;

        let mut out = Vec::with_capacity(len as usize);
        let mut cur = pos;
        while cur < end {
            let window = self.get(segment, cur)?;
            let available = window.slice_from(cur);
            let take = available.len().min((end - cur) as usize);
            if take == 0 {
                return Err(PackError::CorruptEntry {
                    offset: cur,
                    reason: "window does not cover requested offset".into(),
                });
            }
            out.extend_from_slice(&available[..take]);
            cur += take as u64;
        }
        Ok(out)
    }

    /// Forget every window of `segment` and its open-table entry.
    pub fn purge(&self, segment: &PackSegment) {
        let mut state = self.state.lock();
        let dropped = state.drop_windows_of(segment.key());
        state.open.pop(&segment.key());
        if dropped > 0 {
            debug!(pack = %segment.name().short_hex(), windows = dropped, "purged windows");
        }
    }

    /// Drop every window and close every segment.
    pub fn close_all(&self) {
        let closing = {
            let mut state = self.state.lock();
            state.windows.clear();
            state.resident_bytes = 0;
            let mut closing = Vec::new();
            while let Some((_, open)) = state.open.pop_lru() {
                closing.extend(open.segment.upgrade());
            }
            closing
        };
        self.close_segments(closing);
    }

    /// Number of segments the cache currently counts as open.
    pub fn open_segment_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Bytes of window data currently resident.
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            opens: self.counters.opens.load(Ordering::Relaxed),
            closes: self.counters.closes.load(Ordering::Relaxed),
            open_segments: state.open.len(),
            resident_windows: state.windows.len(),
            resident_bytes: state.resident_bytes,
        }
    }

    pub(crate) fn record_open(&self) {
        self.counters.opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Bring the state back within bounds. Returns the segments whose
    /// handles must be closed once the state lock is released.
    fn enforce(&self, state: &mut CacheState) -> Vec<Arc<PackSegment>> {
        let mut closing = Vec::new();

        while state.resident_bytes > state.config.max_cached_bytes {
            let Some((key, window)) = state.windows.pop_lru() else {
                state.resident_bytes = 0;
                break;
            };
            state.resident_bytes = state.resident_bytes.saturating_sub(window.len() as u64);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);

            let last = match state.open.peek_mut(&key.segment) {
                Some(open) => {
                    open.windows = open.windows.saturating_sub(1);
                    open.windows == 0
                }
                None => false,
            };
            if last {
                if let Some(open) = state.open.pop(&key.segment) {
                    closing.extend(open.segment.upgrade());
                }
            }
        }

        while state.open.len() > state.config.max_open_segments {
            let Some((key, open)) = state.open.pop_lru() else {
                break;
            };
            state.drop_windows_of(key);
            closing.extend(open.segment.upgrade());
        }

        closing
    }

    fn close_segments(&self, closing: Vec<Arc<PackSegment>>) {
        for segment in closing {
            segment.close();
            self.counters.closes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for WindowCache {
    fn default() -> Self {
        Self::new(WindowCacheConfig::default())
    }
}

impl std::fmt::Debug for WindowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WindowCache")
            .field("config", &state.config)
            .field("open_segments", &state.open.len())
            .field("resident_bytes", &state.resident_bytes)
            .finish()
    }
}

fn align_down(pos: u64, window_size: u64) -> u64 {
    pos & !(window_size - 1)
}
