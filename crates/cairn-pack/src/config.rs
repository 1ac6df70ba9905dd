use serde::{Deserialize, Serialize};

/// Default number of segments allowed to hold an open data handle.
pub const DEFAULT_MAX_OPEN_SEGMENTS: usize = 128;
/// Default budget for resident window bytes (10 MiB).
pub const DEFAULT_MAX_CACHED_BYTES: u64 = 10 * 1024 * 1024;
/// Default window size (8 KiB).
pub const DEFAULT_WINDOW_SIZE: u64 = 8 * 1024;

/// Bounds for a [`WindowCache`](crate::WindowCache).
///
/// Every field can be changed on a live cache through
/// [`WindowCache::reconfigure`](crate::WindowCache::reconfigure).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowCacheConfig {
    /// Maximum number of segments with an open data handle.
    pub max_open_segments: usize,
    /// Maximum bytes of window data kept resident.
    pub max_cached_bytes: u64,
    /// Size of one window. Rounded up to a power of two.
    pub window_size: u64,
}

impl Default for WindowCacheConfig {
    fn default() -> Self {
        Self {
            max_open_segments: DEFAULT_MAX_OPEN_SEGMENTS,
            max_cached_bytes: DEFAULT_MAX_CACHED_BYTES,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl WindowCacheConfig {
    pub fn with_max_open_segments(mut self, n: usize) -> Self {
        self.max_open_segments = n;
        self
    }

    pub fn with_max_cached_bytes(mut self, bytes: u64) -> Self {
        self.max_cached_bytes = bytes;
        self
    }

    pub fn with_window_size(mut self, bytes: u64) -> Self {
        self.window_size = bytes;
        self
    }

    /// Clamp every bound to something the cache can honour: at least one open
    /// segment, at least one byte of budget, and a power-of-two window.
    pub fn normalized(&self) -> Self {
        Self {
            max_open_segments: self.max_open_segments.max(1),
            max_cached_bytes: self.max_cached_bytes.max(1),
            window_size: self.window_size.max(1).next_power_of_two(),
        }
    }
}
