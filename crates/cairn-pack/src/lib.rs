//! Pack storage for the Cairn object store.
//!
//! Objects are written in batches into immutable, content-named packs and
//! read back through a bounded, shared window cache. Packs may appear,
//! disappear or be replaced on disk at any time; readers notice, drop what
//! went stale and find the object wherever it lives now.
//!
//! # Architecture
//!
//! - **Pack file** (`.pack`): header, zstd-compressed entries, BLAKE3 trailer
//! - **Pack index** (`.idx`): fan-out table + sorted ids, CRC32s and offsets
//! - [`PackWriter`]: builds a pack and publishes it atomically
//! - [`WindowCache`]: LRU of file windows with open-handle and byte budgets
//! - [`PackSegment`]: one pack as seen by this process, with staleness checks
//! - [`ObjectDirectory`]: snapshot of the pack directory plus a loose store
//! - [`ObjectLoader`]: lazy, per-instance access to one object's bytes
//! - [`RevWalk`]: typed lookups that treat an absent object as an error

pub mod config;
pub mod directory;
pub mod entry;
pub mod error;
pub mod index;
pub mod loader;
pub mod segment;
pub mod walk;
pub mod window;
pub mod writer;

pub use config::WindowCacheConfig;
pub use directory::{ObjectDirectory, PackSnapshot};
pub use entry::{EntryHeader, PackEntry};
pub use error::{PackError, PackResult};
pub use index::PackIndex;
pub use loader::{ObjectLoader, ObjectSource};
pub use segment::{PackSegment, SegmentKey};
pub use walk::{ObjectHandle, RevWalk};
pub use window::{CacheStats, Window, WindowCache};
pub use writer::{PackFile, PackWriter};
