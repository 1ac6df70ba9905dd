//! Loose-object storage for the Cairn object store.
//!
//! Loose objects are the lowest-priority source consulted by the pack
//! directory, and the place new objects land before they are packed. Every
//! object is immutable and identified by the BLAKE3 hash of its kind-tagged
//! content.
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectStore`] trait:
//!
//! - [`InMemoryObjectStore`] -- `HashMap`-based store for tests and embedding
//! - [`LooseObjectStore`] -- one compressed file per object under a fan-out directory
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written (content-addressing guarantees this).
//! 2. Writes become visible atomically: an object is either absent or complete.
//! 3. Concurrent reads are always safe.
//! 4. The store never interprets object contents beyond the kind tag.
//! 5. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod loose;
pub mod memory;
pub mod object;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use loose::LooseObjectStore;
pub use memory::InMemoryObjectStore;
pub use object::{ObjectKind, StoredObject};
pub use traits::ObjectStore;
