//! Hashing primitives for the Cairn object store.
//!
//! Provides domain-separated BLAKE3 hashing for object identities and pack
//! names, and a streaming checksum used for pack and index trailers.
//!
//! All operations wrap the `blake3` crate; there is no custom cryptography.

pub mod hasher;

pub use hasher::{ChecksumWriter, ContentHasher};
