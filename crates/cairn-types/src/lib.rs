//! Foundation types for the Cairn object store.
//!
//! Every other Cairn crate depends on `cairn-types`. The crate is kept free of
//! hashing code: an [`ObjectId`] is only a fixed-width key here, and the
//! hashing that produces one lives in `cairn-crypto`.
//!
//! # Key Types
//!
//! - [`ObjectId`]: 32-byte content-addressed identifier, the only lookup key
//! - [`TypeError`]: parse failures for identifiers

pub mod error;
pub mod object;

pub use error::TypeError;
pub use object::ObjectId;
