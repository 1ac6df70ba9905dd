use std::io::{self, Write};

use cairn_types::ObjectId;

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag (e.g. `"cairn-blob-v1"`) that is
/// prepended to every hash computation, so a blob and a tree with identical
/// bytes never share an identity.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for blob objects.
    pub const BLOB: Self = Self {
        domain: "cairn-blob-v1",
    };
    /// Hasher for tree objects.
    pub const TREE: Self = Self {
        domain: "cairn-tree-v1",
    };
    /// Hasher for commit objects.
    pub const COMMIT: Self = Self {
        domain: "cairn-commit-v1",
    };
    /// Hasher for tag objects.
    pub const TAG: Self = Self {
        domain: "cairn-tag-v1",
    };
    /// Hasher for pack names, fed the sorted ids of the packed objects.
    pub const PACK_NAME: Self = Self {
        domain: "cairn-pack-name-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> ObjectId {
        let mut hasher = self.begin();
        hasher.update(data);
        ObjectId::from_hash(*hasher.finalize().as_bytes())
    }

    /// Hash a sequence of object ids in the given order.
    ///
    /// Callers wanting an order-independent result sort the ids first.
    pub fn hash_ids<'a, I>(&self, ids: I) -> ObjectId
    where
        I: IntoIterator<Item = &'a ObjectId>,
    {
        let mut hasher = self.begin();
        for id in ids {
            hasher.update(id.as_bytes());
        }
        ObjectId::from_hash(*hasher.finalize().as_bytes())
    }

    /// Verify that data produces the expected object ID.
    pub fn verify(&self, data: &[u8], expected: &ObjectId) -> bool {
        self.hash(data) == *expected
    }

    /// Raw BLAKE3 hash without domain separation, used for file checksums.
    pub fn raw_hash(data: &[u8]) -> [u8; 32] {
        *blake3::hash(data).as_bytes()
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }

    fn begin(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher
    }
}

/// Writer adapter that checksums and counts everything passing through it.
///
/// Pack and index files end with the raw BLAKE3 hash of all preceding bytes;
/// wrapping the output in a `ChecksumWriter` lets them be streamed without
/// buffering the whole file.
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Checksum of everything written so far.
    pub fn checksum(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }

    /// Append the checksum of everything written so far, unhashed, and return
    /// it together with the inner writer.
    pub fn finish(mut self) -> io::Result<([u8; 32], W)> {
        let checksum = self.checksum();
        self.inner.write_all(&checksum)?;
        self.inner.flush()?;
        Ok((checksum, self.inner))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let id1 = ContentHasher::BLOB.hash(b"hello world");
        let id2 = ContentHasher::BLOB.hash(b"hello world");
        assert_eq!(id1, id2);
    }

    #[test]
    fn different_domains_produce_different_hashes() {
        let data = b"same content";
        let blob = ContentHasher::BLOB.hash(data);
        let tree = ContentHasher::TREE.hash(data);
        let commit = ContentHasher::COMMIT.hash(data);
        let tag = ContentHasher::TAG.hash(data);
        assert_ne!(blob, tree);
        assert_ne!(blob, commit);
        assert_ne!(commit, tag);
    }

    #[test]
    fn verify_detects_tampering() {
        let id = ContentHasher::BLOB.hash(b"original");
        assert!(ContentHasher::BLOB.verify(b"original", &id));
        assert!(!ContentHasher::BLOB.verify(b"tampered", &id));
    }

    #[test]
    fn hash_ids_depends_on_order() {
        let a = ContentHasher::BLOB.hash(b"a");
        let b = ContentHasher::BLOB.hash(b"b");
        let ab = ContentHasher::PACK_NAME.hash_ids([&a, &b]);
        let ba = ContentHasher::PACK_NAME.hash_ids([&b, &a]);
        assert_ne!(ab, ba);
        assert_eq!(ab, ContentHasher::PACK_NAME.hash_ids(&[a, b]));
    }

    #[test]
    fn checksum_writer_matches_raw_hash() {
        let mut w = ChecksumWriter::new(Vec::new());
        w.write_all(b"pack ").unwrap();
        w.write_all(b"bytes").unwrap();
        assert_eq!(w.position(), 10);
        let (sum, out) = w.finish().unwrap();
        assert_eq!(sum, ContentHasher::raw_hash(b"pack bytes"));
        assert_eq!(&out[..10], b"pack bytes");
        assert_eq!(&out[10..], &sum);
    }
}
