use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use cairn_crypto::{ChecksumWriter, ContentHasher};
use cairn_types::ObjectId;

use crate::error::{PackError, PackResult};

/// Magic bytes opening every pack index file.
pub const INDEX_MAGIC: &[u8; 4] = b"CIDX";
/// Current index format version.
pub const INDEX_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;
const FAN_OUT_LEN: usize = 256 * 4;
/// Data length + pack checksum + index checksum.
const TRAILER_LEN: usize = 8 + 32 + 32;

/// Pack index for fast random-access lookups.
///
/// Layout:
/// - Magic `CIDX` and version
/// - Fan-out table: 256 entries counting objects with first byte <= index
/// - Sorted ObjectId array
/// - CRC32 array (parallel, over each entry's compressed payload)
/// - Offset array (parallel)
/// - Expected length of the data file
/// - Pack checksum (equal to the data file's trailer)
/// - BLAKE3 checksum of all preceding index bytes
///
/// The object count, data length and pack checksum let a reader confirm that
/// a data file still belongs to this index before trusting any offset in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackIndex {
    pub fan_out: [u32; 256],
    pub object_ids: Vec<ObjectId>,
    pub crc32s: Vec<u32>,
    pub offsets: Vec<u64>,
    pub data_len: u64,
    pub pack_checksum: [u8; 32],
}

impl PackIndex {
    /// Build an index from (id, crc32, offset) entries and the data file's
    /// length and checksum.
    pub fn build(
        mut entries: Vec<(ObjectId, u32, u64)>,
        data_len: u64,
        pack_checksum: [u8; 32],
    ) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut counts = [0u32; 256];
        let mut object_ids = Vec::with_capacity(entries.len());
        let mut crc32s = Vec::with_capacity(entries.len());
        let mut offsets = Vec::with_capacity(entries.len());

        for (id, crc, offset) in &entries {
            counts[id.first_byte() as usize] += 1;
            object_ids.push(*id);
            crc32s.push(*crc);
            offsets.push(*offset);
        }

        let mut fan_out = [0u32; 256];
        let mut running = 0u32;
        for (slot, count) in fan_out.iter_mut().zip(counts) {
            running += count;
            *slot = running;
        }

        Self {
            fan_out,
            object_ids,
            crc32s,
            offsets,
            data_len,
            pack_checksum,
        }
    }

    /// Look up an object's (offset, crc32) by ID.
    pub fn lookup(&self, id: &ObjectId) -> Option<(u64, u32)> {
        let first_byte = id.first_byte() as usize;
        let start = if first_byte == 0 {
            0
        } else {
            self.fan_out[first_byte - 1] as usize
        };
        let end = self.fan_out[first_byte] as usize;

        let range = self.object_ids.get(start..end)?;
        let pos = range.binary_search(id).ok()?;
        let idx = start + pos;
        Some((self.offsets[idx], self.crc32s[idx]))
    }

    /// Total object count.
    pub fn object_count(&self) -> usize {
        self.object_ids.len()
    }

    /// Check if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lookup(id).is_some()
    }

    /// Stream the serialized index into `out`, ending with its own checksum.
    pub fn write_to<W: Write>(&self, out: W) -> io::Result<W> {
        let mut w = ChecksumWriter::new(out);
        w.write_all(INDEX_MAGIC)?;
        w.write_all(&INDEX_VERSION.to_be_bytes())?;
        for &count in &self.fan_out {
            w.write_all(&count.to_be_bytes())?;
        }
        for id in &self.object_ids {
            w.write_all(id.as_bytes())?;
        }
        for &crc in &self.crc32s {
            w.write_all(&crc.to_be_bytes())?;
        }
        for &offset in &self.offsets {
            w.write_all(&offset.to_be_bytes())?;
        }
        w.write_all(&self.data_len.to_be_bytes())?;
        w.write_all(&self.pack_checksum)?;
        let (_, out) = w.finish()?;
        Ok(out)
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let capacity = HEADER_LEN + FAN_OUT_LEN + self.object_count() * 44 + TRAILER_LEN;
        // Writing into a Vec cannot fail.
        self.write_to(Vec::with_capacity(capacity)).unwrap_or_default()
    }

    /// Deserialize from bytes, verifying the index checksum and the fan-out.
    pub fn from_bytes(data: &[u8]) -> PackResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(PackError::IndexCorrupted("too short".into()));
        }
        if &data[0..4] != INDEX_MAGIC {
            return Err(PackError::InvalidMagic {
                expected: String::from_utf8_lossy(INDEX_MAGIC).into(),
                actual: String::from_utf8_lossy(&data[0..4]).into(),
            });
        }
        let version = read_u32(data, 4);
        if version != INDEX_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        if data.len() < HEADER_LEN + FAN_OUT_LEN + TRAILER_LEN {
            return Err(PackError::IndexCorrupted("fan-out truncated".into()));
        }

        let body_len = data.len() - 32;
        if ContentHasher::raw_hash(&data[..body_len]) != data[body_len..] {
            return Err(PackError::IndexCorrupted("index checksum mismatch".into()));
        }

        let mut pos = HEADER_LEN;
        let mut fan_out = [0u32; 256];
        for entry in &mut fan_out {
            *entry = read_u32(data, pos);
            pos += 4;
        }
        if fan_out.windows(2).any(|w| w[0] > w[1]) {
            return Err(PackError::IndexCorrupted("fan-out not monotonic".into()));
        }

        let count = fan_out[255] as usize;
        let needed = HEADER_LEN + FAN_OUT_LEN + count * (32 + 4 + 8) + TRAILER_LEN;
        if data.len() != needed {
            return Err(PackError::IndexCorrupted(format!(
                "expected {needed} bytes for {count} objects, found {}",
                data.len()
            )));
        }

        let mut object_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&data[pos..pos + 32]);
            object_ids.push(ObjectId::from_hash(hash));
            pos += 32;
        }
        if object_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PackError::IndexCorrupted("object ids not sorted".into()));
        }

        let mut crc32s = Vec::with_capacity(count);
        for _ in 0..count {
            crc32s.push(read_u32(data, pos));
            pos += 4;
        }

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(read_u64(data, pos));
            pos += 8;
        }

        let data_len = read_u64(data, pos);
        pos += 8;
        let mut pack_checksum = [0u8; 32];
        pack_checksum.copy_from_slice(&data[pos..pos + 32]);

        Ok(Self {
            fan_out,
            object_ids,
            crc32s,
            offsets,
            data_len,
            pack_checksum,
        })
    }

    /// Read an index file from disk.
    pub fn read(path: &Path) -> PackResult<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Read only the pack checksum recorded in an index file's trailer.
    ///
    /// Cheap enough to run on every directory rescan: it touches the last 64
    /// bytes of the file, not the whole index.
    pub fn read_pack_checksum(path: &Path) -> io::Result<[u8; 32]> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < (HEADER_LEN + FAN_OUT_LEN + TRAILER_LEN) as u64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "index too short"));
        }
        file.seek(SeekFrom::Start(len - 64))?;
        let mut checksum = [0u8; 32];
        file.read_exact(&mut checksum)?;
        Ok(checksum)
    }
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[pos..pos + 4]);
    u32::from_be_bytes(buf)
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[pos..pos + 8]);
    u64::from_be_bytes(buf)
}
