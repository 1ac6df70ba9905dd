use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cairn_crypto::ChecksumWriter;
use cairn_store::{ObjectKind, StoredObject};
use cairn_types::ObjectId;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::entry::{
    EntryHeader, MAX_ENTRY_HEADER_LEN, PACK_HEADER_LEN, PACK_MAGIC, PACK_TRAILER_LEN, PACK_VERSION,
};
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::window::WindowCache;
use crate::writer::parse_pack_name;

/// Process-unique identity of a segment instance, used as the cache key.
///
/// Two segments opened on the same path (for example after the file was
/// replaced) get distinct keys, so windows of the old file can never be
/// served for the new one.
pub type SegmentKey = u64;

static NEXT_SEGMENT_KEY: AtomicU64 = AtomicU64::new(1);

/// Read-only data handle. Positioned reads let many windows load
/// concurrently from one handle.
struct DataFile {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: Mutex<File>,
}

impl DataFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        #[cfg(unix)]
        return Ok(Self { file });
        #[cfg(not(unix))]
        return Ok(Self { file: Mutex::new(file) });
    }

    fn len(&self) -> io::Result<u64> {
        #[cfg(unix)]
        return Ok(self.file.metadata()?.len());
        #[cfg(not(unix))]
        return Ok(self.file.lock().metadata()?.len());
    }

    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, pos)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom};
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(buf)
        }
    }
}

/// One immutable pack (data file plus index) as seen by this process.
///
/// The index is loaded once at open. The data file is read through the
/// shared [`WindowCache`] and its handle is opened lazily, closed when the
/// cache evicts it, and reopened on the next read. Every time the handle is
/// (re)opened, and every time a window is loaded, the file on disk is
/// cross-checked against the loaded index; a mismatch means the pack was
/// overwritten in place or truncated, and the segment invalidates itself.
///
/// Once invalid a segment never serves another byte. The directory replaces
/// it with a freshly opened segment on its next rescan.
pub struct PackSegment {
    name: ObjectId,
    pack_path: PathBuf,
    index_path: PathBuf,
    index: PackIndex,
    key: SegmentKey,
    handle: Mutex<Option<Arc<DataFile>>>,
    invalid: AtomicBool,
    cache: Arc<WindowCache>,
}

impl PackSegment {
    /// Open the pack at `pack_path` (its index sits next to it with an `idx`
    /// extension) and check that the data file agrees with the index.
    pub fn open(pack_path: &Path, cache: Arc<WindowCache>) -> PackResult<Arc<Self>> {
        let name = parse_pack_name(pack_path).ok_or_else(|| PackError::CorruptSegment {
            name: pack_path.display().to_string(),
            reason: "not a pack file name".into(),
        })?;
        let index_path = pack_path.with_extension("idx");
        let label = name.short_hex();

        let index = PackIndex::read(&index_path).map_err(|e| match e {
            PackError::Io(io) if io.kind() == io::ErrorKind::NotFound => PackError::SegmentMissing {
                name: label.clone(),
            },
            PackError::Io(io) => PackError::Io(io),
            other => PackError::CorruptSegment {
                name: label.clone(),
                reason: format!("unreadable index: {other}"),
            },
        })?;

        let segment = Arc::new(Self {
            name,
            pack_path: pack_path.to_path_buf(),
            index_path,
            index,
            key: NEXT_SEGMENT_KEY.fetch_add(1, Ordering::Relaxed),
            handle: Mutex::new(None),
            invalid: AtomicBool::new(false),
            cache,
        });
        // Validate eagerly; the handle is opened again on first read.
        segment.open_data()?;
        debug!(
            pack = %label,
            objects = segment.index.object_count(),
            bytes = segment.index.data_len,
            "opened pack segment"
        );
        Ok(segment)
    }

    pub fn name(&self) -> &ObjectId {
        &self.name
    }

    pub fn key(&self) -> SegmentKey {
        self.key
    }

    pub fn pack_path(&self) -> &Path {
        &self.pack_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Length of the data file the index was built for.
    pub fn data_len(&self) -> u64 {
        self.index.data_len
    }

    pub fn object_count(&self) -> usize {
        self.index.object_count()
    }

    pub fn object_ids(&self) -> &[ObjectId] {
        &self.index.object_ids
    }

    /// Offset and CRC of `id`'s entry, from the in-memory index only.
    pub fn lookup(&self, id: &ObjectId) -> Option<(u64, u32)> {
        self.index.lookup(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    /// Whether the segment holds an open data handle right now.
    pub fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }

    /// Cheap staleness check: does the index on disk still describe the pack
    /// this segment loaded? Reads only the index trailer.
    pub fn matches_disk(&self) -> bool {
        match PackIndex::read_pack_checksum(&self.index_path) {
            Ok(checksum) => checksum == self.index.pack_checksum,
            Err(_) => false,
        }
    }

    /// Read and fully verify the object `id`.
    pub fn read_object(self: &Arc<Self>, id: &ObjectId) -> PackResult<Option<StoredObject>> {
        match self.index.lookup(id) {
            Some((offset, crc)) => self.read_entry(id, offset, crc).map(Some),
            None => Ok(None),
        }
    }

    /// Read the entry at `offset`, checking its CRC, inflated size, and that
    /// the content hashes to `id`.
    pub fn read_entry(
        self: &Arc<Self>,
        id: &ObjectId,
        offset: u64,
        crc: u32,
    ) -> PackResult<StoredObject> {
        self.read_entry_unchecked(id, offset, crc).map_err(|e| self.fail(e))
    }

    /// Kind and inflated size of the entry at `offset`, from its header
    /// alone.
    pub fn read_kind(self: &Arc<Self>, offset: u64) -> PackResult<(ObjectKind, u64)> {
        self.read_header(offset)
            .map(|h| (h.kind, h.inflated_size))
            .map_err(|e| self.fail(e))
    }

    /// Hash the whole data file against its trailer, then read back every
    /// entry the index lists.
    pub fn verify(self: &Arc<Self>) -> PackResult<()> {
        self.verify_checksum().map_err(|e| self.fail(e))?;
        for (i, id) in self.index.object_ids.iter().enumerate() {
            self.read_entry(id, self.index.offsets[i], self.index.crc32s[i])?;
        }
        Ok(())
    }

    /// Drop the data handle. The next read reopens it.
    pub fn close(&self) {
        if self.handle.lock().take().is_some() {
            debug!(pack = %self.name.short_hex(), "closed pack segment");
        }
    }

    /// Mark the segment unusable, close it, and purge its windows.
    pub fn invalidate(&self) {
        if !self.invalid.swap(true, Ordering::AcqRel) {
            warn!(
                pack = %self.name.short_hex(),
                path = %self.pack_path.display(),
                "pack segment invalidated"
            );
        }
        self.close();
        self.cache.purge(self);
    }

    /// Load `len` bytes at `start` for the window cache.
    pub(crate) fn load_window(&self, start: u64, len: u64) -> PackResult<Vec<u8>> {
        self.load_window_unchecked(start, len).map_err(|e| self.fail(e))
    }

    fn load_window_unchecked(&self, start: u64, len: u64) -> PackResult<Vec<u8>> {
        let data = self.data_file()?;
        self.check_identity(&data)?;
        let mut buf = vec![0u8; len as usize];
        data.read_exact_at(&mut buf, start).map_err(|e| self.read_error(e))?;
        Ok(buf)
    }

    fn data_file(&self) -> PackResult<Arc<DataFile>> {
        if !self.is_valid() {
            return Err(self.corrupt("segment was invalidated"));
        }
        let mut handle = self.handle.lock();
        if let Some(data) = handle.as_ref() {
            return Ok(Arc::clone(data));
        }
        let data = Arc::new(self.open_data()?);
        *handle = Some(Arc::clone(&data));
        self.cache.record_open();
        Ok(data)
    }

    /// Open the data file and check its header and trailer against the index.
    fn open_data(&self) -> PackResult<DataFile> {
        let data = DataFile::open(&self.pack_path).map_err(|e| self.read_error(e))?;
        let len = data.len()?;
        if len != self.index.data_len {
            return Err(self.corrupt(format!(
                "data file is {len} bytes, index expects {}",
                self.index.data_len
            )));
        }

        let mut header = [0u8; PACK_HEADER_LEN as usize];
        data.read_exact_at(&mut header, 0).map_err(|e| self.read_error(e))?;
        if &header[0..4] != PACK_MAGIC {
            return Err(self.corrupt("bad pack magic"));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != PACK_VERSION {
            return Err(self.corrupt(format!("unsupported pack version {version}")));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if count as usize != self.index.object_count() {
            return Err(self.corrupt(format!(
                "pack holds {count} objects, index lists {}",
                self.index.object_count()
            )));
        }

        self.check_identity(&data)?;
        Ok(data)
    }

    /// Length and trailer checksum must still match the index.
    fn check_identity(&self, data: &DataFile) -> PackResult<()> {
        let len = data.len()?;
        if len != self.index.data_len {
            return Err(self.corrupt(format!("data file changed size to {len} bytes")));
        }
        let mut trailer = [0u8; PACK_TRAILER_LEN as usize];
        data.read_exact_at(&mut trailer, len - PACK_TRAILER_LEN)
            .map_err(|e| self.read_error(e))?;
        if trailer != self.index.pack_checksum {
            return Err(self.corrupt("trailer checksum does not match index"));
        }
        Ok(())
    }

    fn body_end(&self) -> u64 {
        self.index.data_len.saturating_sub(PACK_TRAILER_LEN)
    }

    fn read_header(self: &Arc<Self>, offset: u64) -> PackResult<EntryHeader> {
        let body_end = self.body_end();
        if offset < PACK_HEADER_LEN || offset >= body_end {
            return Err(PackError::CorruptEntry {
                offset,
                reason: "offset outside pack body".into(),
            });
        }
        let len = (MAX_ENTRY_HEADER_LEN as u64).min(body_end - offset);
        let bytes = self.cache.read(self, offset, len)?;
        EntryHeader::parse(&bytes, offset)
    }

    fn read_entry_unchecked(
        self: &Arc<Self>,
        id: &ObjectId,
        offset: u64,
        crc: u32,
    ) -> PackResult<StoredObject> {
        let header = self.read_header(offset)?;
        let payload = header.payload_offset(offset);
        let end = payload.checked_add(header.compressed_size);
        if end.map_or(true, |end| end > self.body_end()) {
            return Err(PackError::CorruptEntry {
                offset,
                reason: "compressed data extends beyond pack".into(),
            });
        }
        let compressed = self.cache.read(self, payload, header.compressed_size)?;

        if crc32fast::hash(&compressed) != crc {
            return Err(PackError::CrcMismatch { id: *id });
        }
        let data = zstd::decode_all(compressed.as_slice())
            .map_err(|e| PackError::DecompressionFailed(e.to_string()))?;
        if data.len() as u64 != header.inflated_size {
            return Err(PackError::CorruptEntry {
                offset,
                reason: format!(
                    "size mismatch: expected {}, got {}",
                    header.inflated_size,
                    data.len()
                ),
            });
        }

        let object = StoredObject::new(header.kind, data);
        if !object.matches_id(id) {
            return Err(self.corrupt(format!(
                "entry at offset {offset} does not hash to {}",
                id.short_hex()
            )));
        }
        Ok(object)
    }

    fn verify_checksum(&self) -> PackResult<()> {
        let file = File::open(&self.pack_path).map_err(|e| self.read_error(e))?;
        let mut body = BufReader::new(file).take(self.body_end());
        let mut hasher = ChecksumWriter::new(io::sink());
        let hashed = io::copy(&mut body, &mut hasher)?;
        if hashed != self.body_end() {
            return Err(self.corrupt("data file shorter than index expects"));
        }
        if hasher.checksum() != self.index.pack_checksum {
            return Err(self.corrupt("content does not match trailer checksum"));
        }
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> PackError {
        PackError::CorruptSegment {
            name: self.name.short_hex(),
            reason: reason.into(),
        }
    }

    fn read_error(&self, err: io::Error) -> PackError {
        match err.kind() {
            io::ErrorKind::NotFound => PackError::SegmentMissing {
                name: self.name.short_hex(),
            },
            io::ErrorKind::UnexpectedEof => self.corrupt("data file truncated"),
            _ => PackError::Io(err),
        }
    }

    /// Segment-local failures invalidate the segment and surface as
    /// `CorruptSegment` or `SegmentMissing`. Other errors pass through.
    fn fail(&self, err: PackError) -> PackError {
        if !err.is_segment_failure() {
            return err;
        }
        debug!(pack = %self.name.short_hex(), error = %err, "pack segment failed");
        self.invalidate();
        match err {
            PackError::CorruptSegment { .. } | PackError::SegmentMissing { .. } => err,
            other => self.corrupt(other.to_string()),
        }
    }
}

impl std::fmt::Debug for PackSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackSegment")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("objects", &self.index.object_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowCacheConfig;
    use crate::writer::{PackFile, PackWriter};
    use std::fs;
    use std::io::{Seek, SeekFrom, Write};

    fn cache() -> Arc<WindowCache> {
        Arc::new(WindowCache::new(WindowCacheConfig::default().with_window_size(64)))
    }

    fn write(dir: &Path, contents: &[&str]) -> PackFile {
        let mut writer = PackWriter::new(dir);
        for c in contents {
            writer.add_stored_object(&StoredObject::blob(c.as_bytes()));
        }
        writer.finish().unwrap()
    }

    fn id_of(content: &str) -> ObjectId {
        StoredObject::blob(content.as_bytes()).compute_id()
    }

    #[test]
    fn reads_objects_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["one", "two", "three"]);
        let seg = PackSegment::open(&file.pack_path, cache()).unwrap();

        assert_eq!(seg.name(), &file.name);
        assert_eq!(seg.object_count(), 3);
        assert!(!seg.is_open());
        for c in ["one", "two", "three"] {
            let obj = seg.read_object(&id_of(c)).unwrap().unwrap();
            assert_eq!(obj.data, c.as_bytes());
            assert_eq!(obj.kind, ObjectKind::Blob);
        }
        assert!(seg.is_open());
        assert!(seg.read_object(&id_of("four")).unwrap().is_none());
    }

    #[test]
    fn read_kind_uses_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["header only"]);
        let seg = PackSegment::open(&file.pack_path, cache()).unwrap();
        let (offset, _) = seg.lookup(&id_of("header only")).unwrap();
        assert_eq!(seg.read_kind(offset).unwrap(), (ObjectKind::Blob, 11));
    }

    #[test]
    fn verify_accepts_intact_pack() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["a", "b"]);
        let seg = PackSegment::open(&file.pack_path, cache()).unwrap();
        seg.verify().unwrap();
        assert!(seg.is_valid());
    }

    #[test]
    fn open_without_index_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["a"]);
        fs::remove_file(&file.index_path).unwrap();
        let err = PackSegment::open(&file.pack_path, cache()).unwrap_err();
        assert!(matches!(err, PackError::SegmentMissing { .. }));
    }

    #[test]
    fn open_rejects_data_that_disagrees_with_index() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["a"]);
        let other = write(dir.path(), &["b", "c"]);
        fs::copy(&other.pack_path, &file.pack_path).unwrap();
        let err = PackSegment::open(&file.pack_path, cache()).unwrap_err();
        assert!(matches!(err, PackError::CorruptSegment { .. }));
    }

    #[test]
    fn deleted_pack_reports_missing_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["gone"]);
        let seg = PackSegment::open(&file.pack_path, cache()).unwrap();
        fs::remove_file(&file.pack_path).unwrap();

        let err = seg.read_object(&id_of("gone")).unwrap_err();
        assert!(matches!(err, PackError::SegmentMissing { .. }));
        assert!(!seg.is_valid());
    }

    #[test]
    fn overwrite_in_place_invalidates_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["a"]);
        let cache = cache();
        let seg = PackSegment::open(&file.pack_path, Arc::clone(&cache)).unwrap();
        seg.read_object(&id_of("a")).unwrap().unwrap();

        let mut writer = PackWriter::new(dir.path());
        writer.add_stored_object(&StoredObject::blob("b"));
        writer.add_stored_object(&StoredObject::blob("a"));
        writer.finish_as(file.name).unwrap();
        assert!(!seg.matches_disk());

        cache.close_all();
        let err = seg.read_object(&id_of("a")).unwrap_err();
        assert!(matches!(err, PackError::CorruptSegment { .. }));
        assert!(!seg.is_valid());
        assert_eq!(cache.stats().resident_windows, 0);

        // Stays dead even though the file is readable.
        assert!(seg.read_object(&id_of("a")).is_err());
    }

    #[test]
    fn same_length_rewrite_is_caught_by_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["xxxx"]);
        let cache = cache();
        let seg = PackSegment::open(&file.pack_path, Arc::clone(&cache)).unwrap();

        let mut f = fs::OpenOptions::new().write(true).open(&file.pack_path).unwrap();
        let len = f.metadata().unwrap().len();
        f.seek(SeekFrom::Start(len - 1)).unwrap();
        f.write_all(&[0xFF ^ file.checksum[31]]).unwrap();
        drop(f);

        let err = seg.read_object(&id_of("xxxx")).unwrap_err();
        assert!(matches!(err, PackError::CorruptSegment { .. }));
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["payload to corrupt"]);
        let seg = PackSegment::open(&file.pack_path, cache()).unwrap();
        let (offset, _) = seg.lookup(&id_of("payload to corrupt")).unwrap();

        let mut raw = fs::read(&file.pack_path).unwrap();
        raw[offset as usize + 4] ^= 0xFF;
        fs::write(&file.pack_path, &raw).unwrap();

        let err = seg.read_object(&id_of("payload to corrupt")).unwrap_err();
        assert!(matches!(err, PackError::CorruptSegment { .. }));
        assert!(!seg.is_valid());
    }

    #[test]
    fn verify_detects_flipped_byte() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["verify me"]);
        let seg = PackSegment::open(&file.pack_path, cache()).unwrap();

        let mut raw = fs::read(&file.pack_path).unwrap();
        raw[13] ^= 0x01;
        fs::write(&file.pack_path, &raw).unwrap();

        assert!(seg.verify().is_err());
        assert!(!seg.is_valid());
    }

    #[test]
    fn reopened_segments_get_fresh_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), &["k"]);
        let c = cache();
        let a = PackSegment::open(&file.pack_path, Arc::clone(&c)).unwrap();
        let b = PackSegment::open(&file.pack_path, c).unwrap();
        assert_ne!(a.key(), b.key());
    }
}
