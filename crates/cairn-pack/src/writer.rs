use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use cairn_crypto::{ChecksumWriter, ContentHasher};
use cairn_store::{ObjectKind, StoredObject};
use cairn_types::ObjectId;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::entry::{EntryHeader, PackEntry, PACK_MAGIC, PACK_TRAILER_LEN, PACK_VERSION};
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;

const COMPRESSION_LEVEL: i32 = 3;

/// Result of writing a pack file.
#[derive(Clone, Debug)]
pub struct PackFile {
    pub name: ObjectId,
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub object_count: usize,
    pub checksum: [u8; 32],
}

/// File stem for a pack: `pack-<hex name>`.
pub fn pack_stem(name: &ObjectId) -> String {
    format!("pack-{}", name.to_hex())
}

/// Data and index paths for the pack `name` inside `pack_dir`.
pub fn pack_paths(pack_dir: &Path, name: &ObjectId) -> (PathBuf, PathBuf) {
    let stem = pack_stem(name);
    (
        pack_dir.join(format!("{stem}.pack")),
        pack_dir.join(format!("{stem}.idx")),
    )
}

/// Recover a pack name from a `pack-<hex>.pack` or `pack-<hex>.idx` path.
pub fn parse_pack_name(path: &Path) -> Option<ObjectId> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("pack-")?.parse().ok()
}

/// Builds a pack from a collection of objects.
///
/// Objects are written in insertion order; the index is sorted by id. The
/// pack's name is derived from the sorted set of ids, so the same objects
/// always produce the same name regardless of the order they were added in.
pub struct PackWriter {
    pack_dir: PathBuf,
    entries: Vec<PackEntry>,
    seen: HashSet<ObjectId>,
}

impl PackWriter {
    /// Create a new PackWriter that publishes into `pack_dir`.
    pub fn new(pack_dir: &Path) -> Self {
        Self {
            pack_dir: pack_dir.to_path_buf(),
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Add an object to the pack. Ids already queued are ignored.
    pub fn add_object(&mut self, id: ObjectId, kind: ObjectKind, data: &[u8]) {
        if !self.seen.insert(id) {
            return;
        }
        self.entries.push(PackEntry {
            id,
            kind,
            data: data.to_vec(),
        });
    }

    /// Add a stored object directly.
    pub fn add_stored_object(&mut self, obj: &StoredObject) {
        self.add_object(obj.compute_id(), obj.kind, &obj.data);
    }

    /// Number of objects queued.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The deterministic name this pack will be published under.
    pub fn name(&self) -> ObjectId {
        let mut ids: Vec<ObjectId> = self.entries.iter().map(|e| e.id).collect();
        ids.sort();
        ContentHasher::PACK_NAME.hash_ids(&ids)
    }

    /// Write the pack under its content-derived name.
    pub fn finish(self) -> PackResult<PackFile> {
        let name = self.name();
        self.finish_as(name)
    }

    /// Write the pack under an explicit name, replacing any pack of that
    /// name already on disk.
    ///
    /// Both files are streamed to temporaries in the pack directory and only
    /// renamed into place once complete and synced: data first, index last.
    /// Directory scans only consider a pack whose index exists, so a new name
    /// becomes visible in one step. On failure the temporaries are removed.
    ///
    /// Replacing a name is not atomic. Between the two renames the new data
    /// sits next to the old index, and a reader that opens the pack then
    /// fails the cross-check. A scan in that gap leaves the name out, so a
    /// lookup can report the object missing until the index lands and the
    /// next miss rescans.
    pub fn finish_as(self, name: ObjectId) -> PackResult<PackFile> {
        let dir = self.pack_dir.clone();
        fs::create_dir_all(&dir).map_err(write_failure(&dir))?;
        let (pack_path, index_path) = pack_paths(&dir, &name);
        let replacing = pack_path.exists();

        let mut pack_tmp = temp_in(&dir)?;
        let index = {
            let out = BufWriter::new(pack_tmp.as_file_mut());
            self.write_pack(out).map_err(|e| in_file(e, &pack_path))?.0
        };
        pack_tmp.as_file().sync_all().map_err(write_failure(&pack_path))?;

        let mut index_tmp = temp_in(&dir)?;
        index
            .write_to(BufWriter::new(index_tmp.as_file_mut()))
            .map_err(write_failure(&index_path))?;
        index_tmp.as_file().sync_all().map_err(write_failure(&index_path))?;

        pack_tmp
            .persist(&pack_path)
            .map_err(|e| write_failure(&pack_path)(e.error))?;
        if let Err(e) = index_tmp.persist(&index_path) {
            if !replacing {
                let _ = fs::remove_file(&pack_path);
            }
            return Err(write_failure(&index_path)(e.error));
        }

        debug!(
            pack = %name.short_hex(),
            objects = index.object_count(),
            bytes = index.data_len,
            "wrote pack"
        );
        Ok(PackFile {
            name,
            pack_path,
            index_path,
            object_count: index.object_count(),
            checksum: index.pack_checksum,
        })
    }

    /// Build pack bytes and index in memory (no disk I/O).
    pub fn finish_to_bytes(self) -> PackResult<(Vec<u8>, PackIndex)> {
        let (index, bytes) = self.write_pack(Vec::new())?;
        Ok((bytes, index))
    }

    fn write_pack<W: Write>(&self, out: W) -> PackResult<(PackIndex, W)> {
        let mut w = ChecksumWriter::new(out);
        let mut index_entries = Vec::with_capacity(self.entries.len());

        // Header: magic + version + object count
        w.write_all(PACK_MAGIC)?;
        w.write_all(&PACK_VERSION.to_be_bytes())?;
        w.write_all(&(self.entries.len() as u32).to_be_bytes())?;

        let mut header = Vec::with_capacity(32);
        for entry in &self.entries {
            let offset = w.position();
            let compressed = zstd::encode_all(entry.data.as_slice(), COMPRESSION_LEVEL)
                .map_err(|e| PackError::CompressionFailed(e.to_string()))?;

            header.clear();
            EntryHeader::encode(
                &mut header,
                entry.kind,
                entry.data.len() as u64,
                compressed.len() as u64,
            );
            w.write_all(&header)?;
            w.write_all(&compressed)?;

            index_entries.push((entry.id, crc32fast::hash(&compressed), offset));
        }

        let data_len = w.position() + PACK_TRAILER_LEN;
        let (checksum, out) = w.finish()?;
        Ok((PackIndex::build(index_entries, data_len, checksum), out))
    }
}

fn temp_in(dir: &Path) -> PackResult<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".tmp-pack-")
        .tempfile_in(dir)
        .map_err(write_failure(dir))
}

fn write_failure(path: &Path) -> impl Fn(io::Error) -> PackError + '_ {
    move |source| PackError::WriteFailure {
        path: path.to_path_buf(),
        source,
    }
}

fn in_file(err: PackError, path: &Path) -> PackError {
    match err {
        PackError::Io(source) => PackError::WriteFailure {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    }
}
