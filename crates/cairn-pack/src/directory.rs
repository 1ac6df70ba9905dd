use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cairn_store::{LooseObjectStore, ObjectStore};
use cairn_types::ObjectId;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{PackError, PackResult};
use crate::loader::{ObjectLoader, ObjectSource};
use crate::segment::PackSegment;
use crate::window::WindowCache;
use crate::writer::{parse_pack_name, PackFile, PackWriter};

/// An immutable view of the packs known to a directory at one moment.
#[derive(Debug, Default)]
pub struct PackSnapshot {
    segments: Vec<Arc<PackSegment>>,
    version: u64,
    /// Sequence number of the scan that produced this list.
    scan: u64,
}

impl PackSnapshot {
    pub fn segments(&self) -> &[Arc<PackSegment>] {
        &self.segments
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, name: &ObjectId) -> Option<&Arc<PackSegment>> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// First valid segment whose index lists `id`. Index lookups only.
    pub fn find(&self, id: &ObjectId) -> Option<(&Arc<PackSegment>, u64, u32)> {
        self.segments
            .iter()
            .filter(|s| s.is_valid())
            .find_map(|s| s.lookup(id).map(|(offset, crc)| (s, offset, crc)))
    }

    pub fn total_objects(&self) -> usize {
        self.segments.iter().map(|s| s.object_count()).sum()
    }
}

struct Inner {
    objects_dir: PathBuf,
    pack_dir: PathBuf,
    loose: Arc<dyn ObjectStore>,
    cache: Arc<WindowCache>,
    snapshot: RwLock<Arc<PackSnapshot>>,
    /// Serializes every snapshot change.
    publish: Mutex<()>,
    scans_started: AtomicU64,
}

/// Resolves object ids against the packs in `objects/pack` and a loose store.
///
/// Readers work from an immutable [`PackSnapshot`] swapped atomically on
/// every rescan, so a lookup never observes a half-updated pack list. A miss
/// in both the snapshot and the loose store triggers one rescan of the pack
/// directory and one more lookup before the id is reported absent; a loose
/// hit never costs a rescan.
///
/// Cloning is cheap and every clone shares the same snapshot.
#[derive(Clone)]
pub struct ObjectDirectory {
    inner: Arc<Inner>,
}

impl ObjectDirectory {
    /// Open the directory rooted at `objects_dir`. Packs live in
    /// `objects_dir/pack`, which need not exist yet.
    pub fn open(
        objects_dir: &Path,
        loose: Arc<dyn ObjectStore>,
        cache: Arc<WindowCache>,
    ) -> PackResult<Self> {
        let dir = Self {
            inner: Arc::new(Inner {
                objects_dir: objects_dir.to_path_buf(),
                pack_dir: objects_dir.join("pack"),
                loose,
                cache,
                snapshot: RwLock::new(Arc::new(PackSnapshot::default())),
                publish: Mutex::new(()),
                scans_started: AtomicU64::new(0),
            }),
        };
        dir.rescan()?;
        Ok(dir)
    }

    /// Open with a [`LooseObjectStore`] sharing `objects_dir`.
    pub fn with_loose_dir(objects_dir: &Path, cache: Arc<WindowCache>) -> PackResult<Self> {
        let loose = Arc::new(LooseObjectStore::new(objects_dir));
        Self::open(objects_dir, loose, cache)
    }

    pub fn objects_dir(&self) -> &Path {
        &self.inner.objects_dir
    }

    pub fn pack_dir(&self) -> &Path {
        &self.inner.pack_dir
    }

    pub fn cache(&self) -> &Arc<WindowCache> {
        &self.inner.cache
    }

    pub fn loose(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.loose
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<PackSnapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn segments(&self) -> Vec<Arc<PackSegment>> {
        self.snapshot().segments.clone()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot().version
    }

    /// Find `id` and return a lazy loader for it, or `None` if no pack and
    /// no loose object holds it even after a rescan.
    pub fn resolve(&self, id: &ObjectId) -> PackResult<Option<ObjectLoader>> {
        Ok(self.locate(id)?.map(|source| ObjectLoader::new(*id, source, self.clone())))
    }

    /// Whether `id` resolves to any source.
    pub fn has(&self, id: &ObjectId) -> PackResult<bool> {
        Ok(self.locate(id)?.is_some())
    }

    /// The resolution algorithm behind [`resolve`](Self::resolve).
    pub(crate) fn locate(&self, id: &ObjectId) -> PackResult<Option<ObjectSource>> {
        let scans_seen = self.inner.scans_started.load(Ordering::Acquire);
        let snapshot = self.snapshot();
        if let Some(source) = self.lookup_in(&snapshot, id)? {
            return Ok(Some(source));
        }

        let snapshot = self.rescan_since(scans_seen)?;
        let found = self.lookup_in(&snapshot, id)?;
        if found.is_none() {
            debug!(
                id = %id.short_hex(),
                version = snapshot.version,
                "object not found after rescan"
            );
        }
        Ok(found)
    }

    fn lookup_in(
        &self,
        snapshot: &PackSnapshot,
        id: &ObjectId,
    ) -> PackResult<Option<ObjectSource>> {
        if let Some((segment, offset, crc)) = snapshot.find(id) {
            return Ok(Some(ObjectSource::pack(segment, offset, crc)));
        }
        if self.inner.loose.exists(id)? {
            return Ok(Some(ObjectSource::Loose));
        }
        Ok(None)
    }

    /// Rescan the pack directory and publish the result.
    pub fn rescan(&self) -> PackResult<Arc<PackSnapshot>> {
        let _publish = self.inner.publish.lock();
        self.scan_locked()
    }

    /// Rescan unless a scan that started after `scans_seen` already
    /// published; its listing is at least as new as the caller's miss.
    fn rescan_since(&self, scans_seen: u64) -> PackResult<Arc<PackSnapshot>> {
        let _publish = self.inner.publish.lock();
        let current = self.snapshot();
        if current.scan > scans_seen {
            return Ok(current);
        }
        self.scan_locked()
    }

    fn scan_locked(&self) -> PackResult<Arc<PackSnapshot>> {
        let scan = self.inner.scans_started.fetch_add(1, Ordering::AcqRel) + 1;
        let current = self.snapshot();
        let listing = list_packs(&self.inner.pack_dir)?;

        let mut segments = Vec::with_capacity(listing.len());
        for (name, pack_path) in listing {
            if let Some(known) = current.get(&name) {
                if known.is_valid() && known.matches_disk() {
                    segments.push(Arc::clone(known));
                    continue;
                }
                debug!(pack = %name.short_hex(), "pack changed on disk, reopening");
                known.invalidate();
            }
            if let Some(segment) = self.open_listed(&name, &pack_path) {
                segments.push(segment);
            }
        }

        for old in current.segments.iter() {
            if !segments.iter().any(|s| s.key() == old.key()) {
                debug!(pack = %old.name().short_hex(), "dropping pack segment");
                old.close();
                self.inner.cache.purge(old);
            }
        }

        Ok(self.publish_locked(&current, segments, scan))
    }

    /// Open one listed pack, or skip it with a warning. Only the listing
    /// itself can fail a scan; one bad pack never hides the others.
    ///
    /// A pack being overwritten in place has its new data renamed in before
    /// its new index, and fails its cross-check in between. It gets one more
    /// attempt before it is skipped until the next scan.
    fn open_listed(&self, name: &ObjectId, pack_path: &Path) -> Option<Arc<PackSegment>> {
        let open = || PackSegment::open(pack_path, Arc::clone(&self.inner.cache));
        let result = match open() {
            Err(e @ PackError::CorruptSegment { .. }) => {
                debug!(
                    pack = %name.short_hex(),
                    error = %e,
                    "pack failed its cross-check, retrying"
                );
                open()
            }
            other => other,
        };
        match result {
            Ok(segment) => Some(segment),
            Err(e) => {
                warn!(pack = %name.short_hex(), error = %e, "skipping unusable pack");
                None
            }
        }
    }

    /// Remove `segment` from the current snapshot after it failed.
    pub fn invalidate(&self, segment: &PackSegment) {
        segment.invalidate();
        let _publish = self.inner.publish.lock();
        let current = self.snapshot();
        if !current.segments.iter().any(|s| s.key() == segment.key()) {
            return;
        }
        let segments = current
            .segments
            .iter()
            .filter(|s| s.key() != segment.key())
            .cloned()
            .collect();
        self.publish_locked(&current, segments, current.scan);
    }

    fn publish_locked(
        &self,
        current: &PackSnapshot,
        segments: Vec<Arc<PackSegment>>,
        scan: u64,
    ) -> Arc<PackSnapshot> {
        let next = Arc::new(PackSnapshot {
            segments,
            version: current.version + 1,
            scan,
        });
        debug!(version = next.version, packs = next.len(), "published pack snapshot");
        *self.inner.snapshot.write() = Arc::clone(&next);
        next
    }

    /// Copy `ids` from whatever source holds them into one new pack, then
    /// rescan so the pack is visible.
    pub fn pack_objects(&self, ids: &[ObjectId]) -> PackResult<PackFile> {
        let mut writer = PackWriter::new(&self.inner.pack_dir);
        for id in ids {
            let loader = self.resolve(id)?.ok_or(PackError::MissingObject(*id))?;
            let kind = loader.kind()?;
            let data = loader.into_bytes()?;
            writer.add_object(*id, kind, &data);
        }
        let file = writer.finish()?;
        self.rescan()?;
        Ok(file)
    }

    /// Close every open data handle and drop every cached window.
    pub fn close_all(&self) {
        for segment in self.snapshot().segments.iter() {
            segment.close();
            self.inner.cache.purge(segment);
        }
    }
}

impl std::fmt::Debug for ObjectDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ObjectDirectory")
            .field("pack_dir", &self.inner.pack_dir)
            .field("version", &snapshot.version)
            .field("packs", &snapshot.len())
            .finish()
    }
}

/// Packs in `pack_dir` whose index is present, sorted by name.
fn list_packs(pack_dir: &Path) -> PackResult<Vec<(ObjectId, PathBuf)>> {
    let entries = match fs::read_dir(pack_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut packs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().map(|e| e == "pack").unwrap_or(false) {
            if let Some(name) = parse_pack_name(&path) {
                if path.with_extension("idx").is_file() {
                    packs.push((name, path));
                }
            }
        }
    }
    packs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(packs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowCacheConfig;
    use cairn_store::{InMemoryObjectStore, StoredObject};

    fn setup() -> (tempfile::TempDir, ObjectDirectory, Arc<InMemoryObjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let loose = Arc::new(InMemoryObjectStore::new());
        let cache = Arc::new(WindowCache::new(WindowCacheConfig::default()));
        let odb = ObjectDirectory::open(dir.path(), loose.clone(), cache).unwrap();
        (dir, odb, loose)
    }

    fn pack(odb: &ObjectDirectory, contents: &[&str]) -> PackFile {
        let mut writer = PackWriter::new(odb.pack_dir());
        for c in contents {
            writer.add_stored_object(&StoredObject::blob(c.as_bytes()));
        }
        writer.finish().unwrap()
    }

    fn id_of(content: &str) -> ObjectId {
        StoredObject::blob(content.as_bytes()).compute_id()
    }

    #[test]
    fn empty_directory() {
        let (_dir, odb, _) = setup();
        assert_eq!(odb.snapshot_version(), 1);
        assert!(odb.segments().is_empty());
        assert!(odb.resolve(&id_of("nothing")).unwrap().is_none());
        assert!(!odb.has(&id_of("nothing")).unwrap());
    }

    #[test]
    fn miss_rescans_once_and_publishes() {
        let (_dir, odb, _) = setup();
        let before = odb.snapshot_version();
        pack(&odb, &["fresh"]);

        assert!(odb.has(&id_of("fresh")).unwrap());
        assert_eq!(odb.snapshot_version(), before + 1);
        assert_eq!(odb.segments().len(), 1);

        // A hit in the snapshot does not rescan.
        assert!(odb.has(&id_of("fresh")).unwrap());
        assert_eq!(odb.snapshot_version(), before + 1);
    }

    #[test]
    fn loose_hit_skips_rescan() {
        let (_dir, odb, loose) = setup();
        loose.write(&StoredObject::blob("loose")).unwrap();
        let before = odb.snapshot_version();
        assert!(odb.has(&id_of("loose")).unwrap());
        assert_eq!(odb.snapshot_version(), before);
    }

    #[test]
    fn rescan_keeps_unchanged_segments() {
        let (_dir, odb, _) = setup();
        pack(&odb, &["a"]);
        let first = odb.rescan().unwrap();
        pack(&odb, &["b"]);
        let second = odb.rescan().unwrap();

        assert_eq!(second.len(), 2);
        assert!(second.version() > first.version());
        let kept = first.segments()[0].key();
        assert!(second.segments().iter().any(|s| s.key() == kept));
    }

    #[test]
    fn rescan_reopens_overwritten_pack() {
        let (_dir, odb, _) = setup();
        let file = pack(&odb, &["a"]);
        let first = odb.rescan().unwrap();
        let old = Arc::clone(&first.segments()[0]);

        let mut writer = PackWriter::new(odb.pack_dir());
        writer.add_stored_object(&StoredObject::blob("b"));
        writer.add_stored_object(&StoredObject::blob("a"));
        writer.finish_as(file.name).unwrap();

        let second = odb.rescan().unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second.segments()[0].key(), old.key());
        assert!(!old.is_valid());
        assert!(second.find(&id_of("b")).is_some());
    }

    #[test]
    fn rescan_drops_vanished_packs() {
        let (_dir, odb, _) = setup();
        let file = pack(&odb, &["a"]);
        odb.rescan().unwrap();
        fs::remove_file(&file.index_path).unwrap();
        fs::remove_file(&file.pack_path).unwrap();
        assert!(odb.rescan().unwrap().is_empty());
    }

    #[test]
    fn rescan_quarantines_unreadable_pack() {
        let (_dir, odb, _) = setup();
        pack(&odb, &["good"]);
        let bad = pack(&odb, &["bad"]);
        fs::write(&bad.index_path, b"garbage").unwrap();

        let snapshot = odb.rescan().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.find(&id_of("good")).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn unopenable_pack_does_not_hide_the_others() {
        let (dir, odb, _) = setup();
        pack(&odb, &["good"]);
        let bad = pack(&odb, &["looping"]);
        fs::remove_file(&bad.pack_path).unwrap();
        std::os::unix::fs::symlink(&bad.pack_path, &bad.pack_path).unwrap();

        let snapshot = odb.rescan().unwrap();
        assert_eq!(snapshot.len(), 1);
        let good = odb.resolve(&id_of("good")).unwrap().unwrap();
        assert_eq!(good.into_bytes().unwrap(), b"good");
        assert!(odb.resolve(&id_of("looping")).unwrap().is_none());

        let loose = Arc::new(InMemoryObjectStore::new());
        let reopened = ObjectDirectory::open(dir.path(), loose, Arc::clone(odb.cache())).unwrap();
        assert!(reopened.has(&id_of("good")).unwrap());
    }

    #[test]
    fn pack_caught_mid_overwrite_is_skipped_until_its_index_lands() {
        let (_dir, odb, _) = setup();
        let file = pack(&odb, &["a"]);
        let held = odb.resolve(&id_of("a")).unwrap().unwrap();

        let mut writer = PackWriter::new(odb.pack_dir());
        writer.add_stored_object(&StoredObject::blob("b"));
        writer.add_stored_object(&StoredObject::blob("a"));
        let (bytes, index) = writer.finish_to_bytes().unwrap();

        // New data under the old index: the pack fails its cross-check and
        // is left out of the snapshot, so a read in this gap finds nothing.
        fs::write(&file.pack_path, &bytes).unwrap();
        let err = held.bytes().unwrap_err();
        assert!(matches!(err, PackError::MissingObject(_)));
        assert!(odb.segments().is_empty());

        // Once the index lands the next miss picks the pack up again.
        fs::write(&file.index_path, index.to_bytes()).unwrap();
        assert_eq!(held.bytes().unwrap(), b"a");
        let b = odb.resolve(&id_of("b")).unwrap().unwrap();
        assert_eq!(b.into_bytes().unwrap(), b"b");
        assert_eq!(odb.segments().len(), 1);
    }

    #[test]
    fn half_published_pack_is_ignored() {
        let (_dir, odb, _) = setup();
        let file = pack(&odb, &["half"]);
        fs::remove_file(&file.index_path).unwrap();
        assert!(odb.rescan().unwrap().is_empty());
        assert!(odb.resolve(&id_of("half")).unwrap().is_none());
    }

    #[test]
    fn invalidate_publishes_without_segment() {
        let (_dir, odb, _) = setup();
        pack(&odb, &["a"]);
        let snapshot = odb.rescan().unwrap();
        let segment = Arc::clone(&snapshot.segments()[0]);

        odb.invalidate(&segment);
        let after = odb.snapshot();
        assert!(after.is_empty());
        assert_eq!(after.version(), snapshot.version() + 1);
        assert!(!segment.is_valid());

        // Invalidating again is a no-op.
        odb.invalidate(&segment);
        assert_eq!(odb.snapshot_version(), after.version());
    }

    #[test]
    fn pack_objects_moves_loose_objects_into_a_pack() {
        let (_dir, odb, loose) = setup();
        let ids: Vec<ObjectId> = ["x", "y"]
            .iter()
            .map(|c| loose.write(&StoredObject::blob(c.as_bytes())).unwrap())
            .collect();

        let file = odb.pack_objects(&ids).unwrap();
        assert_eq!(file.object_count, 2);
        for id in &ids {
            loose.delete(id).unwrap();
        }
        let snapshot = odb.snapshot();
        assert!(ids.iter().all(|id| snapshot.find(id).is_some()));
    }

    #[test]
    fn pack_objects_rejects_unknown_ids() {
        let (_dir, odb, _) = setup();
        let err = odb.pack_objects(&[id_of("ghost")]).unwrap_err();
        assert!(matches!(err, PackError::MissingObject(_)));
    }

    #[test]
    fn with_loose_dir_reads_loose_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(WindowCache::default());
        let odb = ObjectDirectory::with_loose_dir(dir.path(), cache).unwrap();
        let id = odb.loose().write(&StoredObject::blob("on disk")).unwrap();
        assert!(odb.has(&id).unwrap());
        // The loose fan-out directories are never mistaken for packs.
        assert!(odb.rescan().unwrap().is_empty());
    }
}
