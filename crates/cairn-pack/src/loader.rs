use std::sync::{Arc, OnceLock, Weak};

use cairn_store::{ObjectKind, ObjectStore, StoredObject};
use cairn_types::ObjectId;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::directory::ObjectDirectory;
use crate::error::{PackError, PackResult};
use crate::segment::PackSegment;

/// How many times a loader re-resolves its id after its source failed.
const RERESOLVE_LIMIT: usize = 1;

/// Where a loader reads its object from.
///
/// A pack source refers to its segment weakly: a loader never keeps a
/// dropped or replaced segment alive.
#[derive(Clone, Debug)]
pub enum ObjectSource {
    Pack {
        segment: Weak<PackSegment>,
        pack: ObjectId,
        offset: u64,
        crc: u32,
    },
    Loose,
}

impl ObjectSource {
    pub(crate) fn pack(segment: &Arc<PackSegment>, offset: u64, crc: u32) -> Self {
        Self::Pack {
            segment: Arc::downgrade(segment),
            pack: *segment.name(),
            offset,
            crc,
        }
    }

    pub fn is_pack(&self) -> bool {
        matches!(self, Self::Pack { .. })
    }

    /// Name of the pack holding the object, if any.
    pub fn pack_name(&self) -> Option<&ObjectId> {
        match self {
            Self::Pack { pack, .. } => Some(pack),
            Self::Loose => None,
        }
    }

    fn segment(&self) -> Option<Arc<PackSegment>> {
        match self {
            Self::Pack { segment, .. } => segment.upgrade(),
            Self::Loose => None,
        }
    }
}

/// Lazy handle to one object's content.
///
/// Nothing is read until [`kind`](Self::kind), [`size`](Self::size) or
/// [`bytes`](Self::bytes) is called. The bytes are then kept on this
/// instance, and only this instance: two loaders for the same id always own
/// separate buffers.
///
/// If the segment the object was found in disappears or turns out to be
/// stale, the loader asks its directory to drop the segment, re-resolves its
/// id once and reads from wherever the object lives now.
pub struct ObjectLoader {
    id: ObjectId,
    source: Mutex<ObjectSource>,
    directory: ObjectDirectory,
    header: OnceLock<(ObjectKind, u64)>,
    data: OnceLock<Vec<u8>>,
}

impl ObjectLoader {
    pub(crate) fn new(id: ObjectId, source: ObjectSource, directory: ObjectDirectory) -> Self {
        Self {
            id,
            source: Mutex::new(source),
            directory,
            header: OnceLock::new(),
            data: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Current source. May change after a re-resolution.
    pub fn source(&self) -> ObjectSource {
        self.source.lock().clone()
    }

    /// Object kind, read from the pack entry header alone when possible.
    pub fn kind(&self) -> PackResult<ObjectKind> {
        Ok(self.header()?.0)
    }

    /// Inflated size in bytes.
    pub fn size(&self) -> PackResult<u64> {
        Ok(self.header()?.1)
    }

    /// The object's content, materialized on first call.
    pub fn bytes(&self) -> PackResult<&[u8]> {
        if let Some(data) = self.data.get() {
            return Ok(data);
        }
        let object = self.with_source(|source| self.read_object(source))?;
        let _ = self.header.set((object.kind, object.data.len() as u64));
        Ok(self.data.get_or_init(|| object.data))
    }

    /// Consume the loader, returning the content.
    pub fn into_bytes(self) -> PackResult<Vec<u8>> {
        self.bytes()?;
        Ok(self.data.into_inner().unwrap_or_default())
    }

    /// The content as a [`StoredObject`].
    pub fn to_object(&self) -> PackResult<StoredObject> {
        let kind = self.kind()?;
        Ok(StoredObject::new(kind, self.bytes()?.to_vec()))
    }

    fn header(&self) -> PackResult<(ObjectKind, u64)> {
        if let Some(header) = self.header.get() {
            return Ok(*header);
        }
        let header = self.with_source(|source| match source {
            ObjectSource::Pack { offset, .. } => match source.segment() {
                Some(segment) => segment.read_kind(*offset).map(Some),
                None => Ok(None),
            },
            ObjectSource::Loose => Ok(self.read_object(source)?.map(|object| {
                let header = (object.kind, object.data.len() as u64);
                let _ = self.data.set(object.data);
                header
            })),
        })?;
        Ok(*self.header.get_or_init(|| header))
    }

    /// One read attempt. `Ok(None)` means the source no longer holds the
    /// object.
    fn read_object(&self, source: &ObjectSource) -> PackResult<Option<StoredObject>> {
        match source {
            ObjectSource::Pack { offset, crc, .. } => match source.segment() {
                Some(segment) => segment.read_entry(&self.id, *offset, *crc).map(Some),
                None => Ok(None),
            },
            ObjectSource::Loose => Ok(self.directory.loose().read(&self.id)?),
        }
    }

    /// Run `op` against the current source, re-resolving when the source has
    /// gone away or failed.
    fn with_source<T>(&self, op: impl Fn(&ObjectSource) -> PackResult<Option<T>>) -> PackResult<T> {
        let mut attempts = 0;
        loop {
            let source = self.source();
            match op(&source) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(id = %self.id.short_hex(), "object source went away");
                }
                Err(e) if e.is_segment_failure() => {
                    debug!(id = %self.id.short_hex(), error = %e, "object source failed");
                    if let Some(segment) = source.segment() {
                        self.directory.invalidate(&segment);
                    }
                }
                Err(e) => return Err(e),
            }

            if attempts == RERESOLVE_LIMIT {
                warn!(id = %self.id.short_hex(), "object could not be read from any source");
                return Err(PackError::MissingObject(self.id));
            }
            attempts += 1;

            match self.directory.locate(&self.id)? {
                Some(next) => *self.source.lock() = next,
                None => return Err(PackError::MissingObject(self.id)),
            }
        }
    }
}

impl std::fmt::Debug for ObjectLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLoader")
            .field("id", &self.id)
            .field("source", &*self.source.lock())
            .field("loaded", &self.data.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowCache;
    use crate::writer::PackWriter;
    use cairn_store::InMemoryObjectStore;

    fn setup() -> (tempfile::TempDir, ObjectDirectory, Arc<InMemoryObjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let loose = Arc::new(InMemoryObjectStore::new());
        let cache = Arc::new(WindowCache::default());
        let odb = ObjectDirectory::open(dir.path(), loose.clone(), cache).unwrap();
        (dir, odb, loose)
    }

    fn pack(odb: &ObjectDirectory, contents: &[&str]) -> crate::writer::PackFile {
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
    fn bytes_are_cached_on_the_instance() {
        let (_dir, odb, _) = setup();
        pack(&odb, &["cached"]);
        let loader = odb.resolve(&id_of("cached")).unwrap().unwrap();
        assert!(loader.source().is_pack());

        let first = loader.bytes().unwrap().as_ptr();
        let second = loader.bytes().unwrap().as_ptr();
        assert_eq!(first, second);
        assert_eq!(loader.bytes().unwrap(), b"cached");
    }

    #[test]
    fn kind_and_size_without_materializing() {
        let (_dir, odb, _) = setup();
        pack(&odb, &["header"]);
        let loader = odb.resolve(&id_of("header")).unwrap().unwrap();
        assert_eq!(loader.kind().unwrap(), ObjectKind::Blob);
        assert_eq!(loader.size().unwrap(), 6);
        assert!(loader.data.get().is_none());
    }

    #[test]
    fn loose_source() {
        let (_dir, odb, loose) = setup();
        let id = loose.write(&StoredObject::blob("loose body")).unwrap();
        let loader = odb.resolve(&id).unwrap().unwrap();
        assert!(!loader.source().is_pack());
        assert_eq!(loader.kind().unwrap(), ObjectKind::Blob);
        assert_eq!(loader.into_bytes().unwrap(), b"loose body");
    }

    #[test]
    fn loose_object_packed_away_is_followed() {
        let (_dir, odb, loose) = setup();
        let id = loose.write(&StoredObject::blob("moving")).unwrap();
        let loader = odb.resolve(&id).unwrap().unwrap();

        pack(&odb, &["moving"]);
        loose.delete(&id).unwrap();

        assert_eq!(loader.bytes().unwrap(), b"moving");
        assert!(loader.source().is_pack());
    }

    #[test]
    fn dropped_segment_is_not_kept_alive() {
        let (_dir, odb, _) = setup();
        let file = pack(&odb, &["weak"]);
        let loader = odb.resolve(&id_of("weak")).unwrap().unwrap();

        std::fs::remove_file(&file.index_path).unwrap();
        std::fs::remove_file(&file.pack_path).unwrap();
        odb.rescan().unwrap();

        let ObjectSource::Pack { segment, .. } = loader.source() else {
            panic!("expected a pack source");
        };
        assert!(segment.upgrade().is_none());
        assert!(matches!(loader.bytes().unwrap_err(), PackError::MissingObject(_)));
    }

    #[test]
    fn to_object_round_trips_id() {
        let (_dir, odb, _) = setup();
        pack(&odb, &["object"]);
        let loader = odb.resolve(&id_of("object")).unwrap().unwrap();
        let object = loader.to_object().unwrap();
        assert!(object.matches_id(loader.id()));
    }
}
