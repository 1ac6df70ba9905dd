use cairn_store::ObjectKind;
use cairn_types::ObjectId;
use serde::Serialize;

use crate::directory::ObjectDirectory;
use crate::error::{PackError, PackResult};

/// Kind and size of a parsed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub size: u64,
}

/// Object lookups for history traversal.
///
/// Where the directory reports an unknown id as absent, a walk treats it as
/// an error: every id it is handed was reached through a reference.
pub struct RevWalk<'a> {
    directory: &'a ObjectDirectory,
}

impl<'a> RevWalk<'a> {
    pub fn new(directory: &'a ObjectDirectory) -> Self {
        Self { directory }
    }

    pub fn parse_any(&self, id: &ObjectId) -> PackResult<ObjectHandle> {
        let loader = self
            .directory
            .resolve(id)?
            .ok_or(PackError::MissingObject(*id))?;
        Ok(ObjectHandle {
            id: *id,
            kind: loader.kind()?,
            size: loader.size()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowCache;
    use crate::writer::PackWriter;
    use cairn_store::{InMemoryObjectStore, StoredObject};
    use std::sync::Arc;

    #[test]
    fn parse_any_reports_kind_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let odb = ObjectDirectory::open(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(WindowCache::default()),
        )
        .unwrap();

        let tree = StoredObject::new(ObjectKind::Tree, b"entries".to_vec());
        let mut writer = PackWriter::new(odb.pack_dir());
        writer.add_stored_object(&tree);
        writer.finish().unwrap();

        let handle = RevWalk::new(&odb).parse_any(&tree.compute_id()).unwrap();
        assert_eq!(handle.kind, ObjectKind::Tree);
        assert_eq!(handle.size, 7);

        let json = serde_json::to_value(handle).unwrap();
        assert_eq!(json["kind"], "Tree");
    }

    #[test]
    fn parse_any_missing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(WindowCache::default());
        let odb = ObjectDirectory::with_loose_dir(dir.path(), cache).unwrap();
        let id = ObjectId::from_hash([7; 32]);
        let err = RevWalk::new(&odb).parse_any(&id).unwrap_err();
        assert!(matches!(err, PackError::MissingObject(missing) if missing == id));
    }
}
