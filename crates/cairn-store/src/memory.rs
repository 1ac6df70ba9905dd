use std::collections::HashMap;

use cairn_types::ObjectId;
use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::object::StoredObject;
use crate::traits::ObjectStore;

/// Loose objects kept in a map instead of on disk.
///
/// Stands in for [`LooseObjectStore`](crate::LooseObjectStore) wherever a
/// directory is built without a loose area of its own.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<StoredObject>> {
        Ok(self.objects.read().get(id).cloned())
    }

    fn write(&self, object: &StoredObject) -> StoreResult<ObjectId> {
        let id = object.compute_id();
        if id.is_null() {
            return Err(StoreError::NullObjectId);
        }
        self.objects.write().entry(id).or_insert_with(|| object.clone());
        Ok(id)
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.objects.read().contains_key(id))
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.objects.write().remove(id).is_some())
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("objects", &self.objects.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_object_is_readable_under_its_id() {
        let store = InMemoryObjectStore::new();
        let obj = StoredObject::blob(&b"loose content"[..]);
        let id = store.write(&obj).unwrap();
        assert!(obj.matches_id(&id));
        assert!(store.exists(&id).unwrap());
        assert_eq!(store.read(&id).unwrap(), Some(obj));
    }

    #[test]
    fn deleted_object_is_gone() {
        let store = InMemoryObjectStore::new();
        let id = store.write(&StoredObject::blob(&b"packed away"[..])).unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(!store.exists(&id).unwrap());
        assert!(store.read(&id).unwrap().is_none());
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn batch_read_keeps_positions_of_missing_ids() {
        let store = InMemoryObjectStore::new();
        let ids = store
            .write_batch(&[StoredObject::blob(&b"a"[..]), StoredObject::blob(&b"b"[..])])
            .unwrap();
        let missing = ObjectId::from_hash([1; 32]);
        let results = store.read_batch(&[ids[0], missing, ids[1]]).unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }
}
