//! In-memory authoritative entity state for the current device.
//!
//! Local mutations apply here immediately (optimistic), then flow to the
//! queue; server acknowledgments and remote events update the revision
//! bookkeeping afterwards. The store is owned by the orchestrator task, so
//! no internal locking: all access is single-consumer.

use crate::device::DeviceId;
use crate::entity::{DocumentStatus, EntityKey, EntityKind, EntityRecord, Operation, Revision};
use serde_json::Value;
use std::collections::HashMap;

/// Authoritative in-memory state, one record per entity.
pub struct EntityStore {
    device_id: DeviceId,
    records: HashMap<EntityKey, EntityRecord>,
    /// Monotonic stamp handed to each local mutation, independent of the
    /// server-assigned `sync_version`.
    next_local_rev: u64,
}

impl EntityStore {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            records: HashMap::new(),
            next_local_rev: 0,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Apply a mutation produced on this device.
    ///
    /// Upserts take effect immediately and stamp the record with this
    /// device as origin; the server-assigned `sync_version` is left alone
    /// (it only ever advances via [`apply_ack`](Self::apply_ack) or
    /// [`apply_remote`](Self::apply_remote)). Deletes drop the record.
    /// Returns the record's resulting status, `None` for deletes.
    pub fn apply_local(
        &mut self,
        key: EntityKey,
        operation: Operation,
        payload: Value,
        now_ms: u64,
    ) -> Option<DocumentStatus> {
        match operation {
            Operation::Delete => {
                self.records.remove(&key);
                None
            }
            Operation::Upsert => {
                self.next_local_rev += 1;
                let local_rev = self.next_local_rev;
                let device_id = self.device_id;
                let record = self
                    .records
                    .entry(key.clone())
                    .and_modify(|record| {
                        record.payload = payload.clone();
                        record.revision.updated_at = now_ms;
                        record.revision.origin_device = device_id;
                        record.local_rev = local_rev;
                        record.status = if record.revision.sync_version == 0 {
                            DocumentStatus::Local
                        } else {
                            DocumentStatus::Modified
                        };
                    })
                    .or_insert_with(|| EntityRecord {
                        key,
                        payload,
                        revision: Revision {
                            sync_version: 0,
                            updated_at: now_ms,
                            origin_device: device_id,
                        },
                        local_rev,
                        status: DocumentStatus::Local,
                    });
                Some(record.status)
            }
        }
    }

    /// Apply the server's acknowledgment of a successful push.
    pub fn apply_ack(&mut self, key: &EntityKey, sync_version: u64, updated_at: u64) {
        if let Some(record) = self.records.get_mut(key) {
            record.revision.sync_version = sync_version;
            record.revision.updated_at = updated_at;
            record.status = DocumentStatus::Synced;
        }
    }

    /// Apply a remote update wholesale: payload and revision both come from
    /// the server, no field-level merge.
    pub fn apply_remote(&mut self, key: EntityKey, payload: Value, revision: Revision) {
        match self.records.get_mut(&key) {
            Some(record) => {
                record.payload = payload;
                record.revision = revision;
                record.status = DocumentStatus::Synced;
            }
            None => {
                self.records.insert(
                    key.clone(),
                    EntityRecord {
                        key,
                        payload,
                        revision,
                        local_rev: 0,
                        status: DocumentStatus::Synced,
                    },
                );
            }
        }
    }

    /// Apply a remote deletion.
    pub fn remove_remote(&mut self, key: &EntityKey) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn mark_syncing(&mut self, key: &EntityKey) {
        if let Some(record) = self.records.get_mut(key) {
            record.status = DocumentStatus::Syncing;
        }
    }

    pub fn mark_error(&mut self, key: &EntityKey) {
        if let Some(record) = self.records.get_mut(key) {
            record.status = DocumentStatus::Error;
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    /// Server version this device last saw for an entity; 0 if never synced.
    pub fn sync_version(&self, key: &EntityKey) -> u64 {
        self.records
            .get(key)
            .map_or(0, |record| record.revision.sync_version)
    }

    pub fn status(&self, key: &EntityKey) -> Option<DocumentStatus> {
        self.records.get(key).map(|record| record.status)
    }

    /// All records of one kind, ordered by id for stable presentation.
    pub fn list(&self, kind: EntityKind) -> Vec<&EntityRecord> {
        let mut records: Vec<_> = self
            .records
            .values()
            .filter(|record| record.key.kind == kind)
            .collect();
        records.sort_by(|a, b| a.key.id.cmp(&b.key.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> EntityStore {
        EntityStore::new(DeviceId::from(0x1111))
    }

    #[test]
    fn test_new_local_entity_has_local_status() {
        let mut store = store();
        let status = store.apply_local(
            EntityKey::document("a.md"),
            Operation::Upsert,
            json!({"content": "hi"}),
            1000,
        );

        assert_eq!(status, Some(DocumentStatus::Local));
        let record = store.get(&EntityKey::document("a.md")).unwrap();
        assert_eq!(record.revision.sync_version, 0);
        assert_eq!(record.revision.origin_device, DeviceId::from(0x1111));
    }

    #[test]
    fn test_local_apply_never_advances_sync_version() {
        let mut store = store();
        let key = EntityKey::document("a.md");

        store.apply_local(key.clone(), Operation::Upsert, json!(1), 1000);
        store.apply_local(key.clone(), Operation::Upsert, json!(2), 2000);
        assert_eq!(store.sync_version(&key), 0);

        store.apply_ack(&key, 5, 2500);
        store.apply_local(key.clone(), Operation::Upsert, json!(3), 3000);

        // Still the server's version; only the status reflects the edit
        assert_eq!(store.sync_version(&key), 5);
        assert_eq!(store.status(&key), Some(DocumentStatus::Modified));
    }

    #[test]
    fn test_ack_marks_synced() {
        let mut store = store();
        let key = EntityKey::document("a.md");
        store.apply_local(key.clone(), Operation::Upsert, json!(1), 1000);

        store.apply_ack(&key, 7, 1100);

        let record = store.get(&key).unwrap();
        assert_eq!(record.revision.sync_version, 7);
        assert_eq!(record.revision.updated_at, 1100);
        assert_eq!(record.status, DocumentStatus::Synced);
    }

    #[test]
    fn test_local_rev_increases_per_mutation() {
        let mut store = store();
        store.apply_local(EntityKey::document("a.md"), Operation::Upsert, json!(1), 1000);
        store.apply_local(EntityKey::document("b.md"), Operation::Upsert, json!(1), 1000);
        store.apply_local(EntityKey::document("a.md"), Operation::Upsert, json!(2), 2000);

        let a = store.get(&EntityKey::document("a.md")).unwrap().local_rev;
        let b = store.get(&EntityKey::document("b.md")).unwrap().local_rev;
        assert!(a > b);
    }

    #[test]
    fn test_apply_remote_overwrites_wholesale() {
        let mut store = store();
        let key = EntityKey::document("a.md");
        store.apply_local(key.clone(), Operation::Upsert, json!({"content": "mine"}), 1000);

        let remote_device = DeviceId::from(0x2222);
        store.apply_remote(
            key.clone(),
            json!({"content": "theirs"}),
            Revision {
                sync_version: 9,
                updated_at: 5000,
                origin_device: remote_device,
            },
        );

        let record = store.get(&key).unwrap();
        assert_eq!(record.payload, json!({"content": "theirs"}));
        assert_eq!(record.revision.sync_version, 9);
        assert_eq!(record.revision.origin_device, remote_device);
        assert_eq!(record.status, DocumentStatus::Synced);
    }

    #[test]
    fn test_delete_removes_record() {
        let mut store = store();
        let key = EntityKey::document("a.md");
        store.apply_local(key.clone(), Operation::Upsert, json!(1), 1000);

        assert_eq!(store.apply_local(key.clone(), Operation::Delete, Value::Null, 2000), None);
        assert!(store.get(&key).is_none());
        assert_eq!(store.sync_version(&key), 0);
    }

    #[test]
    fn test_remove_remote() {
        let mut store = store();
        let key = EntityKey::document("a.md");
        store.apply_local(key.clone(), Operation::Upsert, json!(1), 1000);

        assert!(store.remove_remote(&key));
        assert!(!store.remove_remote(&key));
    }

    #[test]
    fn test_status_transitions() {
        let mut store = store();
        let key = EntityKey::document("a.md");
        store.apply_local(key.clone(), Operation::Upsert, json!(1), 1000);

        store.mark_syncing(&key);
        assert_eq!(store.status(&key), Some(DocumentStatus::Syncing));

        store.mark_error(&key);
        assert_eq!(store.status(&key), Some(DocumentStatus::Error));
    }

    #[test]
    fn test_list_is_sorted_by_id() {
        let mut store = store();
        store.apply_local(EntityKey::document("b.md"), Operation::Upsert, json!(1), 1000);
        store.apply_local(EntityKey::document("a.md"), Operation::Upsert, json!(1), 1000);
        store.apply_local(EntityKey::folder("f"), Operation::Upsert, json!(1), 1000);

        let ids: Vec<_> = store
            .list(EntityKind::Document)
            .into_iter()
            .map(|r| r.key.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a.md", "b.md"]);
    }
}
