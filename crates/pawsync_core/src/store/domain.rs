//! Typed records kept in the local store.

use super::{Keyspace, LocalStore};
use crate::error::CoreResult;
use pawsync_protocol::{
    payload_checksum, Checksum, EntityPayload, EntityRef, EntityType, NetworkStateSample,
    SyncStateRecord, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Meta key of the migration ledger.
pub const META_MIGRATION_LEDGER: &str = "migration_ledger";
/// Meta key of the sequence watermark of the last quick integrity check.
pub const META_QUICK_WATERMARK: &str = "integrity_quick_watermark";

/// Last version of an entity acknowledged by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedVersion {
    /// Server version.
    pub version: u64,
    /// Server timestamp of that version.
    pub server_timestamp: Timestamp,
    /// Payload as the server holds it.
    pub payload: Option<EntityPayload>,
}

/// An entity in the replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Current local payload.
    pub payload: EntityPayload,
    /// SHA-256 of the encoded payload.
    pub checksum: Checksum,
    /// Last local or pulled change.
    pub updated_at: Timestamp,
    /// Last server-acknowledged state.
    pub synced: Option<SyncedVersion>,
}

impl EntityRecord {
    /// A record for `payload`, checksum computed.
    pub fn new(
        entity_id: impl Into<String>,
        payload: EntityPayload,
        updated_at: Timestamp,
    ) -> CoreResult<Self> {
        Ok(Self {
            entity_type: payload.entity_type(),
            entity_id: entity_id.into(),
            checksum: payload_checksum(&payload)?,
            payload,
            updated_at,
            synced: None,
        })
    }

    /// Replaces the payload and refreshes the checksum.
    pub fn set_payload(&mut self, payload: EntityPayload, updated_at: Timestamp) -> CoreResult<()> {
        self.checksum = payload_checksum(&payload)?;
        self.payload = payload;
        self.updated_at = updated_at;
        Ok(())
    }

    /// Whether the stored checksum matches the payload.
    pub fn checksum_matches(&self) -> CoreResult<bool> {
        Ok(payload_checksum(&self.payload)? == self.checksum)
    }

    /// The entity reference.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.as_str())
    }

    /// Server version the replica last saw.
    pub fn synced_version(&self) -> Option<u64> {
        self.synced.as_ref().map(|s| s.version)
    }
}

/// Canonical form of an entity key: lowercase type name, trimmed id.
///
/// Accepts legacy forms such as `Feedings/ 7`. Returns `None` for keys that
/// do not name an entity.
pub fn normalize_entity_key(key: &str) -> Option<String> {
    let (type_part, id_part) = key.split_once('/')?;
    let entity_type = EntityType::from_str(&type_part.trim().to_ascii_lowercase()).ok()?;
    let id = id_part.trim();
    if id.is_empty() {
        return None;
    }
    Some(EntityRef::new(entity_type, id).storage_key())
}

impl LocalStore {
    /// Writes an entity record under its canonical key.
    pub fn put_entity(&self, record: &EntityRecord) -> CoreResult<u64> {
        self.put_typed(Keyspace::Entities, &record.entity_ref().storage_key(), record)
    }

    /// Reads an entity record.
    pub fn get_entity(&self, entity: &EntityRef) -> CoreResult<Option<EntityRecord>> {
        self.get_typed(Keyspace::Entities, &entity.storage_key())
    }

    /// Deletes an entity record. Returns whether it existed.
    pub fn delete_entity(&self, entity: &EntityRef) -> CoreResult<bool> {
        self.delete(Keyspace::Entities, &entity.storage_key())
    }

    /// Whether the entity exists locally.
    pub fn entity_exists(&self, entity: &EntityRef) -> bool {
        self.contains(Keyspace::Entities, &entity.storage_key())
    }

    /// Entity records, optionally of one type.
    pub fn list_entities(&self, entity_type: Option<EntityType>) -> Vec<EntityRecord> {
        let prefix = entity_type.map_or(String::new(), |t| format!("{}/", t.as_str()));
        self.scan_prefix(Keyspace::Entities, &prefix)
            .into_iter()
            .filter_map(|(_, bytes)| pawsync_protocol::decode::<EntityRecord>(&bytes).ok())
            .collect()
    }

    /// Reads the sync state of `user_id`.
    pub fn load_sync_state(&self, user_id: &str) -> CoreResult<Option<SyncStateRecord>> {
        self.get_typed(Keyspace::SyncState, user_id)
    }

    /// Writes a sync state record.
    pub fn save_sync_state(&self, state: &SyncStateRecord) -> CoreResult<u64> {
        self.put_typed(Keyspace::SyncState, &state.user_id, state)
    }

    /// Appends a network sample to the persisted history.
    pub fn append_network_sample(&self, sample: &NetworkStateSample) -> CoreResult<u64> {
        let key = format!("{:020}-{}", sample.timestamp, uuid::Uuid::new_v4().simple());
        self.put_typed(Keyspace::NetworkSamples, &key, sample)
    }

    /// Persisted network samples, oldest first.
    pub fn network_samples(&self) -> Vec<NetworkStateSample> {
        self.scan_typed(Keyspace::NetworkSamples)
            .into_iter()
            .map(|(_, s)| s)
            .collect()
    }

    /// Drops samples taken before `before`. Returns how many were dropped.
    pub fn prune_network_samples(&self, before: Timestamp) -> CoreResult<usize> {
        let cutoff = format!("{before:020}");
        let mut pruned = 0;
        for (key, _) in self.scan(Keyspace::NetworkSamples) {
            if key.as_str() < cutoff.as_str() && self.delete(Keyspace::NetworkSamples, &key)? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawsync_protocol::{ConnectionType, Dog};

    fn dog(name: &str) -> EntityPayload {
        EntityPayload::Dog(Dog {
            name: name.into(),
            breed: None,
            birth_date: None,
            weight_kg: Some(20.0),
            allergies: vec![],
            tags: vec![],
        })
    }

    #[test]
    fn entity_helpers() {
        let store = LocalStore::in_memory().unwrap();
        let record = EntityRecord::new("rex", dog("Rex"), 5).unwrap();
        store.put_entity(&record).unwrap();

        let r = EntityRef::new(EntityType::Dog, "rex");
        assert_eq!(store.get_entity(&r).unwrap().unwrap(), record);
        assert!(record.checksum_matches().unwrap());
        assert_eq!(store.list_entities(Some(EntityType::Dog)).len(), 1);
        assert!(store.list_entities(Some(EntityType::Feeding)).is_empty());
        assert!(store.delete_entity(&r).unwrap());
        assert!(!store.entity_exists(&r));
    }

    #[test]
    fn set_payload_refreshes_checksum() {
        let mut record = EntityRecord::new("rex", dog("Rex"), 5).unwrap();
        let before = record.checksum;
        record.set_payload(dog("Rexy"), 6).unwrap();
        assert_ne!(record.checksum, before);
        assert!(record.checksum_matches().unwrap());
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_entity_key("feeding/7").as_deref(), Some("feeding/7"));
        assert_eq!(normalize_entity_key("Feedings/ 7 ").as_deref(), Some("feeding/7"));
        assert_eq!(normalize_entity_key("HEALTH_ENTRY/x").as_deref(), Some("health_entry/x"));
        assert_eq!(normalize_entity_key("feeding/ "), None);
        assert_eq!(normalize_entity_key("cat/1"), None);
        assert_eq!(normalize_entity_key("no-slash"), None);
    }

    #[test]
    fn network_sample_retention() {
        let store = LocalStore::in_memory().unwrap();
        for ts in [100, 200, 300] {
            let sample = NetworkStateSample::connected(ConnectionType::Wifi, Some(2000), Some(20), ts);
            store.append_network_sample(&sample).unwrap();
        }
        assert_eq!(store.prune_network_samples(250).unwrap(), 2);
        let left = store.network_samples();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 300);
    }
}
