//! The engine's own schema steps.

use super::{Migration, MigrationContext, MigrationVersion};
use crate::error::CoreResult;
use crate::store::{normalize_entity_key, EntityRecord, Keyspace};
use pawsync_protocol::{payload_checksum, SyncStateRecord};
use tracing::warn;

/// Schema version produced by the built-in steps.
pub const LATEST_SCHEMA_VERSION: MigrationVersion = 3;

/// v1: creates the sync state singleton of a user.
#[derive(Debug, Clone)]
pub struct InitializeSyncState {
    user_id: String,
}

impl InitializeSyncState {
    /// For `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl Migration for InitializeSyncState {
    fn version(&self) -> MigrationVersion {
        1
    }

    fn name(&self) -> &str {
        "initialize_sync_state"
    }

    fn description(&self) -> Option<&str> {
        Some("create the per-user sync state record")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        if ctx.store().load_sync_state(&self.user_id)?.is_none() {
            ctx.store().save_sync_state(&SyncStateRecord::new(self.user_id.as_str()))?;
            ctx.custom(&format!("created sync state for {}", self.user_id));
        }
        Ok(())
    }
}

/// v2: fills in payload checksums missing from records written before they existed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillPayloadChecksums;

impl Migration for BackfillPayloadChecksums {
    fn version(&self) -> MigrationVersion {
        2
    }

    fn name(&self) -> &str {
        "backfill_payload_checksums"
    }

    fn description(&self) -> Option<&str> {
        Some("compute SHA-256 checksums for entity records that lack one")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        let mut rewritten = 0;
        for (key, mut record) in ctx.store().scan_typed::<EntityRecord>(Keyspace::Entities) {
            if record.checksum == [0u8; 32] {
                record.checksum = payload_checksum(&record.payload)?;
                ctx.store().put_typed(Keyspace::Entities, &key, &record)?;
                rewritten += 1;
            }
        }
        ctx.rewrote(Keyspace::Entities, rewritten);
        Ok(())
    }
}

/// v3: moves entity records stored under legacy keys (`Feedings/ 7`) to the
/// canonical `feeding/7`. When both exist the newer record is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeEntityKeys;

impl Migration for NormalizeEntityKeys {
    fn version(&self) -> MigrationVersion {
        3
    }

    fn name(&self) -> &str {
        "normalize_entity_keys"
    }

    fn description(&self) -> Option<&str> {
        Some("rewrite entity keys to lowercase type/id form")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        let store = ctx.store();
        let mut moved = 0;
        for (key, record) in store.scan_typed::<EntityRecord>(Keyspace::Entities) {
            let Some(canonical) = normalize_entity_key(&key) else {
                warn!(key = %key, "entity key does not name an entity; leaving it for repair");
                continue;
            };
            if canonical == key || record.entity_ref().storage_key() == key {
                continue;
            }
            let keep = match store.get_typed::<EntityRecord>(Keyspace::Entities, &canonical)? {
                Some(existing) => record.updated_at > existing.updated_at,
                None => true,
            };
            if keep {
                store.put_typed(Keyspace::Entities, &canonical, &record)?;
            }
            store.delete(Keyspace::Entities, &key)?;
            moved += 1;
        }
        ctx.moved(Keyspace::Entities, moved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::MigrationRunner;
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LocalStore;
    use pawsync_protocol::{encode, Dog, EntityPayload, EntityRef, EntityType};
    use std::sync::Arc;

    fn dog(name: &str) -> EntityPayload {
        EntityPayload::Dog(Dog {
            name: name.into(),
            breed: None,
            birth_date: None,
            weight_kg: None,
            allergies: vec![],
            tags: vec![],
        })
    }

    #[test]
    fn builtin_steps_upgrade_a_legacy_store() {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let mut legacy = EntityRecord::new("rex", dog("Rex"), 10).unwrap();
        legacy.checksum = [0u8; 32];
        store
            .put(Keyspace::Entities, "Dogs/rex", encode(&legacy).unwrap())
            .unwrap();
        let older = EntityRecord::new("max", dog("Old Max"), 1).unwrap();
        let newer = EntityRecord::new("max", dog("Max"), 2).unwrap();
        store.put_entity(&older).unwrap();
        store
            .put(Keyspace::Entities, "DOG/max ", encode(&newer).unwrap())
            .unwrap();

        let runner =
            MigrationRunner::with_builtin(store.clone(), Arc::new(ManualClock::new(0)), "owner").unwrap();
        runner.validate().unwrap();
        assert_eq!(runner.latest_version(), LATEST_SCHEMA_VERSION);

        let result = runner.migrate_to_latest().unwrap();
        assert!(result.is_success());
        assert_eq!(result.final_version, LATEST_SCHEMA_VERSION);

        assert!(store.load_sync_state("owner").unwrap().is_some());
        let rex = store
            .get_entity(&EntityRef::new(EntityType::Dog, "rex"))
            .unwrap()
            .unwrap();
        assert!(rex.checksum_matches().unwrap());
        let max = store
            .get_entity(&EntityRef::new(EntityType::Dog, "max"))
            .unwrap()
            .unwrap();
        assert_eq!(max.payload, dog("Max"));
        assert_eq!(store.count(Keyspace::Entities), 2);
        assert!(runner.ensure_sync_allowed().is_ok());
    }

    #[test]
    fn records_already_at_their_own_key_stay_put() {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let padded = EntityRecord::new("bella ", dog("Bella"), 3).unwrap();
        store.put_entity(&padded).unwrap();

        let runner =
            MigrationRunner::with_builtin(store.clone(), Arc::new(ManualClock::new(0)), "owner").unwrap();
        assert!(runner.migrate_to_latest().unwrap().is_success());

        assert_eq!(store.scan(Keyspace::Entities).len(), 1);
        let kept = store.get_entity(&padded.entity_ref()).unwrap().unwrap();
        assert_eq!(kept.payload, dog("Bella"));
    }

    #[test]
    fn steps_are_idempotent() {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let runner = MigrationRunner::with_builtin(store.clone(), Arc::new(ManualClock::new(0)), "owner").unwrap();
        runner.migrate_to_latest().unwrap();
        let before = store.scan(Keyspace::Entities);

        let mut ctx = MigrationContext::new(&store, 3);
        NormalizeEntityKeys.up(&mut ctx).unwrap();
        BackfillPayloadChecksums.up(&mut ctx).unwrap();
        InitializeSyncState::new("owner").up(&mut ctx).unwrap();
        assert_eq!(store.scan(Keyspace::Entities), before);
    }
}
