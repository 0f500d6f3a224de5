//! Test fixtures and store helpers.

use pawsync_core::{
    ChangeQueue, ConflictResolver, EngineConfig, IntegrityChecker, LocalStore, ManualClock,
    PolicyTable, StoreConfig,
};
use pawsync_storage::InMemoryBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Start time of every test clock.
pub const TEST_EPOCH: u64 = 1_700_000_000_000;

/// A local store with automatic cleanup.
pub struct TestStore {
    /// The store.
    pub store: Arc<LocalStore>,
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// An in-memory store.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(LocalStore::in_memory().expect("Failed to open in-memory store")),
            _temp_dir: None,
        }
    }

    /// An in-memory store plus a handle on its backend, for corrupting bytes
    /// and reopening.
    pub fn memory_with_backend() -> (Self, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let store = LocalStore::open(Box::new(backend.clone()), StoreConfig::default())
            .expect("Failed to open in-memory store");
        (
            Self {
                store: Arc::new(store),
                _temp_dir: None,
            },
            backend,
        )
    }

    /// Reopens a store over `backend`, replaying its log.
    pub fn reopen(backend: &InMemoryBackend) -> Self {
        let store = LocalStore::open(Box::new(backend.clone()), StoreConfig::default())
            .expect("Failed to reopen store");
        Self {
            store: Arc::new(store),
            _temp_dir: None,
        }
    }

    /// A file-backed store in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = LocalStore::open_file(&temp_dir.path().join("replica.log"), StoreConfig::default())
            .expect("Failed to open file store");
        Self {
            store: Arc::new(store),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Log path if file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("replica.log"))
    }
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Store, queue, resolver and checker wired to one manual clock.
pub struct TestEngine {
    /// Shared clock, starting at [`TEST_EPOCH`].
    pub clock: Arc<ManualClock>,
    /// Replica.
    pub store: Arc<LocalStore>,
    /// Outbox.
    pub queue: Arc<ChangeQueue>,
    /// Resolver using the stock policy table for `config`.
    pub resolver: Arc<ConflictResolver>,
    /// Integrity checker.
    pub checker: IntegrityChecker,
    /// Configuration the parts were built from.
    pub config: EngineConfig,
}

impl TestEngine {
    /// An engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::new("test-user"))
    }

    /// An engine over an in-memory store.
    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(LocalStore::in_memory().expect("Failed to open in-memory store"));
        Self::over(store, config)
    }

    /// An engine over an existing store, for reopen tests.
    pub fn over(store: Arc<LocalStore>, config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let queue = Arc::new(
            ChangeQueue::open(store.clone(), config.queue.clone(), clock.clone())
                .expect("Failed to open queue"),
        );
        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            queue.clone(),
            PolicyTable::from_config(&config),
            clock.clone(),
        ));
        let checker = IntegrityChecker::new(store.clone(), queue.clone(), clock.clone())
            .with_results_kept(config.retention.integrity_results_kept);
        Self {
            clock,
            store,
            queue,
            resolver,
            checker,
            config,
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test with a fresh in-memory engine.
pub fn with_test_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::new();
    f(&engine)
}

/// Runs a test with a temporary file-backed store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore, &std::path::Path) -> R,
{
    let store = TestStore::file();
    let path = store.path().expect("File store should have a path");
    f(&store, &path)
}

/// Sample payloads.
pub mod payloads {
    use pawsync_protocol::{
        Allergy, Dog, EntityPayload, Feeding, HealthEntry, Medication, Product, WeightGoal,
    };

    /// A dog with no extras.
    pub fn dog(name: &str) -> EntityPayload {
        EntityPayload::Dog(Dog {
            name: name.to_string(),
            breed: Some("Labrador".to_string()),
            birth_date: Some("2019-04-01".to_string()),
            weight_kg: Some(28.5),
            allergies: Vec::new(),
            tags: Vec::new(),
        })
    }

    /// A feeding of `grams` for `dog_id`.
    pub fn feeding(dog_id: &str, grams: u32) -> EntityPayload {
        EntityPayload::Feeding(Feeding {
            dog_id: dog_id.to_string(),
            product_id: None,
            amount_grams: grams,
            fed_at: super::TEST_EPOCH,
            notes: None,
        })
    }

    /// An active daily medication.
    pub fn medication(dog_id: &str, dosage: &str) -> EntityPayload {
        EntityPayload::Medication(Medication {
            dog_id: dog_id.to_string(),
            name: "Carprofen".to_string(),
            dosage: dosage.to_string(),
            frequency: "daily".to_string(),
            start_date: Some("2024-01-01".to_string()),
            end_date: None,
            active: true,
        })
    }

    /// A health entry listing `symptoms`.
    pub fn health_entry(dog_id: &str, symptoms: &[&str]) -> EntityPayload {
        EntityPayload::HealthEntry(HealthEntry {
            dog_id: dog_id.to_string(),
            recorded_at: super::TEST_EPOCH,
            weight_kg: None,
            symptoms: symptoms.iter().map(|s| s.to_string()).collect(),
            notes: None,
            vet_visit: false,
        })
    }

    /// An allergy.
    pub fn allergy(dog_id: &str, allergen: &str, severity: &str) -> EntityPayload {
        EntityPayload::Allergy(Allergy {
            dog_id: dog_id.to_string(),
            allergen: allergen.to_string(),
            severity: severity.to_string(),
            reaction: None,
        })
    }

    /// An active weight goal.
    pub fn weight_goal(dog_id: &str, target_kg: f64) -> EntityPayload {
        EntityPayload::WeightGoal(WeightGoal {
            dog_id: dog_id.to_string(),
            target_kg,
            deadline: None,
            active: true,
        })
    }

    /// A food product.
    pub fn product(name: &str, ingredients: &[&str]) -> EntityPayload {
        EntityPayload::Product(Product {
            name: name.to_string(),
            brand: None,
            calories_per_100g: Some(350),
            ingredients: ingredients.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use pawsync_protocol::Mutation;

    /// An engine holding `dogs` dogs with `feedings_per_dog` feedings each,
    /// all still queued.
    pub fn populated_engine(dogs: usize, feedings_per_dog: usize) -> TestEngine {
        let engine = TestEngine::new();
        for d in 0..dogs {
            let dog_id = format!("dog-{d}");
            engine
                .queue
                .enqueue(Mutation::create(dog_id.as_str(), payloads::dog(&format!("Dog {d}"))))
                .expect("Failed to enqueue dog");
            for f in 0..feedings_per_dog {
                engine
                    .queue
                    .enqueue(Mutation::create(
                        format!("{dog_id}-feeding-{f}"),
                        payloads::feeding(&dog_id, 100 + f as u32),
                    ))
                    .expect("Failed to enqueue feeding");
            }
        }
        engine
    }

    /// A host configuration as JSON, the way an app would hand it over.
    pub fn sample_config_json() -> serde_json::Value {
        serde_json::json!({
            "user_id": "owner-1",
            "offline_mode": "advanced",
            "sync_on_wifi_only": true,
            "conflict_resolution": "last_write_wins",
            "type_policies": { "health_entry": "merge", "medication": "manual_review" },
            "queue": { "max_attempts": 3 }
        })
    }

    /// [`sample_config_json`] parsed.
    pub fn sample_config() -> EngineConfig {
        serde_json::from_value(sample_config_json()).expect("Sample config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawsync_core::OfflineMode;
    use pawsync_protocol::{ConflictPolicy, EntityType};

    #[test]
    fn populated_engine_queues_everything() {
        let engine = scenarios::populated_engine(2, 3);
        assert_eq!(engine.queue.status().total_items, 8);
        assert_eq!(engine.store.list_entities(Some(EntityType::Feeding)).len(), 6);
    }

    #[test]
    fn sample_config_parses() {
        let config = scenarios::sample_config();
        assert_eq!(config.user_id, "owner-1");
        assert_eq!(config.offline_mode, OfflineMode::Advanced);
        assert!(config.sync_on_wifi_only);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(
            config.type_policies.get(&EntityType::Medication),
            Some(&ConflictPolicy::ManualReview)
        );
    }

    #[test]
    fn file_store_persists() {
        with_file_store(|store, path| {
            store.put_entity(
                &pawsync_core::EntityRecord::new("rex", payloads::dog("Rex"), 1).unwrap(),
            )
            .unwrap();
            assert!(path.exists());
        });
    }
}
