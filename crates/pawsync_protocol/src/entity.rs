//! Dog-care entities replicated by the engine.
//!
//! Payloads are tagged variants with a fixed schema per [`EntityType`]. The
//! conflict resolver works on them through [`FieldMap`]s: a payload is
//! flattened into `field name -> CBOR value`, merged field by field, and
//! rebuilt with [`EntityPayload::from_fields`], which rejects any merge result
//! that no longer fits the variant's schema.

use crate::error::{ProtocolError, ProtocolResult};
use crate::Timestamp;
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Flattened view of a payload used for field-level merges.
pub type FieldMap = BTreeMap<String, Value>;

/// Kind of replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A dog profile.
    Dog,
    /// A single feeding.
    Feeding,
    /// A health journal entry.
    HealthEntry,
    /// A medication schedule.
    Medication,
    /// A known allergy.
    Allergy,
    /// A weight target.
    WeightGoal,
    /// A food product.
    Product,
}

impl EntityType {
    /// Every entity type, in a stable order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Dog,
        EntityType::Feeding,
        EntityType::HealthEntry,
        EntityType::Medication,
        EntityType::Allergy,
        EntityType::WeightGoal,
        EntityType::Product,
    ];

    /// Stable lowercase name used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Dog => "dog",
            EntityType::Feeding => "feeding",
            EntityType::HealthEntry => "health_entry",
            EntityType::Medication => "medication",
            EntityType::Allergy => "allergy",
            EntityType::WeightGoal => "weight_goal",
            EntityType::Product => "product",
        }
    }

    /// Remote collection the entity type is stored in.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Dog => "dogs",
            EntityType::Feeding => "feedings",
            EntityType::HealthEntry => "health_entries",
            EntityType::Medication => "medications",
            EntityType::Allergy => "allergies",
            EntityType::WeightGoal => "weight_goals",
            EntityType::Product => "products",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.collection() == s)
            .ok_or_else(|| ProtocolError::InvalidMutation(format!("unknown entity type `{s}`")))
    }
}

/// Reference to a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity identifier (unique within its type).
    pub entity_id: String,
}

impl EntityRef {
    /// Creates a reference.
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    /// Checks that `id` is usable as an entity id: not blank, and with no
    /// surrounding whitespace, which canonical keys never carry.
    pub fn check_id(id: &str) -> ProtocolResult<()> {
        if id.trim().is_empty() || id.trim() != id {
            return Err(ProtocolError::InvalidEntityId(id.to_string()));
        }
        Ok(())
    }

    /// Canonical key of the entity inside the local store.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.entity_type.as_str(), self.entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}

/// A dog profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dog {
    /// Display name.
    pub name: String,
    /// Breed, if known.
    pub breed: Option<String>,
    /// ISO-8601 birth date.
    pub birth_date: Option<String>,
    /// Last recorded weight.
    pub weight_kg: Option<f64>,
    /// Free-form allergy labels shown on the profile.
    pub allergies: Vec<String>,
    /// User tags.
    pub tags: Vec<String>,
}

/// A single feeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feeding {
    /// Owning dog.
    pub dog_id: String,
    /// Product fed, if picked from the food database.
    pub product_id: Option<String>,
    /// Amount in grams.
    pub amount_grams: u32,
    /// When the dog was fed.
    pub fed_at: Timestamp,
    /// Notes.
    pub notes: Option<String>,
}

/// A health journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEntry {
    /// Owning dog.
    pub dog_id: String,
    /// When the observation was made.
    pub recorded_at: Timestamp,
    /// Weight at the time, if measured.
    pub weight_kg: Option<f64>,
    /// Observed symptoms.
    pub symptoms: Vec<String>,
    /// Notes.
    pub notes: Option<String>,
    /// Whether a vet was consulted.
    pub vet_visit: bool,
}

/// A medication schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    /// Owning dog.
    pub dog_id: String,
    /// Drug name.
    pub name: String,
    /// Dose, e.g. `5mg`.
    pub dosage: String,
    /// Schedule, e.g. `twice daily`.
    pub frequency: String,
    /// ISO-8601 start date.
    pub start_date: Option<String>,
    /// ISO-8601 end date.
    pub end_date: Option<String>,
    /// Whether the schedule is current.
    pub active: bool,
}

/// A known allergy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allergy {
    /// Owning dog.
    pub dog_id: String,
    /// What the dog reacts to.
    pub allergen: String,
    /// `mild`, `moderate` or `severe`.
    pub severity: String,
    /// Observed reaction.
    pub reaction: Option<String>,
}

/// A weight target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightGoal {
    /// Owning dog.
    pub dog_id: String,
    /// Target weight.
    pub target_kg: f64,
    /// ISO-8601 deadline.
    pub deadline: Option<String>,
    /// Whether the goal is being tracked.
    pub active: bool,
}

/// A food product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Product name.
    pub name: String,
    /// Brand.
    pub brand: Option<String>,
    /// Energy density.
    pub calories_per_100g: Option<u32>,
    /// Ingredient list.
    pub ingredients: Vec<String>,
}

/// An entity snapshot, tagged by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    /// Dog profile.
    Dog(Dog),
    /// Feeding.
    Feeding(Feeding),
    /// Health entry.
    HealthEntry(HealthEntry),
    /// Medication.
    Medication(Medication),
    /// Allergy.
    Allergy(Allergy),
    /// Weight goal.
    WeightGoal(WeightGoal),
    /// Product.
    Product(Product),
}

impl EntityPayload {
    /// Returns the type of this payload.
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Dog(_) => EntityType::Dog,
            EntityPayload::Feeding(_) => EntityType::Feeding,
            EntityPayload::HealthEntry(_) => EntityType::HealthEntry,
            EntityPayload::Medication(_) => EntityType::Medication,
            EntityPayload::Allergy(_) => EntityType::Allergy,
            EntityPayload::WeightGoal(_) => EntityType::WeightGoal,
            EntityPayload::Product(_) => EntityType::Product,
        }
    }

    /// Entities this payload points at.
    pub fn references(&self) -> Vec<EntityRef> {
        let dog = |id: &str| EntityRef::new(EntityType::Dog, id);
        match self {
            EntityPayload::Dog(_) | EntityPayload::Product(_) => Vec::new(),
            EntityPayload::Feeding(f) => {
                let mut refs = vec![dog(&f.dog_id)];
                if let Some(product_id) = &f.product_id {
                    refs.push(EntityRef::new(EntityType::Product, product_id.as_str()));
                }
                refs
            }
            EntityPayload::HealthEntry(h) => vec![dog(&h.dog_id)],
            EntityPayload::Medication(m) => vec![dog(&m.dog_id)],
            EntityPayload::Allergy(a) => vec![dog(&a.dog_id)],
            EntityPayload::WeightGoal(w) => vec![dog(&w.dog_id)],
        }
    }

    /// Flattens the payload into a field map.
    pub fn to_fields(&self) -> ProtocolResult<FieldMap> {
        let value = match self {
            EntityPayload::Dog(v) => Value::serialized(v),
            EntityPayload::Feeding(v) => Value::serialized(v),
            EntityPayload::HealthEntry(v) => Value::serialized(v),
            EntityPayload::Medication(v) => Value::serialized(v),
            EntityPayload::Allergy(v) => Value::serialized(v),
            EntityPayload::WeightGoal(v) => Value::serialized(v),
            EntityPayload::Product(v) => Value::serialized(v),
        }
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;

        let Value::Map(pairs) = value else {
            return Err(ProtocolError::Encode(format!(
                "{} payload did not serialize to a map",
                self.entity_type()
            )));
        };

        pairs
            .into_iter()
            .map(|(key, value)| match key {
                Value::Text(name) => Ok((name, value)),
                other => Err(ProtocolError::Encode(format!(
                    "non-text field key {other:?}"
                ))),
            })
            .collect()
    }

    /// Rebuilds a payload of `entity_type` from a field map.
    pub fn from_fields(entity_type: EntityType, fields: FieldMap) -> ProtocolResult<Self> {
        let value = Value::Map(
            fields
                .into_iter()
                .map(|(name, value)| (Value::Text(name), value))
                .collect(),
        );
        let decode_err = |e: ciborium::value::Error| ProtocolError::Decode(e.to_string());

        Ok(match entity_type {
            EntityType::Dog => EntityPayload::Dog(value.deserialized().map_err(decode_err)?),
            EntityType::Feeding => {
                EntityPayload::Feeding(value.deserialized().map_err(decode_err)?)
            }
            EntityType::HealthEntry => {
                EntityPayload::HealthEntry(value.deserialized().map_err(decode_err)?)
            }
            EntityType::Medication => {
                EntityPayload::Medication(value.deserialized().map_err(decode_err)?)
            }
            EntityType::Allergy => {
                EntityPayload::Allergy(value.deserialized().map_err(decode_err)?)
            }
            EntityType::WeightGoal => {
                EntityPayload::WeightGoal(value.deserialized().map_err(decode_err)?)
            }
            EntityType::Product => {
                EntityPayload::Product(value.deserialized().map_err(decode_err)?)
            }
        })
    }

    /// Fails unless the payload is of `expected` type.
    pub fn ensure_type(&self, expected: EntityType) -> ProtocolResult<()> {
        let actual = self.entity_type();
        if actual == expected {
            Ok(())
        } else {
            Err(ProtocolError::TypeMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}
