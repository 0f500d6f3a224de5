//! Strategy table for conflict resolution.

use crate::config::EngineConfig;
use pawsync_protocol::{ConflictPolicy, EntityType};
use std::collections::HashMap;

/// Per-field override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Concurrent changes to this field always go to manual review.
    SafetyCritical,
    /// The local value wins when both sides changed the field.
    LocalWins,
    /// The server value wins when both sides changed the field.
    ServerWins,
}

/// Conflict policy keyed by entity type, overridable per field.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    default: ConflictPolicy,
    per_type: HashMap<EntityType, ConflictPolicy>,
    field_rules: HashMap<(EntityType, String), FieldRule>,
}

impl PolicyTable {
    /// A table that applies `default` to everything, with no field rules.
    pub fn new(default: ConflictPolicy) -> Self {
        Self {
            default,
            per_type: HashMap::new(),
            field_rules: HashMap::new(),
        }
    }

    /// The stock table: health entries merge; medication dose and schedule
    /// and allergy severity are safety-critical.
    pub fn with_defaults(default: ConflictPolicy) -> Self {
        Self::new(default)
            .with_type_policy(EntityType::HealthEntry, ConflictPolicy::Merge)
            .with_field_rule(EntityType::Medication, "dosage", FieldRule::SafetyCritical)
            .with_field_rule(EntityType::Medication, "frequency", FieldRule::SafetyCritical)
            .with_field_rule(EntityType::Allergy, "severity", FieldRule::SafetyCritical)
    }

    /// The stock table with the configured default and type overrides.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut table = Self::with_defaults(config.conflict_resolution);
        for (entity_type, policy) in &config.type_policies {
            table.per_type.insert(*entity_type, *policy);
        }
        table
    }

    /// Sets the policy of one entity type.
    #[must_use]
    pub fn with_type_policy(mut self, entity_type: EntityType, policy: ConflictPolicy) -> Self {
        self.per_type.insert(entity_type, policy);
        self
    }

    /// Sets a field rule.
    #[must_use]
    pub fn with_field_rule(mut self, entity_type: EntityType, field: &str, rule: FieldRule) -> Self {
        self.field_rules.insert((entity_type, field.to_string()), rule);
        self
    }

    /// Policy applied to `entity_type`.
    pub fn policy_for(&self, entity_type: EntityType) -> ConflictPolicy {
        self.per_type.get(&entity_type).copied().unwrap_or(self.default)
    }

    /// Rule for one field, if any.
    pub fn field_rule(&self, entity_type: EntityType, field: &str) -> Option<FieldRule> {
        self.field_rules.get(&(entity_type, field.to_string())).copied()
    }

    /// Whether concurrent changes to `field` need a person.
    pub fn is_safety_critical(&self, entity_type: EntityType, field: &str) -> bool {
        self.field_rule(entity_type, field) == Some(FieldRule::SafetyCritical)
    }

    /// Types whose payloads can be merged field by field.
    pub fn is_mergeable(entity_type: EntityType) -> bool {
        matches!(
            entity_type,
            EntityType::HealthEntry | EntityType::Dog | EntityType::Product
        )
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::with_defaults(ConflictPolicy::LastWriteWins)
    }
}

/// Label written to `resolved_by` for automatic resolutions.
pub(crate) fn auto_label(policy: ConflictPolicy) -> String {
    let name = match policy {
        ConflictPolicy::LocalWins => "local_wins",
        ConflictPolicy::ServerWins => "server_wins",
        ConflictPolicy::Merge => "merge",
        ConflictPolicy::LastWriteWins => "last_write_wins",
        ConflictPolicy::ManualReview => "manual_review",
    };
    format!("auto:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_table() {
        let table = PolicyTable::default();
        assert_eq!(table.policy_for(EntityType::HealthEntry), ConflictPolicy::Merge);
        assert_eq!(table.policy_for(EntityType::Feeding), ConflictPolicy::LastWriteWins);
        assert!(table.is_safety_critical(EntityType::Medication, "dosage"));
        assert!(!table.is_safety_critical(EntityType::Medication, "name"));
        assert!(table.is_safety_critical(EntityType::Allergy, "severity"));
        assert!(PolicyTable::is_mergeable(EntityType::Dog));
        assert!(!PolicyTable::is_mergeable(EntityType::Medication));
    }

    #[test]
    fn config_overrides_types() {
        let config = EngineConfig::default()
            .with_conflict_resolution(ConflictPolicy::ServerWins)
            .with_type_policy(EntityType::HealthEntry, ConflictPolicy::LocalWins);
        let table = PolicyTable::from_config(&config);
        assert_eq!(table.policy_for(EntityType::Feeding), ConflictPolicy::ServerWins);
        assert_eq!(table.policy_for(EntityType::HealthEntry), ConflictPolicy::LocalWins);
    }
}
