//! Property-based test generators using proptest.
//!
//! Provides strategies for generating payloads, mutation sequences and
//! network samples that satisfy the engine's validation rules.

use pawsync_protocol::{
    ConnectionType, EntityPayload, Mutation, NetworkStateSample, Timestamp,
};
use proptest::prelude::*;

use crate::fixtures::{payloads, TEST_EPOCH};

/// Strategy for generating valid entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9][a-z0-9-]{0,11}").expect("Invalid regex")
}

/// Strategy for generating feeding payloads for `dog_id`.
pub fn feeding_strategy(dog_id: &'static str) -> impl Strategy<Value = EntityPayload> {
    (1u32..2_000).prop_map(move |grams| payloads::feeding(dog_id, grams))
}

/// Strategy for generating a payload of any entity type.
pub fn entity_payload_strategy() -> impl Strategy<Value = EntityPayload> {
    prop_oneof![
        "[A-Z][a-z]{2,8}".prop_map(|name| payloads::dog(&name)),
        (1u32..2_000).prop_map(|g| payloads::feeding("rex", g)),
        prop::collection::vec("[a-z]{3,8}", 0..4).prop_map(|symptoms| {
            let refs: Vec<&str> = symptoms.iter().map(String::as_str).collect();
            payloads::health_entry("rex", &refs)
        }),
        (1u32..50).prop_map(|mg| payloads::medication("rex", &format!("{mg}mg"))),
        prop_oneof![Just("mild"), Just("moderate"), Just("severe")]
            .prop_map(|sev| payloads::allergy("rex", "chicken", sev)),
        (5.0f64..60.0).prop_map(|kg| payloads::weight_goal("rex", kg)),
        prop::collection::vec("[a-z]{3,8}", 0..6).prop_map(|ingredients| {
            let refs: Vec<&str> = ingredients.iter().map(String::as_str).collect();
            payloads::product("Kibble", &refs)
        }),
    ]
}

/// A feeding update in a generated sequence.
#[derive(Debug, Clone)]
pub struct GeneratedUpdate {
    /// Target feeding id.
    pub entity_id: String,
    /// Amount written.
    pub grams: u32,
    /// Client timestamp.
    pub timestamp: Timestamp,
}

impl GeneratedUpdate {
    /// The mutation this update enqueues.
    pub fn mutation(&self) -> Mutation {
        Mutation::update(self.entity_id.as_str(), payloads::feeding("rex", self.grams))
            .with_timestamp(self.timestamp)
    }
}

/// Strategy for sequences of feeding updates over at most `entities`
/// entities, with timestamps in arbitrary order.
pub fn update_sequence_strategy(
    entities: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<GeneratedUpdate>> {
    let entities = entities.max(1);
    prop::collection::vec(
        (0..entities, 1u32..2_000, 0u64..10_000),
        1..=max_len.max(1),
    )
    .prop_map(|raw| {
        raw.into_iter()
            .map(|(e, grams, offset)| GeneratedUpdate {
                entity_id: format!("f{e}"),
                grams,
                timestamp: TEST_EPOCH + offset,
            })
            .collect()
    })
}

/// Strategy for generating network samples.
pub fn network_sample_strategy() -> impl Strategy<Value = NetworkStateSample> {
    (
        prop_oneof![
            Just(ConnectionType::None),
            Just(ConnectionType::Wifi),
            Just(ConnectionType::Mobile3G),
            Just(ConnectionType::Mobile4G),
            Just(ConnectionType::Ethernet),
        ],
        prop::option::of(1u32..100_000),
        prop::option::of(1u32..3_000),
        0u64..1_000_000,
    )
        .prop_map(|(ty, bw, lat, ts)| {
            if ty == ConnectionType::None {
                NetworkStateSample::disconnected(TEST_EPOCH + ts)
            } else {
                NetworkStateSample::connected(ty, bw, lat, TEST_EPOCH + ts)
            }
        })
}
