//! Current state and metadata per entity.

use crate::entity::EntityKey;
use crate::error::{CoreError, CoreResult};
use crate::state::PluginState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Free-form key/value bag attached to an entity, orthogonal to its state.
pub type StateMetadata = BTreeMap<String, Value>;

/// Metadata keys that would shadow the lifecycle state.
const RESERVED_METADATA_KEYS: &[&str] = &["state"];

/// The recorded state of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Current state.
    pub state: PluginState,
    /// When the state was last written (unix millis).
    pub updated_at: u64,
}

/// Holds the single authoritative state of every entity.
///
/// Writes happen only through [`StateStore::update_with`], which the
/// coordinator calls while holding the entity's lease. Entities without
/// a recorded state are `Unknown`.
pub struct StateStore {
    states: RwLock<HashMap<EntityKey, StateEntry>>,
    metadata: RwLock<HashMap<EntityKey, StateMetadata>>,
}

impl StateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the current state of an entity.
    pub fn get(&self, entity: &EntityKey) -> PluginState {
        self.entry(entity).map(|e| e.state).unwrap_or_default()
    }

    /// Returns the recorded entry, if the entity was ever written.
    pub fn entry(&self, entity: &EntityKey) -> Option<StateEntry> {
        self.states.read().get(entity).copied()
    }

    /// Atomically reads the current state and, if `decide` returns a
    /// target, writes it.
    ///
    /// Write times strictly increase per entity: a write landing in the
    /// same millisecond as the previous one is stamped one past it, so
    /// readers can order writes by timestamp alone.
    ///
    /// Returns the previous state and the entry written, if any.
    pub(crate) fn update_with<F>(
        &self,
        entity: &EntityKey,
        timestamp: u64,
        decide: F,
    ) -> (PluginState, Option<StateEntry>)
    where
        F: FnOnce(PluginState) -> Option<PluginState>,
    {
        let mut states = self.states.write();
        let previous = states.get(entity).copied();
        let current = previous.map(|e| e.state).unwrap_or_default();

        match decide(current) {
            Some(next) => {
                let entry = StateEntry {
                    state: next,
                    updated_at: previous
                        .map_or(timestamp, |e| timestamp.max(e.updated_at.saturating_add(1))),
                };
                states.insert(entity.clone(), entry);
                (current, Some(entry))
            }
            None => (current, None),
        }
    }

    /// Returns a copy of the entity's metadata.
    pub fn metadata(&self, entity: &EntityKey) -> StateMetadata {
        self.metadata.read().get(entity).cloned().unwrap_or_default()
    }

    /// Returns one metadata value.
    pub fn metadata_value(&self, entity: &EntityKey, key: &str) -> Option<Value> {
        self.metadata
            .read()
            .get(entity)
            .and_then(|bag| bag.get(key))
            .cloned()
    }

    /// Sets one metadata value, returning the previous one.
    pub fn set_metadata(
        &self,
        entity: &EntityKey,
        key: &str,
        value: Value,
    ) -> CoreResult<Option<Value>> {
        if RESERVED_METADATA_KEYS.contains(&key) {
            return Err(CoreError::ReservedMetadataKey(key.to_string()));
        }

        Ok(self
            .metadata
            .write()
            .entry(entity.clone())
            .or_default()
            .insert(key.to_string(), value))
    }

    /// Removes one metadata value.
    pub fn remove_metadata(&self, entity: &EntityKey, key: &str) -> Option<Value> {
        let mut metadata = self.metadata.write();
        let bag = metadata.get_mut(entity)?;
        let removed = bag.remove(key);
        if bag.is_empty() {
            metadata.remove(entity);
        }
        removed
    }

    /// Returns every entity with a recorded state or metadata, sorted.
    pub fn entities(&self) -> Vec<EntityKey> {
        let mut keys: BTreeSet<EntityKey> = self.states.read().keys().cloned().collect();
        keys.extend(self.metadata.read().keys().cloned());
        keys.into_iter().collect()
    }

    /// Returns the number of entities with a recorded state.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Returns true if no state was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> EntityKey {
        EntityKey::parse(s).unwrap()
    }

    #[test]
    fn absent_entity_is_unknown() {
        let store = StateStore::new();
        assert_eq!(store.get(&key("acme/widget")), PluginState::Unknown);
        assert!(store.entry(&key("acme/widget")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn update_with_writes_decision() {
        let store = StateStore::new();
        let entity = key("acme/widget");

        let (from, written) = store.update_with(&entity, 10, |_| Some(PluginState::Checking));
        assert_eq!(from, PluginState::Unknown);
        assert_eq!(written.map(|e| e.state), Some(PluginState::Checking));

        let entry = store.entry(&entity).unwrap();
        assert_eq!(entry.state, PluginState::Checking);
        assert_eq!(entry.updated_at, 10);
    }

    #[test]
    fn update_with_declined_leaves_state() {
        let store = StateStore::new();
        let entity = key("acme/widget");
        store.update_with(&entity, 10, |_| Some(PluginState::Available));

        let (from, written) = store.update_with(&entity, 20, |_| None);
        assert_eq!(from, PluginState::Available);
        assert!(written.is_none());
        assert_eq!(store.entry(&entity).unwrap().updated_at, 10);
    }

    #[test]
    fn write_times_strictly_increase() {
        let store = StateStore::new();
        let entity = key("acme/widget");
        store.update_with(&entity, 10, |_| Some(PluginState::Checking));

        let (_, same_ms) = store.update_with(&entity, 10, |_| Some(PluginState::Available));
        assert_eq!(same_ms.unwrap().updated_at, 11);

        // A clock that stepped back does not reorder writes either.
        let (_, earlier) = store.update_with(&entity, 5, |_| Some(PluginState::Installing));
        assert_eq!(earlier.unwrap().updated_at, 12);

        let (_, later) = store.update_with(&entity, 50, |_| Some(PluginState::Error));
        assert_eq!(later.unwrap().updated_at, 50);
    }

    #[test]
    fn metadata_roundtrip() {
        let store = StateStore::new();
        let entity = key("acme/widget");

        assert!(store
            .set_metadata(&entity, "protected", json!(true))
            .unwrap()
            .is_none());
        assert_eq!(
            store.metadata_value(&entity, "protected"),
            Some(json!(true))
        );
        assert_eq!(store.metadata(&entity).len(), 1);

        // Metadata alone does not give the entity a state.
        assert_eq!(store.get(&entity), PluginState::Unknown);
        assert_eq!(store.entities(), vec![entity.clone()]);

        assert_eq!(store.remove_metadata(&entity, "protected"), Some(json!(true)));
        assert!(store.metadata(&entity).is_empty());
        assert!(store.entities().is_empty());
    }

    #[test]
    fn reserved_metadata_key() {
        let store = StateStore::new();
        let err = store
            .set_metadata(&key("acme/widget"), "state", json!("installed_active"))
            .unwrap_err();
        assert_eq!(err, CoreError::ReservedMetadataKey("state".into()));
    }
}
