//! Tagged slots, stable keys and the parameter store.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{PcError, PcResult, Tensor};

/// Role of a learnable value. Fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Node state or prediction (`x`, `u`): relaxed during inference.
    NodeState,
    /// Layer parameter (weights, biases): trained from the relaxed state.
    LayerWeight,
    /// Values that take part in the structure but are never optimized.
    Static,
}

impl Role {
    /// Short name used by the textual filter syntax.
    pub fn name(&self) -> &'static str {
        match self {
            Role::NodeState => "node",
            Role::LayerWeight => "weight",
            Role::Static => "static",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "node" => Some(Role::NodeState),
            "weight" => Some(Role::LayerWeight),
            "static" => Some(Role::Static),
            _ => None,
        }
    }
}

/// Stable identity of a slot: arena index plus dotted path.
///
/// Ordering is by index first, which is registration (pre-)order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    index: usize,
    path: Arc<str>,
}

impl ParamKey {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// A tagged value: tensor, role, frozen bit and optional user tags.
#[derive(Debug, Clone)]
pub struct Slot {
    key: ParamKey,
    value: Tensor,
    role: Role,
    frozen: bool,
    tags: BTreeSet<String>,
}

impl Slot {
    pub fn key(&self) -> &ParamKey {
        &self.key
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Structural identity of a store: slot count plus a digest over paths and roles.
///
/// Values, shapes and frozen bits are not part of the structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub slots: usize,
    pub digest: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} slots/{:016x}", self.slots, self.digest)
    }
}

/// Arena of tagged slots owned by a model.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    slots: Vec<Slot>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trainable, untagged slot.
    ///
    /// # Errors
    /// `InvalidConfig` if `path` is empty or already registered.
    pub fn register(
        &mut self,
        path: impl Into<String>,
        value: Tensor,
        role: Role,
    ) -> PcResult<ParamKey> {
        self.register_tagged(path, value, role, false, &[])
    }

    /// Register a slot with an explicit frozen bit and user tags.
    pub fn register_tagged(
        &mut self,
        path: impl Into<String>,
        value: Tensor,
        role: Role,
        frozen: bool,
        tags: &[&str],
    ) -> PcResult<ParamKey> {
        let path = path.into();
        if path.is_empty() {
            return Err(PcError::InvalidConfig("slot path must not be empty".to_string()));
        }
        if self.find(&path).is_some() {
            return Err(PcError::InvalidConfig(format!(
                "slot `{path}` is already registered"
            )));
        }

        let key = ParamKey {
            index: self.slots.len(),
            path: Arc::from(path),
        };
        self.slots.push(Slot {
            key: key.clone(),
            value,
            role,
            frozen,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        });
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All slots in registration order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.slots.iter().map(|s| &s.key)
    }

    /// Look up a key by path.
    pub fn find(&self, path: &str) -> Option<&ParamKey> {
        self.slots.iter().map(|s| &s.key).find(|k| k.path() == path)
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.slots.get(key.index).is_some_and(|s| s.key == *key)
    }

    /// Slot addressed by `key`; index and path must both match.
    ///
    /// # Errors
    /// `UnknownKey` if the key does not belong to this store.
    pub fn slot(&self, key: &ParamKey) -> PcResult<&Slot> {
        match self.slots.get(key.index) {
            Some(slot) if slot.key == *key => Ok(slot),
            _ => Err(PcError::UnknownKey(key.path().to_string())),
        }
    }

    fn slot_mut(&mut self, key: &ParamKey) -> PcResult<&mut Slot> {
        match self.slots.get_mut(key.index) {
            Some(slot) if slot.key == *key => Ok(slot),
            _ => Err(PcError::UnknownKey(key.path().to_string())),
        }
    }

    pub fn get(&self, key: &ParamKey) -> PcResult<&Tensor> {
        self.slot(key).map(|s| &s.value)
    }

    pub fn value_mut(&mut self, key: &ParamKey) -> PcResult<&mut Tensor> {
        self.slot_mut(key).map(|s| &mut s.value)
    }

    /// Overwrite a slot value. Shapes may change (e.g. a new batch size).
    pub fn set(&mut self, key: &ParamKey, value: Tensor) -> PcResult<()> {
        self.slot_mut(key)?.value = value;
        Ok(())
    }

    /// Toggle the frozen bit; the only tag attribute that may change after construction.
    pub fn set_frozen(&mut self, key: &ParamKey, frozen: bool) -> PcResult<()> {
        self.slot_mut(key)?.frozen = frozen;
        Ok(())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = DefaultHasher::new();
        for slot in &self.slots {
            slot.key.path().hash(&mut hasher);
            slot.role.hash(&mut hasher);
        }
        Fingerprint {
            slots: self.slots.len(),
            digest: hasher.finish(),
        }
    }
}

/// Ordered mapping from key to tensor (one side of a partition, a gradient set, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    entries: BTreeMap<ParamKey, Tensor>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ParamKey, value: Tensor) -> Option<Tensor> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &ParamKey) -> Option<&Tensor> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ParamKey) -> Option<&mut Tensor> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &ParamKey) -> Option<Tensor> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &ParamKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Tensor> {
        self.entries.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &Tensor)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dotted paths in key order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().map(|k| k.path().to_string()).collect()
    }

    /// Find a key by path.
    pub fn find(&self, path: &str) -> Option<&ParamKey> {
        self.entries.keys().find(|k| k.path() == path)
    }

    /// Value stored under `path`, if any.
    pub fn get_path(&self, path: &str) -> Option<&Tensor> {
        self.find(path).and_then(|k| self.entries.get(k))
    }

    /// True if any element of any tensor is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.entries
            .values()
            .any(|t| t.iter().any(|v| !v.is_finite()))
    }
}

impl FromIterator<(ParamKey, Tensor)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (ParamKey, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<(ParamKey, Tensor)> for ParamMap {
    fn extend<I: IntoIterator<Item = (ParamKey, Tensor)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl IntoIterator for ParamMap {
    type Item = (ParamKey, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<ParamKey, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParamMap {
    type Item = (&'a ParamKey, &'a Tensor);
    type IntoIter = std::collections::btree_map::Iter<'a, ParamKey, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// An object graph whose learnable values live in a [`ParamStore`].
pub trait Module {
    fn store(&self) -> &ParamStore;
    fn store_mut(&mut self) -> &mut ParamStore;
}

impl Module for ParamStore {
    fn store(&self) -> &ParamStore {
        self
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, ArrayD, IxDyn};

    fn zeros(shape: &[usize]) -> Tensor {
        ArrayD::zeros(IxDyn(shape))
    }

    #[test]
    fn test_register_assigns_sequential_keys() {
        let mut store = ParamStore::new();
        let a = store.register("nodes.0.x", zeros(&[2]), Role::NodeState).unwrap();
        let b = store
            .register("layers.0.weight", zeros(&[2, 2]), Role::LayerWeight)
            .unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert!(a < b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut store = ParamStore::new();
        store.register("a", zeros(&[1]), Role::Static).unwrap();
        assert!(matches!(
            store.register("a", zeros(&[1]), Role::Static),
            Err(PcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_foreign_key_is_unknown() {
        let mut first = ParamStore::new();
        let mut second = ParamStore::new();
        first.register("a", zeros(&[1]), Role::Static).unwrap();
        let foreign = second.register("b", zeros(&[1]), Role::Static).unwrap();
        assert!(matches!(first.get(&foreign), Err(PcError::UnknownKey(_))));
    }

    #[test]
    fn test_set_and_frozen_toggle() {
        let mut store = ParamStore::new();
        let key = store.register("x", zeros(&[2]), Role::NodeState).unwrap();
        store.set(&key, arr1(&[1.0, 2.0]).into_dyn()).unwrap();
        assert_eq!(store.get(&key).unwrap()[[1]], 2.0);

        assert!(!store.slot(&key).unwrap().frozen());
        store.set_frozen(&key, true).unwrap();
        assert!(store.slot(&key).unwrap().frozen());
    }

    #[test]
    fn test_fingerprint_ignores_values_and_frozen_bit() {
        let mut store = ParamStore::new();
        let key = store.register("x", zeros(&[2]), Role::NodeState).unwrap();
        let before = store.fingerprint();

        store.set(&key, zeros(&[8, 2])).unwrap();
        store.set_frozen(&key, true).unwrap();
        assert_eq!(before, store.fingerprint());

        store.register("y", zeros(&[2]), Role::NodeState).unwrap();
        assert_ne!(before, store.fingerprint());
    }

    #[test]
    fn test_param_map_orders_by_index() {
        let mut store = ParamStore::new();
        let a = store.register("z.last", zeros(&[1]), Role::Static).unwrap();
        let b = store.register("a.first", zeros(&[1]), Role::Static).unwrap();

        let mut map = ParamMap::new();
        map.insert(b, zeros(&[1]));
        map.insert(a, zeros(&[1]));
        assert_eq!(map.paths(), vec!["z.last", "a.first"]);
    }
}
