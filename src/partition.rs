//! Partition and merge.
//!
//! `partition` splits every slot of a model into the `target` side (filter
//! matches) and the `other` side (complement). Keys come out in registration
//! order, so partitioning an unchanged model twice yields identical orderings.
//!
//! `merge` is the inverse: it checks that `target ∪ other` covers exactly the
//! model's current key set before writing anything back.

use std::collections::BTreeSet;

use tracing::debug;

use crate::core::{Module, PcError, PcResult, ParamKey, ParamMap, ParamStore};
use crate::filter::Filter;

/// Disjoint split of a model's values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub target: ParamMap,
    pub other: ParamMap,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.target.len() + self.other.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty() && self.other.is_empty()
    }
}

/// Split `model` by `filter`.
pub fn partition<M: Module + ?Sized>(model: &M, filter: &Filter) -> PcResult<Partition> {
    partition_store(model.store(), filter)
}

pub fn partition_store(store: &ParamStore, filter: &Filter) -> PcResult<Partition> {
    let mut parts = Partition::default();
    for slot in store.slots() {
        let side = if filter.matches(slot)? {
            &mut parts.target
        } else {
            &mut parts.other
        };
        side.insert(slot.key().clone(), slot.value().clone());
    }
    debug!(
        filter = %filter,
        target = parts.target.len(),
        other = parts.other.len(),
        "partitioned"
    );
    Ok(parts)
}

/// Write both sides back into `model`.
///
/// # Errors
/// `StructuralMismatch` if the union of the two sides is not exactly the
/// model's key set, or a key appears on both sides. Nothing is written in
/// that case.
pub fn merge<M: Module + ?Sized>(model: &mut M, target: ParamMap, other: ParamMap) -> PcResult<()> {
    merge_store(model.store_mut(), target, other)
}

pub fn merge_store(store: &mut ParamStore, target: ParamMap, other: ParamMap) -> PcResult<()> {
    let live: BTreeSet<&ParamKey> = store.keys().collect();

    let missing: Vec<String> = live
        .iter()
        .filter(|k| !target.contains_key(k) && !other.contains_key(k))
        .map(|k| k.path().to_string())
        .collect();

    let mut extra: Vec<String> = target
        .keys()
        .chain(other.keys())
        .filter(|k| !live.contains(k))
        .map(|k| k.path().to_string())
        .collect();
    extra.extend(
        target
            .keys()
            .filter(|k| other.contains_key(k))
            .map(|k| format!("{} (duplicated)", k.path())),
    );

    if !missing.is_empty() || !extra.is_empty() {
        return Err(PcError::StructuralMismatch { missing, extra });
    }

    for (key, value) in target.into_iter().chain(other) {
        store.set(&key, value)?;
    }
    Ok(())
}

/// Write a subset of values back; every key must belong to the store.
pub fn merge_subset(store: &mut ParamStore, values: ParamMap) -> PcResult<()> {
    let extra: Vec<String> = values
        .keys()
        .filter(|k| !store.contains(k))
        .map(|k| k.path().to_string())
        .collect();
    if !extra.is_empty() {
        return Err(PcError::StructuralMismatch {
            missing: Vec::new(),
            extra,
        });
    }
    for (key, value) in values {
        store.set(&key, value)?;
    }
    Ok(())
}

/// New model value with both sides written in; `model` itself is untouched.
pub fn merged<M: Module + Clone>(model: &M, target: ParamMap, other: ParamMap) -> PcResult<M> {
    let mut copy = model.clone();
    merge(&mut copy, target, other)?;
    Ok(copy)
}
