//! Placement constraint merging
//!
//! A Migration may narrow where its VM lands by adding node selector entries.
//! Those entries are merged into the VM's own selector; a key both sides set
//! to different values cannot be satisfied and blocks the migration until
//! one side changes.

use std::collections::BTreeMap;

use crate::crd::{Migration, VirtualMachine};
use crate::Error;

/// Merge `migration`'s node selector into `vm`'s, in memory only.
///
/// On conflict `vm` is left untouched and the conflicting keys are returned
/// in [`Error::ConstraintConflict`].
pub fn merge_constraints(migration: &Migration, vm: &mut VirtualMachine) -> Result<(), Error> {
    let merged = merge_node_selectors(&vm.spec.node_selector, &migration.spec.node_selector)?;
    vm.spec.node_selector = merged;
    Ok(())
}

/// Overlay `extra` on `base`, failing on keys with differing values.
pub fn merge_node_selectors(
    base: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Error> {
    let mut merged = base.clone();
    let mut conflicts = Vec::new();

    for (key, value) in extra {
        match base.get(key) {
            Some(existing) if existing != value => conflicts.push(key.clone()),
            Some(_) => {}
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    if !conflicts.is_empty() {
        return Err(Error::constraint_conflict(conflicts));
    }
    Ok(merged)
}
