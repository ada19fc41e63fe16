//! Dependency ordering of descriptors.

use crate::error::BuildError;
use crate::types::{ResourceDescriptor, ResourceKey};
use std::collections::{BTreeSet, HashMap};

/// Sort descriptors so every resource comes after the ones it depends on.
///
/// The sort is stable: independent descriptors keep the builder's order.
pub fn dependency_order(
    descriptors: Vec<ResourceDescriptor>,
) -> Result<Vec<ResourceDescriptor>, BuildError> {
    let mut index: HashMap<&ResourceKey, usize> = HashMap::with_capacity(descriptors.len());
    for (i, descriptor) in descriptors.iter().enumerate() {
        if index.insert(&descriptor.key, i).is_some() {
            return Err(BuildError::DuplicateResource(descriptor.key.to_string()));
        }
    }

    let mut blockers = vec![0usize; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    for (i, descriptor) in descriptors.iter().enumerate() {
        for dependency in &descriptor.depends_on {
            let Some(&j) = index.get(dependency) else {
                return Err(BuildError::UnknownDependency {
                    resource: descriptor.key.to_string(),
                    dependency: dependency.to_string(),
                });
            };
            blockers[i] += 1;
            dependents[j].push(i);
        }
    }

    // Lowest builder index first keeps the order stable
    let mut ready: BTreeSet<usize> = (0..descriptors.len()).filter(|&i| blockers[i] == 0).collect();
    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &dependent in &dependents[i] {
            blockers[dependent] -= 1;
            if blockers[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != descriptors.len() {
        let stuck = descriptors
            .iter()
            .enumerate()
            .filter(|(i, _)| blockers[*i] > 0)
            .map(|(_, d)| d.key.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(BuildError::DependencyCycle(stuck));
    }

    let mut slots: Vec<Option<ResourceDescriptor>> = descriptors.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect())
}
