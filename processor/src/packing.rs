use std::{cmp::Reverse, collections::BTreeMap};

use data_model::{GpuDevice, GpuDeviceId, PackingTier};
use itertools::Itertools;

/// Candidate device ids bucketed by NUMA node, then by PCIe root. Unknown
/// topology values share one bucket per level.
type TopologyGroups<'a> = BTreeMap<&'a str, BTreeMap<&'a str, Vec<GpuDeviceId>>>;

fn group_by_topology<'a>(candidates: &[&'a GpuDevice]) -> TopologyGroups<'a> {
    let mut groups: TopologyGroups = BTreeMap::new();
    for device in candidates {
        groups
            .entry(device.numa_bucket())
            .or_default()
            .entry(device.pci_root_bucket())
            .or_default()
            .push(device.id);
    }
    for roots in groups.values_mut() {
        for ids in roots.values_mut() {
            ids.sort();
        }
    }
    groups
}

/// Orders groups so that the tightest fit comes first; lower ids win ties.
fn fit_key(ids: &[GpuDeviceId]) -> (usize, Option<GpuDeviceId>) {
    (ids.len(), ids.first().copied())
}

/// Chooses `count` devices out of `candidates`, preferring one NUMA node and
/// one PCIe root, then one NUMA node, then as few scattered nodes as the
/// ladder allows. Returns `None` when fewer than `count` candidates exist.
pub fn select_devices(
    candidates: &[&GpuDevice],
    count: usize,
) -> Option<(Vec<GpuDeviceId>, PackingTier)> {
    if count == 0 || candidates.len() < count {
        return None;
    }
    let groups = group_by_topology(candidates);

    // Smallest (NUMA, root) group that fits keeps larger pools intact.
    let same_root = groups
        .values()
        .flat_map(|roots| roots.values())
        .filter(|ids| ids.len() >= count)
        .min_by_key(|ids| fit_key(ids));
    if let Some(ids) = same_root {
        return Some((ids[..count].to_vec(), PackingTier::SameNumaSameRoot));
    }

    let nodes: Vec<Vec<GpuDeviceId>> = groups
        .values()
        .map(|roots| roots.values().flatten().copied().sorted().collect())
        .collect();
    let same_node = nodes
        .iter()
        .filter(|ids| ids.len() >= count)
        .min_by_key(|ids| fit_key(ids));
    if let Some(ids) = same_node {
        return Some((ids[..count].to_vec(), PackingTier::SameNuma));
    }

    // Within a node, fill from the fullest root first so that picks share a
    // root for as long as possible.
    let scattered: Vec<GpuDeviceId> = groups
        .values()
        .map(|roots| {
            roots
                .values()
                .sorted_by_key(|ids| (Reverse(ids.len()), ids.first().copied()))
                .flatten()
                .copied()
                .collect::<Vec<_>>()
        })
        .sorted_by_key(|ids| fit_key(ids))
        .flatten()
        .take(count)
        .collect();
    (scattered.len() == count).then_some((scattered, PackingTier::Scattered))
}
