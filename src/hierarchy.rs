//! The hierarchy index: per-node point counts, serialized as one JSON
//! object per shard with negative entries linking child shards.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::io;
use crate::key::Dxyz;

/// Soft bound on entries per shard, aligned with what EPT readers page in
/// comfortably.
const MAX_SHARD_ENTRIES: usize = 65_536;

/// Concurrent map from node key to that node's own point count (not
/// cumulative).
#[derive(Default, Debug)]
pub struct Hierarchy {
    map: Mutex<HashMap<Dxyz, u64>>,
}

impl Hierarchy {
    pub fn new() -> Hierarchy {
        Hierarchy::default()
    }

    pub fn get(&self, key: &Dxyz) -> u64 {
        self.map.lock().get(key).copied().unwrap_or(0)
    }

    pub fn set(&self, key: Dxyz, count: u64) {
        let mut map = self.map.lock();
        if count == 0 {
            map.remove(&key);
        } else {
            map.insert(key, count);
        }
    }

    pub fn add(&self, key: Dxyz, delta: u64) {
        if delta == 0 {
            return;
        }
        *self.map.lock().entry(key).or_insert(0) += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn total(&self) -> u64 {
        self.map.lock().values().sum()
    }

    /// Depth-ordered copy of the entries.
    pub fn snapshot(&self) -> BTreeMap<Dxyz, u64> {
        self.map.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

fn ancestor_at(key: &Dxyz, depth: u32) -> Dxyz {
    debug_assert!(depth <= key.d);
    let shift = key.d - depth;
    Dxyz::new(depth, key.p.x >> shift, key.p.y >> shift, key.p.z >> shift)
}

fn shard_root_of(key: &Dxyz, step: u32) -> Dxyz {
    ancestor_at(key, key.d - key.d % step)
}

/// Group entries into shards and attach negative pointer entries at the
/// boundaries. Returns shard-root → (key → signed count).
fn partition(
    entries: &BTreeMap<Dxyz, u64>,
    step: u32,
) -> BTreeMap<Dxyz, BTreeMap<Dxyz, i64>> {
    let mut shards: BTreeMap<Dxyz, BTreeMap<Dxyz, i64>> = BTreeMap::new();
    for (key, count) in entries {
        let root = shard_root_of(key, step);
        shards.entry(root).or_default().insert(*key, *count as i64);
    }

    // Subtree totals, folded upward one depth at a time. Ancestors absent
    // from the map still relay their children's totals.
    let mut totals: HashMap<Dxyz, u64> = entries.iter().map(|(k, v)| (*k, *v)).collect();
    let deepest = entries.keys().map(|k| k.d).max().unwrap_or(0);
    let mut at_depth: HashMap<u32, Vec<Dxyz>> = HashMap::new();
    for key in totals.keys() {
        at_depth.entry(key.d).or_default().push(*key);
    }
    for d in (1..=deepest).rev() {
        for key in at_depth.remove(&d).unwrap_or_default() {
            let total = totals.get(&key).copied().unwrap_or(0);
            let parent = key.parent();
            if let std::collections::hash_map::Entry::Vacant(e) = totals.entry(parent) {
                e.insert(0);
                at_depth.entry(parent.d).or_default().push(parent);
            }
            *totals.get_mut(&parent).unwrap() += total;
        }
    }

    // Every shard root below the top gets a pointer entry in the shard
    // covering its parent depth. A holder created along the way needs its
    // own pointer too, so work deepest-first.
    let mut roots: Vec<Dxyz> = shards.keys().copied().filter(|r| r.d > 0).collect();
    roots.sort();
    while let Some(root) = roots.pop() {
        let holder = ancestor_at(&root, root.d - step);
        let total = totals.get(&root).copied().unwrap_or(0);
        let newly = !shards.contains_key(&holder);
        shards
            .entry(holder)
            .or_default()
            .insert(root, -(total as i64));
        if newly && holder.d > 0 {
            roots.push(holder);
            roots.sort();
        }
    }

    shards
}

fn largest_shard(entries: &BTreeMap<Dxyz, u64>, step: u32) -> usize {
    partition(entries, step)
        .values()
        .map(|s| s.len())
        .max()
        .unwrap_or(0)
}

/// Pick a hierarchy step for a finished build: 0 (monolithic) when the
/// whole tree fits one shard, otherwise the largest power-of-two step
/// whose largest shard stays within the reader bound, so the fewest files
/// are written subject to that bound.
pub fn determine_step(hierarchy: &Hierarchy) -> u32 {
    let entries = hierarchy.snapshot();
    if entries.len() <= MAX_SHARD_ENTRIES {
        return 0;
    }

    let deepest = entries.keys().map(|k| k.d).max().unwrap_or(0);
    let mut step = (deepest + 1).next_power_of_two();
    while step > 2 {
        if largest_shard(&entries, step) <= MAX_SHARD_ENTRIES {
            return step;
        }
        step /= 2;
    }
    2
}

fn shard_name(root: &Dxyz, postfix: &str) -> String {
    format!("{root}{postfix}.json")
}

/// Write the hierarchy under its endpoint. `step == 0` writes one
/// monolithic object rooted at `0-0-0-0`.
pub fn save(hierarchy: &Hierarchy, ep: &Endpoint, step: u32, postfix: &str) -> Result<()> {
    let entries = hierarchy.snapshot();

    if step == 0 || entries.is_empty() {
        let flat: BTreeMap<String, i64> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v as i64))
            .collect();
        return io::ensure_put_json(ep, &shard_name(&Dxyz::root(), postfix), &flat, false);
    }

    for (root, shard) in partition(&entries, step) {
        let flat: BTreeMap<String, i64> =
            shard.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        io::ensure_put_json(ep, &shard_name(&root, postfix), &flat, false)?;
    }
    Ok(())
}

/// Load a hierarchy, following negative pointer entries through child
/// shards.
pub fn load(ep: &Endpoint, postfix: &str) -> Result<Hierarchy> {
    let hierarchy = Hierarchy::new();
    let mut pending = vec![Dxyz::root()];

    while let Some(root) = pending.pop() {
        let shard: BTreeMap<String, i64> =
            io::ensure_get_json(ep, &shard_name(&root, postfix))?;
        for (key, value) in shard {
            let key: Dxyz = key
                .parse()
                .map_err(|_| Error::Decode(format!("bad hierarchy key: {key}")))?;
            if value < 0 {
                // Link: the child shard carries this node's own count.
                pending.push(key);
            } else if value > 0 {
                hierarchy.set(key, value as u64);
            }
        }
    }

    Ok(hierarchy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoints;

    fn sample() -> Hierarchy {
        let h = Hierarchy::new();
        h.set(Dxyz::new(0, 0, 0, 0), 100);
        h.set(Dxyz::new(1, 0, 0, 0), 50);
        h.set(Dxyz::new(1, 1, 1, 1), 30);
        h.set(Dxyz::new(2, 0, 0, 0), 20);
        h.set(Dxyz::new(2, 3, 3, 3), 10);
        h.set(Dxyz::new(3, 0, 0, 1), 5);
        h
    }

    #[test]
    fn add_and_set() {
        let h = Hierarchy::new();
        let k = Dxyz::new(1, 0, 1, 0);
        assert_eq!(h.get(&k), 0);
        h.add(k, 3);
        h.add(k, 4);
        assert_eq!(h.get(&k), 7);
        h.set(k, 1);
        assert_eq!(h.get(&k), 1);
        h.set(k, 0);
        assert!(h.is_empty());
    }

    #[test]
    fn monolithic_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let h = sample();

        save(&h, &ep.hierarchy, 0, "").unwrap();
        assert!(ep.hierarchy.exists("0-0-0-0.json"));

        let back = load(&ep.hierarchy, "").unwrap();
        assert_eq!(back.snapshot(), h.snapshot());
    }

    #[test]
    fn stepped_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let h = sample();

        save(&h, &ep.hierarchy, 2, "").unwrap();

        // Shards root at every depth that is a multiple of the step.
        assert!(ep.hierarchy.exists("0-0-0-0.json"));
        assert!(ep.hierarchy.exists("2-0-0-0.json"));
        assert!(ep.hierarchy.exists("2-3-3-3.json"));

        let back = load(&ep.hierarchy, "").unwrap();
        assert_eq!(back.snapshot(), h.snapshot());
    }

    #[test]
    fn pointer_entries_carry_subtree_totals() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let h = sample();

        save(&h, &ep.hierarchy, 2, "").unwrap();

        let root: BTreeMap<String, i64> =
            serde_json::from_slice(&ep.hierarchy.get("0-0-0-0.json").unwrap()).unwrap();
        // 2-0-0-0 owns itself (20) and 3-0-0-1 (5).
        assert_eq!(root.get("2-0-0-0"), Some(&-25));
        assert_eq!(root.get("2-3-3-3"), Some(&-10));
        assert_eq!(root.get("0-0-0-0"), Some(&100));
        assert_eq!(root.get("1-0-0-0"), Some(&50));

        let child: BTreeMap<String, i64> =
            serde_json::from_slice(&ep.hierarchy.get("2-0-0-0.json").unwrap()).unwrap();
        assert_eq!(child.get("2-0-0-0"), Some(&20));
        assert_eq!(child.get("3-0-0-1"), Some(&5));
    }

    #[test]
    fn subset_postfix_in_shard_names() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let h = sample();
        save(&h, &ep.hierarchy, 0, "-3").unwrap();
        assert!(ep.hierarchy.exists("0-0-0-0-3.json"));
        let back = load(&ep.hierarchy, "-3").unwrap();
        assert_eq!(back.total(), h.total());
    }

    #[test]
    fn small_tree_needs_no_step() {
        assert_eq!(determine_step(&sample()), 0);
    }

    #[test]
    fn oversized_tree_gets_a_power_of_two_step() {
        // A full octree down to depth 6 holds 299 593 nodes, well past the
        // per-shard bound.
        let h = Hierarchy::new();
        for d in 0..=6u32 {
            let side = 1u64 << d;
            for x in 0..side {
                for y in 0..side {
                    for z in 0..side {
                        h.set(Dxyz::new(d, x, y, z), 1);
                    }
                }
            }
        }

        let step = determine_step(&h);
        assert!(step >= 2);
        assert!(step.is_power_of_two());
        assert!(largest_shard(&h.snapshot(), step) <= MAX_SHARD_ENTRIES);

        // The whole tree survives a sharded round trip.
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        save(&h, &ep.hierarchy, step, "").unwrap();
        let back = load(&ep.hierarchy, "").unwrap();
        assert_eq!(back.len(), h.len());
        assert_eq!(back.total(), h.total());
    }
}
