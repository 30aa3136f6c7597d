// Block relocation table for resize tooling

use crate::ext_native::core::*;
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub old: BlockNumber,
    pub new: BlockNumber,
    /// Inode that owns the block, 0 for filesystem metadata
    pub owner: InodeNumber,
}

/// Old-to-new block mappings, ordered by old block, with a reverse index
/// by new block
#[derive(Debug, Default, Clone)]
pub struct RelocationTable {
    by_old: BTreeMap<BlockNumber, (BlockNumber, InodeNumber)>,
    by_new: BTreeMap<BlockNumber, BlockNumber>,
}

impl RelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_old.is_empty()
    }

    /// Record that `old` moves to `new`. Both ends must be unused by any
    /// other entry.
    pub fn add(&mut self, old: BlockNumber, new: BlockNumber, owner: InodeNumber) -> ExtResult<()> {
        if self.by_old.contains_key(&old) || self.by_new.contains_key(&new) {
            return Err(ExtError::RelocationConflict { old });
        }
        trace!("Relocating block {} to {} (owner {})", old, new, owner);
        self.by_old.insert(old, (new, owner));
        self.by_new.insert(new, old);
        Ok(())
    }

    pub fn find_by_old(&self, old: BlockNumber) -> Option<Relocation> {
        self.by_old
            .get(&old)
            .map(|&(new, owner)| Relocation { old, new, owner })
    }

    pub fn find_by_new(&self, new: BlockNumber) -> Option<Relocation> {
        let old = *self.by_new.get(&new)?;
        self.find_by_old(old)
    }

    pub fn remove(&mut self, old: BlockNumber) -> Option<Relocation> {
        let (new, owner) = self.by_old.remove(&old)?;
        self.by_new.remove(&new);
        Some(Relocation { old, new, owner })
    }

    pub fn iter(&self) -> impl Iterator<Item = Relocation> + '_ {
        self.by_old
            .iter()
            .map(|(&old, &(new, owner))| Relocation { old, new, owner })
    }

    /// Every cycle in the old → new chains, each listed from its smallest
    /// block
    pub fn cycles(&self) -> Vec<Vec<BlockNumber>> {
        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        for &start in self.by_old.keys() {
            if seen.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            let mut cur = start;
            loop {
                if on_path.contains(&cur) {
                    // The cycle is the part of the path from `cur` onward
                    if let Some(pos) = path.iter().position(|&b| b == cur) {
                        found.push(path[pos..].to_vec());
                    }
                    break;
                }
                if seen.contains(&cur) {
                    break;
                }
                match self.by_old.get(&cur) {
                    Some(&(next, _)) => {
                        path.push(cur);
                        on_path.insert(cur);
                        cur = next;
                    }
                    None => break,
                }
            }
            seen.extend(path);
        }
        for cycle in &found {
            debug!("Relocation cycle {:?}", cycle);
        }
        found
    }

    /// Fail with the first cycle found. Cycles are left for the caller to
    /// break, usually through a scratch block.
    pub fn check_cycles(&self) -> ExtResult<()> {
        match self.cycles().into_iter().next() {
            Some(path) => Err(ExtError::RelocationCycle(path)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        let mut table = RelocationTable::new();
        table.add(300, 100, 12).unwrap();
        table.add(200, 150, 0).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_old(300), Some(Relocation { old: 300, new: 100, owner: 12 }));
        assert_eq!(table.find_by_new(150).map(|r| r.old), Some(200));
        assert_eq!(table.find_by_new(300), None);
        let olds: Vec<u64> = table.iter().map(|r| r.old).collect();
        assert_eq!(olds, vec![200, 300]);
    }

    #[test]
    fn test_conflicts() {
        let mut table = RelocationTable::new();
        table.add(10, 20, 0).unwrap();
        assert!(matches!(table.add(11, 20, 0), Err(ExtError::RelocationConflict { old: 11 })));
        assert!(matches!(table.add(10, 21, 0), Err(ExtError::RelocationConflict { old: 10 })));
        assert_eq!(table.remove(10).map(|r| r.new), Some(20));
        assert!(table.find_by_new(20).is_none());
        table.add(11, 20, 0).unwrap();
    }

    #[test]
    fn test_cycles_reported_not_broken() {
        let mut table = RelocationTable::new();
        // 1 → 2 → 3 → 1, and a chain 10 → 11 → 12 ending outside the table
        table.add(1, 2, 0).unwrap();
        table.add(2, 3, 0).unwrap();
        table.add(3, 1, 0).unwrap();
        table.add(10, 11, 0).unwrap();
        table.add(11, 12, 0).unwrap();
        // 20 ↔ 21
        table.add(20, 21, 0).unwrap();
        table.add(21, 20, 0).unwrap();

        assert_eq!(table.cycles(), vec![vec![1, 2, 3], vec![20, 21]]);
        match table.check_cycles() {
            Err(ExtError::RelocationCycle(path)) => assert_eq!(path, vec![1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.len(), 7);

        table.remove(3);
        table.remove(21);
        table.check_cycles().unwrap();
    }

    #[test]
    fn test_chain_cannot_join_a_cycle() {
        let mut table = RelocationTable::new();
        table.add(5, 6, 0).unwrap();
        table.add(6, 7, 0).unwrap();
        table.add(7, 6, 0).unwrap_err();
        table.add(7, 8, 0).unwrap();
        table.add(8, 6, 0).unwrap_err();
        assert!(table.cycles().is_empty());
    }
}
