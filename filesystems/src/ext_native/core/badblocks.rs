// Sorted list of known-bad blocks

use super::types::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadBlocksList {
    blocks: Vec<BlockNumber>,
}

impl BadBlocksList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the list sorted and free of duplicates
    pub fn add(&mut self, block: BlockNumber) {
        if let Err(pos) = self.blocks.binary_search(&block) {
            self.blocks.insert(pos, block);
        }
    }

    pub fn remove(&mut self, block: BlockNumber) -> bool {
        match self.blocks.binary_search(&block) {
            Ok(pos) => {
                self.blocks.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, block: BlockNumber) -> bool {
        self.blocks.binary_search(&block).is_ok()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn as_slice(&self) -> &[BlockNumber] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks.iter().copied()
    }
}

impl FromIterator<BlockNumber> for BadBlocksList {
    fn from_iter<I: IntoIterator<Item = BlockNumber>>(iter: I) -> Self {
        let mut list = Self::new();
        for block in iter {
            list.add(block);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_unique() {
        let mut list: BadBlocksList = [30u64, 10, 20, 10].into_iter().collect();
        assert_eq!(list.as_slice(), &[10, 20, 30]);
        assert!(list.contains(20));
        assert!(list.remove(20));
        assert!(!list.remove(20));
        assert_eq!(list.len(), 2);
    }
}
