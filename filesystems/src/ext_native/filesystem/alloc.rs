// Block and inode allocation with free-count bookkeeping

use super::hooks::Hooked;
use super::ExtFilesystem;
use crate::ext_native::core::*;
use log::{debug, error, trace};

impl ExtFilesystem {
    /// Clear BLOCK_UNINIT on `group` once something is allocated in it
    fn clear_block_uninit(&mut self, group: GroupNumber) {
        if group >= self.group_desc_count()
            || !self.has_group_desc_csum()
            || !self.group_desc[group as usize].has_flag(EXT4_BG_BLOCK_UNINIT)
        {
            return;
        }
        self.group_desc[group as usize].clear_flag(EXT4_BG_BLOCK_UNINIT);
        self.group_desc_csum_set(group);
        self.mark_super_dirty();
        self.mark_bb_dirty();
    }

    /// Make an INODE_UNINIT group's inodes available in `map`
    fn check_inode_uninit(&mut self, map: &mut Bitmap, group: GroupNumber) -> ExtResult<()> {
        if group >= self.group_desc_count()
            || !self.has_group_desc_csum()
            || !self.group_desc[group as usize].has_flag(EXT4_BG_INODE_UNINIT)
        {
            return Ok(());
        }
        let ipg = self.sb.s_inodes_per_group as u64;
        map.unmark_range(group as u64 * ipg + 1, ipg)?;
        self.group_desc[group as usize].clear_flag(EXT4_BG_INODE_UNINIT);
        self.group_desc_csum_set(group);
        self.mark_ib_dirty();
        self.mark_super_dirty();
        Ok(())
    }

    /// Find a free block at or after `goal`, wrapping to the start of the
    /// filesystem. Uses the handle's block bitmap when `map` is None.
    pub fn new_block(&mut self, goal: BlockNumber, map: Option<&Bitmap>) -> ExtResult<BlockNumber> {
        if map.is_none() {
            if let Hooked::Handled(block) = self.with_hooks(|h, fs| h.alloc_block(fs, goal))? {
                self.clear_block_uninit(self.group_of_block(block));
                return Ok(block);
            }
        }
        self.new_block_in(goal, map)
    }

    fn new_block_in(&mut self, goal: BlockNumber, map: Option<&Bitmap>) -> ExtResult<BlockNumber> {
        let first = self.sb.s_first_data_block as u64;
        let last = self.sb.blocks_count() - 1;
        let goal = if goal == 0 || goal > last { first } else { goal };
        let map = match map {
            Some(map) => map,
            None => self.block_map.as_ref().ok_or(ExtError::BitmapsNotLoaded)?,
        };
        let mut found = map.find_first_zero(goal, last)?;
        if found.is_none() && goal != first {
            found = map.find_first_zero(first, goal - 1)?;
        }
        let block = found.ok_or(ExtError::BlockAllocFail)?;
        self.clear_block_uninit(self.group_of_block(block));
        trace!("new_block goal {} -> {}", goal, block);
        Ok(block)
    }

    /// Allocate a zeroed block near `goal` and account for it
    pub fn alloc_block(&mut self, goal: BlockNumber) -> ExtResult<BlockNumber> {
        self.require_rw()?;
        let block = match self.with_hooks(|h, fs| h.alloc_block(fs, goal))? {
            Hooked::Handled(block) => block,
            Hooked::NotHandled => {
                if self.block_map.is_none() {
                    self.read_bitmaps()?;
                }
                self.new_block_in(goal, None)?
            }
        };
        self.zero_blocks(block, 1)?;
        self.block_alloc_stats(block, 1)?;
        debug!("Allocated block {}", block);
        Ok(block)
    }

    /// Record `block` as allocated (`inuse` > 0) or freed (`inuse` < 0)
    pub fn block_alloc_stats(&mut self, block: BlockNumber, inuse: i32) -> ExtResult<()> {
        if block >= self.sb.blocks_count() || block < self.sb.s_first_data_block as u64 {
            error!("Illegal block number {} passed to block_alloc_stats", block);
            return Err(ExtError::BadBlockNumber(block));
        }
        let group = self.group_of_block(block);
        let map = self.block_map.as_mut().ok_or(ExtError::BitmapsNotLoaded)?;
        if inuse > 0 {
            map.mark(block)?;
        } else {
            map.unmark(block)?;
        }
        let gd = &mut self.group_desc[group as usize];
        gd.free_blocks_count = (gd.free_blocks_count as i64 - inuse as i64) as u32;
        gd.clear_flag(EXT4_BG_BLOCK_UNINIT);
        self.group_desc_csum_set(group);
        let free = self.sb.free_blocks_count() as i64 - inuse as i64;
        self.sb.set_free_blocks_count(free.max(0) as u64);
        self.mark_super_dirty();
        self.mark_bb_dirty();
        Ok(())
    }

    /// Find a free inode, preferring the group of `dir`
    pub fn new_inode(&mut self, dir: InodeNumber, map: Option<&mut Bitmap>) -> ExtResult<InodeNumber> {
        match map {
            Some(map) => self.new_inode_in(dir, map),
            None => {
                let mut own = self.inode_map.take().ok_or(ExtError::BitmapsNotLoaded)?;
                let result = self.new_inode_in(dir, &mut own);
                self.inode_map = Some(own);
                result
            }
        }
    }

    fn new_inode_in(&mut self, dir: InodeNumber, map: &mut Bitmap) -> ExtResult<InodeNumber> {
        let ipg = self.sb.s_inodes_per_group;
        let inodes_count = self.sb.s_inodes_count;
        let first_ino = self.sb.first_ino();
        let mut start = if dir > 0 { ((dir - 1) / ipg) * ipg + 1 } else { 0 };
        if start < first_ino {
            start = first_ino;
        }
        if start > inodes_count {
            return Err(ExtError::InodeAllocFail);
        }

        let mut i = start;
        loop {
            let in_group = (i - 1) % ipg;
            let group = (i - 1) / ipg;
            self.check_inode_uninit(map, group)?;
            let mut upto = i + (ipg - in_group) - 1;
            if i < start && upto >= start {
                upto = start - 1;
            }
            if upto > inodes_count {
                upto = inodes_count;
            }
            if let Some(found) = map.find_first_zero(i as u64, upto as u64)? {
                return Ok(found as u32);
            }
            i = upto + 1;
            if i > inodes_count {
                i = first_ino;
            }
            if i == start {
                return Err(ExtError::InodeAllocFail);
            }
        }
    }

    /// Record inode `ino` as allocated (`inuse` > 0) or freed
    pub fn inode_alloc_stats(&mut self, ino: InodeNumber, inuse: i32, is_dir: bool) -> ExtResult<()> {
        if ino == 0 || ino > self.sb.s_inodes_count {
            error!("Illegal inode number {} passed to inode_alloc_stats", ino);
            return Err(ExtError::BadInodeNumber(ino));
        }
        let group = self.group_of_ino(ino);
        let ipg = self.sb.s_inodes_per_group;
        let map = self.inode_map.as_mut().ok_or(ExtError::BitmapsNotLoaded)?;
        if inuse > 0 {
            map.mark(ino as u64)?;
        } else {
            map.unmark(ino as u64)?;
        }
        let csum = self.has_group_desc_csum();
        let gd = &mut self.group_desc[group as usize];
        gd.free_inodes_count = (gd.free_inodes_count as i64 - inuse as i64) as u32;
        if is_dir {
            gd.used_dirs_count = (gd.used_dirs_count as i64 + inuse as i64) as u32;
        }
        gd.clear_flag(EXT4_BG_INODE_UNINIT);
        if csum {
            let first_unused = ipg - gd.itable_unused + group * ipg + 1;
            if ino >= first_unused {
                gd.itable_unused = group * ipg + ipg - ino;
            }
            self.group_desc_csum_set(group);
        }
        self.sb.s_free_inodes_count = (self.sb.s_free_inodes_count as i64 - inuse as i64) as u32;
        self.mark_super_dirty();
        self.mark_ib_dirty();
        Ok(())
    }

    /// Mark the superblock and descriptor copies of `group` in `map`,
    /// returning how many blocks of the group remain for data
    pub fn reserve_super_and_bgd(&self, group: GroupNumber, map: &mut Bitmap) -> ExtResult<u64> {
        let loc = self.super_and_bgd_loc(group);
        let old_desc_blocks = if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG) {
            self.sb.s_first_meta_bg as u64
        } else {
            self.desc_blocks() as u64 + self.sb.s_reserved_gdt_blocks as u64
        };
        if loc.super_blk != 0 || group == 0 {
            map.mark(loc.super_blk)?;
        }
        if loc.old_desc_blk != 0 {
            let mut num = old_desc_blocks;
            if loc.old_desc_blk + num >= self.sb.blocks_count() {
                num = self.sb.blocks_count() - loc.old_desc_blk;
            }
            map.mark_range(loc.old_desc_blk, num)?;
        }
        if loc.new_desc_blk != 0 {
            map.mark(loc.new_desc_blk)?;
        }
        let used = 2 + self.inode_blocks_per_group() as u64 + loc.used_blocks;
        Ok(self.group_blocks_count(group).saturating_sub(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::filesystem::initialize::initialize;
    use e2kit_core::{MemoryChannel, OpenOptions};

    fn open_rw() -> ExtFilesystem {
        let params = FsParams::default();
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();
        let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::read_write()).unwrap();
        fs.read_bitmaps().unwrap();
        fs
    }

    #[test]
    fn test_new_block_wraps_around() {
        let mut fs = open_rw();
        let mut map = fs.block_bitmap().unwrap().clone();
        map.mark_range(100, 8092).unwrap();
        let first_free = map.find_first_zero(1, 8191).unwrap().unwrap();
        assert!(first_free < 100);
        assert_eq!(fs.new_block(4000, Some(&map)).unwrap(), first_free);

        map.mark_range(1, 8191).unwrap();
        assert!(matches!(fs.new_block(4000, Some(&map)), Err(ExtError::BlockAllocFail)));
    }

    #[test]
    fn test_alloc_block_updates_counts() {
        let mut fs = open_rw();
        let free_sb = fs.sb.free_blocks_count();
        let free_gd = fs.group_desc[0].free_blocks_count;
        let block = fs.alloc_block(0).unwrap();
        assert!(fs.block_bitmap().unwrap().test(block).unwrap());
        assert_eq!(fs.sb.free_blocks_count(), free_sb - 1);
        assert_eq!(fs.group_desc[0].free_blocks_count, free_gd - 1);
        assert!(fs.flags.dirty && fs.flags.bb_dirty);

        fs.block_alloc_stats(block, -1).unwrap();
        assert!(!fs.block_bitmap().unwrap().test(block).unwrap());
        assert_eq!(fs.sb.free_blocks_count(), free_sb);
        assert!(matches!(fs.block_alloc_stats(8192, 1), Err(ExtError::BadBlockNumber(8192))));
    }

    #[test]
    fn test_new_inode_and_stats() {
        let mut fs = open_rw();
        let ino = fs.new_inode(EXT4_ROOT_INO, None).unwrap();
        assert!(ino >= fs.sb.first_ino());
        let free = fs.sb.s_free_inodes_count;
        let dirs = fs.group_desc[0].used_dirs_count;
        fs.inode_alloc_stats(ino, 1, true).unwrap();
        assert_eq!(fs.sb.s_free_inodes_count, free - 1);
        assert_eq!(fs.group_desc[0].used_dirs_count, dirs + 1);
        assert_ne!(fs.new_inode(EXT4_ROOT_INO, None).unwrap(), ino);
    }
}
