// Loading and writing back the block and inode allocation bitmaps

use super::hooks::Hooked;
use super::ExtFilesystem;
use crate::ext_native::core::checksum::bitmap_checksum;
use crate::ext_native::core::*;
use log::{debug, warn};

impl ExtFilesystem {
    fn bitmap_csum_matches(&self, stored: u32, computed: u32) -> bool {
        if self.sb.desc_size() as usize >= EXT4_MIN_DESC_SIZE_64BIT as usize {
            stored == computed
        } else {
            stored & 0xFFFF == computed & 0xFFFF
        }
    }

    fn block_bitmap_bytes(&self) -> usize {
        (self.sb.s_blocks_per_group / 8) as usize
    }

    fn inode_bitmap_bytes(&self) -> usize {
        (self.sb.s_inodes_per_group / 8) as usize
    }

    /// Empty bitmaps sized for this filesystem
    pub fn allocate_bitmaps(&self) -> ExtResult<(Bitmap, Bitmap)> {
        let first = self.sb.s_first_data_block as u64;
        let groups = self.group_desc_count() as u64;
        let block_map = Bitmap::new(
            BitmapKind::Block,
            first,
            self.sb.blocks_count() - 1,
            first + groups * self.sb.s_blocks_per_group as u64 - 1,
        )?;
        let inode_map = Bitmap::new(
            BitmapKind::Inode,
            1,
            self.sb.s_inodes_count as u64,
            groups * self.sb.s_inodes_per_group as u64,
        )?;
        Ok((block_map, inode_map))
    }

    /// Load both bitmaps from disk, honouring uninit groups
    pub fn read_bitmaps(&mut self) -> ExtResult<()> {
        if self.block_map.is_some() && self.inode_map.is_some() {
            return Ok(());
        }
        let (mut block_map, mut inode_map) = self.allocate_bitmaps()?;
        let csum = self.has_group_desc_csum();
        let metadata_csum = self.sb.has_metadata_csum();
        let seed = self.csum_seed();
        let block_size = self.block_size() as usize;
        let block_nbytes = self.block_bitmap_bytes();
        let inode_nbytes = self.inode_bitmap_bytes();
        let mut buf = vec![0u8; block_size];

        for group in 0..self.group_desc_count() {
            let gd = self.group_desc[group as usize].clone();
            let verified = self.group_desc_csum_verify(group);

            let mut blk = gd.block_bitmap;
            if (csum && gd.has_flag(EXT4_BG_BLOCK_UNINIT) && verified) || blk >= self.sb.blocks_count() {
                blk = 0;
            }
            if blk != 0 {
                self.io.read_blocks(blk, 1, &mut buf)?;
                if metadata_csum
                    && !self.bitmap_csum_matches(gd.block_bitmap_csum, bitmap_checksum(seed, &buf[..block_nbytes]))
                {
                    if self.flags.ignore_csum_errors {
                        warn!("Block bitmap of group {} fails its checksum", group);
                    } else {
                        return Err(ExtError::BitmapChecksumInvalid(group));
                    }
                }
            } else {
                buf[..block_nbytes].fill(0);
            }
            let first = self.group_first_block(group);
            block_map.set_range(first, self.sb.s_blocks_per_group as u64, &buf[..block_nbytes])?;

            let mut blk = gd.inode_bitmap;
            if (csum && gd.has_flag(EXT4_BG_INODE_UNINIT) && verified) || blk >= self.sb.blocks_count() {
                blk = 0;
            }
            if blk != 0 {
                self.io.read_blocks(blk, 1, &mut buf)?;
                if metadata_csum
                    && !self.bitmap_csum_matches(gd.inode_bitmap_csum, bitmap_checksum(seed, &buf[..inode_nbytes]))
                {
                    if self.flags.ignore_csum_errors {
                        warn!("Inode bitmap of group {} fails its checksum", group);
                    } else {
                        return Err(ExtError::BitmapChecksumInvalid(group));
                    }
                }
            } else {
                buf[..inode_nbytes].fill(0);
            }
            let first_ino = group as u64 * self.sb.s_inodes_per_group as u64 + 1;
            inode_map.set_range(first_ino, self.sb.s_inodes_per_group as u64, &buf[..inode_nbytes])?;
        }

        // Groups whose block bitmap was never initialised still own their metadata
        if csum {
            for group in 0..self.group_desc_count() {
                if !self.group_desc[group as usize].has_flag(EXT4_BG_BLOCK_UNINIT) {
                    continue;
                }
                self.reserve_super_and_bgd(group, &mut block_map)?;
                let gd = &self.group_desc[group as usize];
                let (table, bb, ib) = (gd.inode_table, gd.block_bitmap, gd.inode_bitmap);
                if table != 0 {
                    block_map.mark_range(table, self.inode_blocks_per_group() as u64)?;
                }
                if bb != 0 {
                    block_map.mark(bb)?;
                }
                if ib != 0 {
                    block_map.mark(ib)?;
                }
            }
        }

        debug!("Loaded bitmaps for {} groups", self.group_desc_count());
        self.block_map = Some(block_map);
        self.inode_map = Some(inode_map);
        self.flags.bb_dirty = false;
        self.flags.ib_dirty = false;
        Ok(())
    }

    /// Write dirty bitmaps back, through the write_bitmaps hook if one answers
    pub fn write_bitmaps(&mut self) -> ExtResult<()> {
        if let Hooked::Handled(()) = self.with_hooks(|h, fs| h.write_bitmaps(fs))? {
            return Ok(());
        }
        if !self.flags.bb_dirty && !self.flags.ib_dirty {
            return Ok(());
        }
        self.require_rw()?;
        let (block_map, inode_map) = match (self.block_map.take(), self.inode_map.take()) {
            (Some(b), Some(i)) => (b, i),
            (b, i) => {
                self.block_map = b;
                self.inode_map = i;
                return Err(ExtError::BitmapsNotLoaded);
            }
        };
        let result = self.write_bitmaps_from(&block_map, &inode_map);
        self.block_map = Some(block_map);
        self.inode_map = Some(inode_map);
        result
    }

    fn write_bitmaps_from(&mut self, block_map: &Bitmap, inode_map: &Bitmap) -> ExtResult<()> {
        let csum = self.has_group_desc_csum();
        let metadata_csum = self.sb.has_metadata_csum();
        let seed = self.csum_seed();
        let block_size = self.block_size() as usize;
        let block_nbytes = self.block_bitmap_bytes();
        let inode_nbytes = self.inode_bitmap_bytes();
        let bpg = self.sb.s_blocks_per_group as u64;
        let ipg = self.sb.s_inodes_per_group as u64;
        let mut buf = vec![0xFFu8; block_size];
        let write_bb = self.flags.bb_dirty;
        let write_ib = self.flags.ib_dirty;

        for group in 0..self.group_desc_count() {
            if write_bb && !(csum && self.group_desc[group as usize].has_flag(EXT4_BG_BLOCK_UNINIT)) {
                buf.fill(0xFF);
                block_map.get_range(self.group_first_block(group), bpg, &mut buf[..block_nbytes])?;
                if group + 1 == self.group_desc_count() {
                    // Bits past the end of the filesystem read as in use
                    let nbits = ((self.sb.blocks_count() - self.sb.s_first_data_block as u64) % bpg) as usize;
                    if nbits != 0 {
                        for bit in nbits..block_size * 8 {
                            buf[bit / 8] |= 1 << (bit % 8);
                        }
                    }
                }
                if metadata_csum {
                    self.group_desc[group as usize].block_bitmap_csum = bitmap_checksum(seed, &buf[..block_nbytes]);
                    self.group_desc_csum_set(group);
                    self.flags.dirty = true;
                }
                let blk = self.group_desc[group as usize].block_bitmap;
                if blk != 0 {
                    self.io.write_blocks(blk, 1, &buf)?;
                }
            }

            if write_ib && !(csum && self.group_desc[group as usize].has_flag(EXT4_BG_INODE_UNINIT)) {
                buf.fill(0xFF);
                inode_map.get_range(group as u64 * ipg + 1, ipg, &mut buf[..inode_nbytes])?;
                if metadata_csum {
                    self.group_desc[group as usize].inode_bitmap_csum = bitmap_checksum(seed, &buf[..inode_nbytes]);
                    self.group_desc_csum_set(group);
                    self.flags.dirty = true;
                }
                let blk = self.group_desc[group as usize].inode_bitmap;
                if blk != 0 {
                    self.io.write_blocks(blk, 1, &buf)?;
                }
            }
        }

        debug!("Wrote bitmaps (blocks: {}, inodes: {})", write_bb, write_ib);
        self.flags.bb_dirty = false;
        self.flags.ib_dirty = false;
        self.flags.changed = true;
        Ok(())
    }

    /// Replace the in-memory bitmaps
    pub fn set_bitmaps(&mut self, block_map: Bitmap, inode_map: Bitmap) {
        self.block_map = Some(block_map);
        self.inode_map = Some(inode_map);
        self.mark_bb_dirty();
        self.mark_ib_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::filesystem::initialize::initialize;
    use e2kit_core::{MemoryChannel, OpenOptions};

    #[test]
    fn test_bitmaps_survive_reopen() {
        let params = FsParams::default();
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();

        let mut fs = ExtFilesystem::open(Box::new(channel.clone()), &OpenOptions::read_write()).unwrap();
        fs.read_bitmaps().unwrap();
        let free_before = fs.block_bitmap().unwrap().count_set(1, 8191).unwrap();
        fs.block_map.as_mut().unwrap().mark(5000).unwrap();
        fs.inode_map.as_mut().unwrap().mark(100).unwrap();
        fs.mark_bb_dirty();
        fs.mark_ib_dirty();
        fs.write_bitmaps().unwrap();

        let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::default()).unwrap();
        fs.read_bitmaps().unwrap();
        assert!(fs.block_bitmap().unwrap().test(5000).unwrap());
        assert!(fs.inode_bitmap().unwrap().test(100).unwrap());
        assert_eq!(fs.block_bitmap().unwrap().count_set(1, 8191).unwrap(), free_before + 1);
    }

    #[test]
    fn test_last_group_padding() {
        // 3 groups of 8192 blocks, the last one short
        let params = FsParams {
            blocks_count: 20000,
            ..Default::default()
        };
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();
        let fs = ExtFilesystem::open(Box::new(channel.clone()), &OpenOptions::default()).unwrap();
        let last = fs.group_desc_count() - 1;
        let blk = fs.group_desc[last as usize].block_bitmap;

        let image = channel.snapshot();
        let bitmap = &image[blk as usize * 1024..(blk as usize + 1) * 1024];
        // 19999 data blocks, 19999 - 2 * 8192 = 3615 bits used in the last group
        let nbits = 3615usize;
        for bit in nbits..8192 {
            assert_ne!(bitmap[bit / 8] & (1 << (bit % 8)), 0, "bit {} not padded", bit);
        }
    }
}
