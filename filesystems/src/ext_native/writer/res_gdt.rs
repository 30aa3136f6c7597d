// Resize inode: a doubly indirect map over the reserved GDT blocks and
// their backups, kept so the descriptor table can grow online

use crate::ext_native::core::*;
use crate::ext_native::filesystem::ExtFilesystem;
use log::{debug, info};

impl ExtFilesystem {
    /// Create or verify the resize inode. Slots that are empty get the
    /// expected block numbers; a slot holding anything else is reported as
    /// corruption and left alone.
    pub fn create_resize_inode(&mut self) -> ExtResult<()> {
        self.require_rw()?;
        let mut inode = self.read_inode(EXT4_RESIZE_INO)?;

        // 1k-block bigalloc filesystems start at block 0 but keep the
        // superblock in block 1
        let mut sb_blk = self.sb.s_first_data_block as u64;
        if self.block_size() == 1024 && sb_blk == 0 {
            sb_blk = 1;
        }
        let apb = (self.block_size() / 4) as u64;
        let desc_blocks = self.desc_blocks() as u64;
        let reserved = self.sb.s_reserved_gdt_blocks as u64;
        let bpg = self.sb.s_blocks_per_group as u64;

        let mut inode_dirty = false;
        let mut dind_dirty = false;
        let dind_blk = inode.i_block[EXT4_DIND_BLOCK] as u64;
        let (dind_blk, mut dind) = if dind_blk != 0 {
            debug!("Reading resize inode dind block {}", dind_blk);
            (dind_blk, self.read_ind_block(dind_blk)?)
        } else {
            let goal = sb_blk + desc_blocks + reserved + 2 + self.inode_blocks_per_group() as u64;
            let block = self.alloc_block(goal)?;
            inode.i_mode = S_IFREG | 0o600;
            inode.i_links_count = 1;
            inode.i_block[EXT4_DIND_BLOCK] = block as u32;
            inode.iblk_set(&self.sb, 1);
            let size = (apb * apb + apb + EXT4_NDIR_BLOCKS as u64) * self.block_size() as u64;
            self.inode_size_set(&mut inode, size);
            inode.i_ctime = self.now();
            debug!("Allocated resize inode dind block {}", block);
            dind_dirty = true;
            inode_dirty = true;
            (block, vec![0u32; apb as usize])
        };

        let result = self.fill_reserved_gdt(
            &mut inode,
            &mut dind,
            sb_blk,
            apb,
            desc_blocks,
            reserved,
            bpg,
            &mut dind_dirty,
            &mut inode_dirty,
        );

        // Whatever was filled in before a mismatch is still written out
        if dind_dirty {
            let written = self.write_ind_block(dind_blk, &dind);
            if result.is_ok() {
                written?;
            }
        }
        if inode_dirty {
            let now = self.now();
            inode.i_atime = now;
            inode.i_mtime = now;
            let written = self.write_new_inode(EXT4_RESIZE_INO, &inode);
            if result.is_ok() {
                written?;
            }
        }
        result?;
        info!(
            "Resize inode covers {} reserved GDT blocks (dind block {})",
            reserved, dind_blk
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_reserved_gdt(
        &mut self,
        inode: &mut Inode,
        dind: &mut [u32],
        sb_blk: u64,
        apb: u64,
        desc_blocks: u64,
        reserved: u64,
        bpg: u64,
        dind_dirty: &mut bool,
        inode_dirty: &mut bool,
    ) -> ExtResult<()> {
        for rsv_off in 0..reserved {
            let gdt_off = ((desc_blocks + rsv_off) % apb) as usize;
            let gdt_blk = sb_blk + 1 + desc_blocks + rsv_off;
            let mut gdt_dirty = false;

            let mut gdt_buf = if dind[gdt_off] == 0 {
                dind[gdt_off] = gdt_blk as u32;
                inode.iblk_add_blocks(&self.sb, 1);
                gdt_dirty = true;
                *dind_dirty = true;
                *inode_dirty = true;
                debug!("Added primary GDT block {} at dind[{}]", gdt_blk, gdt_off);
                vec![0u32; apb as usize]
            } else if dind[gdt_off] as u64 == gdt_blk {
                self.read_ind_block(gdt_blk)?
            } else {
                return Err(ExtError::ResizeInodeCorrupt(format!(
                    "primary GDT slot {} holds block {}, expected {}",
                    gdt_off, dind[gdt_off], gdt_blk
                )));
            };

            for (last, group) in self.backup_groups().enumerate() {
                let expect = gdt_blk + group as u64 * bpg;
                if last >= gdt_buf.len() {
                    return Err(ExtError::ResizeInodeCorrupt(format!(
                        "more backup groups than fit in GDT block {}",
                        gdt_blk
                    )));
                }
                if gdt_buf[last] == 0 {
                    gdt_buf[last] = expect as u32;
                    inode.iblk_add_blocks(&self.sb, 1);
                    gdt_dirty = true;
                    *inode_dirty = true;
                } else if gdt_buf[last] as u64 != expect {
                    return Err(ExtError::ResizeInodeCorrupt(format!(
                        "backup GDT slot {} of block {} holds {}, expected {} for group {}",
                        last, gdt_blk, gdt_buf[last], expect, group
                    )));
                }
            }
            if gdt_dirty {
                self.write_ind_block(gdt_blk, &gdt_buf)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::filesystem::initialize::initialize;
    use crate::ext_native::writer::closefs::group_has_super;
    use e2kit_core::{MemoryChannel, OpenOptions};

    fn resize_params() -> FsParams {
        FsParams {
            blocks_per_group: 1024,
            reserved_gdt_blocks: 4,
            feature_compat: FsParams::default().feature_compat | EXT4_FEATURE_COMPAT_RESIZE_INODE,
            ..Default::default()
        }
    }

    fn open_rw(params: FsParams) -> (MemoryChannel, ExtFilesystem) {
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();
        let mut fs = ExtFilesystem::open(Box::new(channel.clone()), &OpenOptions::read_write()).unwrap();
        fs.read_bitmaps().unwrap();
        (channel, fs)
    }

    #[test]
    fn test_resize_inode_layout() {
        let (_channel, mut fs) = open_rw(resize_params());
        assert_eq!(fs.group_desc_count(), 8);
        let inode = fs.read_inode(EXT4_RESIZE_INO).unwrap();
        assert!(inode.is_reg());
        let dind = inode.i_block[EXT4_DIND_BLOCK] as u64;
        assert_ne!(dind, 0);
        assert!(fs.block_bitmap().unwrap().test(dind).unwrap());

        let backups: Vec<u32> = (1..8).filter(|&g| group_has_super(&fs.sb, g)).collect();
        assert_eq!(backups, vec![1, 3, 5, 7]);
        let entries = fs.read_ind_block(dind).unwrap();
        let desc_blocks = fs.desc_blocks() as u64;
        for rsv in 0..4u64 {
            let gdt_blk = 1 + 1 + desc_blocks + rsv;
            assert_eq!(entries[(desc_blocks + rsv) as usize] as u64, gdt_blk);
            let gdt = fs.read_ind_block(gdt_blk).unwrap();
            for (i, &group) in backups.iter().enumerate() {
                assert_eq!(gdt[i] as u64, gdt_blk + group as u64 * 1024);
            }
            assert_eq!(gdt[backups.len()], 0);
        }
        // dind + 4 primaries + 4 × 4 backups
        assert_eq!(inode.blocks_in_fs_units(&fs.sb), 1 + 4 + 16);
    }

    #[test]
    fn test_existing_resize_inode_verifies_cleanly() {
        let (channel, mut fs) = open_rw(resize_params());
        let before = fs.read_inode(EXT4_RESIZE_INO).unwrap();
        channel.clear_writes();
        fs.create_resize_inode().unwrap();
        assert!(channel.writes().is_empty());
        let after = fs.read_inode(EXT4_RESIZE_INO).unwrap();
        assert_eq!(before.i_blocks, after.i_blocks);
    }

    #[test]
    fn test_mismatched_slots_are_corruption() {
        let (_channel, mut fs) = open_rw(resize_params());
        let desc_blocks = fs.desc_blocks() as u64;
        let gdt_blk = 2 + desc_blocks;
        let mut gdt = fs.read_ind_block(gdt_blk).unwrap();
        gdt[1] += 1;
        fs.write_ind_block(gdt_blk, &gdt).unwrap();
        assert!(matches!(fs.create_resize_inode(), Err(ExtError::ResizeInodeCorrupt(_))));

        gdt[1] -= 1;
        fs.write_ind_block(gdt_blk, &gdt).unwrap();
        let dind = fs.read_inode(EXT4_RESIZE_INO).unwrap().i_block[EXT4_DIND_BLOCK] as u64;
        let mut entries = fs.read_ind_block(dind).unwrap();
        entries[desc_blocks as usize] = 5000;
        fs.write_ind_block(dind, &entries).unwrap();
        assert!(matches!(fs.create_resize_inode(), Err(ExtError::ResizeInodeCorrupt(_))));
    }

    #[test]
    fn test_emptied_slots_are_refilled() {
        let (_channel, mut fs) = open_rw(resize_params());
        let gdt_blk = 2 + fs.desc_blocks() as u64 + 3;
        let mut gdt = fs.read_ind_block(gdt_blk).unwrap();
        let expected = gdt.clone();
        gdt[2] = 0;
        fs.write_ind_block(gdt_blk, &gdt).unwrap();
        fs.create_resize_inode().unwrap();
        assert_eq!(fs.read_ind_block(gdt_blk).unwrap(), expected);
    }
}
