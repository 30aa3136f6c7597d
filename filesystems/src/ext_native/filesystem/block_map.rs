// Logical to physical block mapping for indirect-mapped and extent-mapped
// inodes, and the bad blocks inode

use super::hooks::Hooked;
use super::ExtFilesystem;
use crate::ext_native::core::extent::{Extent, ExtentHeader, ExtentIndex, EXTENT_ENTRY_SIZE, EXTENT_HEADER_SIZE};
use crate::ext_native::core::*;
use log::{debug, warn};

/// Deepest extent tree accepted
const EXT4_MAX_EXTENT_DEPTH: u16 = 5;

/// One mapped data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapping {
    pub logical: u64,
    pub physical: BlockNumber,
}

impl ExtFilesystem {
    /// Read an indirect block as a list of block numbers
    pub fn read_ind_block(&mut self, block: BlockNumber) -> ExtResult<Vec<u32>> {
        let mut buf = vec![0u8; self.block_size() as usize];
        self.read_block(block, &mut buf)?;
        let e = self.endian;
        Ok((0..buf.len() / 4).map(|i| e.u32(&buf, i * 4)).collect())
    }

    pub fn write_ind_block(&mut self, block: BlockNumber, entries: &[u32]) -> ExtResult<()> {
        let mut buf = vec![0u8; self.block_size() as usize];
        for (i, &entry) in entries.iter().enumerate().take(buf.len() / 4) {
            self.endian.put_u32(&mut buf, i * 4, entry);
        }
        self.write_block(block, &buf)
    }

    fn check_meta_block(&self, block: BlockNumber) -> ExtResult<()> {
        if block < self.sb.s_first_data_block as u64 || block >= self.sb.blocks_count() {
            return Err(ExtError::BadBlockNumber(block));
        }
        Ok(())
    }

    /// Every mapped data block of `inode` in logical order; holes are absent
    pub fn block_list(&mut self, ino: InodeNumber, inode: &Inode) -> ExtResult<Vec<BlockMapping>> {
        if inode.has_inline_data() {
            return Err(ExtError::InlineDataCantIterate);
        }
        if inode.has_flag(EXT4_EXTENTS_FL) {
            let mut out = Vec::new();
            let root = inode.i_block_bytes();
            self.walk_extent_node(ino, &root, EXT4_MAX_EXTENT_DEPTH + 1, &mut out)?;
            out.sort_by_key(|m| m.logical);
            return Ok(out);
        }

        let i_block = if self.suppress_get_blocks {
            inode.i_block
        } else {
            match self.with_hooks(|h, fs| h.get_blocks(fs, ino))? {
                Hooked::Handled(blocks) => blocks,
                Hooked::NotHandled => inode.i_block,
            }
        };

        let mut out = Vec::new();
        for (i, &blk) in i_block.iter().take(EXT4_NDIR_BLOCKS).enumerate() {
            if blk != 0 {
                out.push(BlockMapping {
                    logical: i as u64,
                    physical: blk as u64,
                });
            }
        }
        let apb = (self.block_size() / 4) as u64;
        let mut logical = EXT4_NDIR_BLOCKS as u64;
        for (level, slot) in [(1u32, EXT4_IND_BLOCK), (2, EXT4_DIND_BLOCK), (3, EXT4_TIND_BLOCK)] {
            let span = apb.pow(level);
            if i_block[slot] != 0 {
                self.walk_indirect(i_block[slot] as u64, level, logical, &mut out)?;
            }
            logical += span;
        }
        Ok(out)
    }

    fn walk_indirect(&mut self, block: BlockNumber, level: u32, first: u64, out: &mut Vec<BlockMapping>) -> ExtResult<()> {
        self.check_meta_block(block)?;
        let entries = self.read_ind_block(block)?;
        let span = (self.block_size() as u64 / 4).pow(level - 1);
        for (i, &entry) in entries.iter().enumerate() {
            if entry == 0 {
                continue;
            }
            let logical = first + i as u64 * span;
            if level == 1 {
                out.push(BlockMapping {
                    logical,
                    physical: entry as u64,
                });
            } else {
                self.walk_indirect(entry as u64, level - 1, logical, out)?;
            }
        }
        Ok(())
    }

    fn walk_extent_node(&mut self, ino: InodeNumber, node: &[u8], depth_left: u16, out: &mut Vec<BlockMapping>) -> ExtResult<()> {
        let header = ExtentHeader::read(node);
        header.validate(ino, node.len())?;
        if header.eh_depth >= depth_left {
            return Err(ExtError::ExtentCorrupted {
                ino,
                detail: format!("depth {} too deep", header.eh_depth),
            });
        }
        for i in 0..header.eh_entries as usize {
            let off = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
            if header.eh_depth == 0 {
                let extent = Extent::read(&node[off..]);
                for j in 0..extent.len() as u64 {
                    out.push(BlockMapping {
                        logical: extent.ee_block as u64 + j,
                        physical: extent.ee_start + j,
                    });
                }
            } else {
                let index = ExtentIndex::read(&node[off..]);
                self.check_meta_block(index.ei_leaf).map_err(|_| ExtError::ExtentCorrupted {
                    ino,
                    detail: format!("index points at block {}", index.ei_leaf),
                })?;
                let mut child = vec![0u8; self.block_size() as usize];
                self.read_block(index.ei_leaf, &mut child)?;
                let child_depth = ExtentHeader::read(&child).eh_depth;
                if child_depth + 1 != header.eh_depth {
                    return Err(ExtError::ExtentCorrupted {
                        ino,
                        detail: format!("child depth {} under depth {}", child_depth, header.eh_depth),
                    });
                }
                self.walk_extent_node(ino, &child, header.eh_depth, out)?;
            }
        }
        Ok(())
    }

    /// Physical block backing logical block `logical`, None for a hole
    pub fn bmap(&mut self, ino: InodeNumber, inode: &Inode, logical: u64) -> ExtResult<Option<BlockNumber>> {
        Ok(self
            .block_list(ino, inode)?
            .into_iter()
            .find(|m| m.logical == logical)
            .map(|m| m.physical))
    }

    /// Map logical block 0 of an empty inode to `block`
    pub fn set_first_block(&self, inode: &mut Inode, block: BlockNumber) {
        if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_EXTENTS) {
            inode.i_flags |= EXT4_EXTENTS_FL;
        }
        if inode.has_flag(EXT4_EXTENTS_FL) {
            inode.set_i_block_bytes(&extent::single_extent_i_block(block, 1));
        } else {
            inode.i_block = [0; EXT4_N_BLOCKS];
            inode.i_block[0] = block as u32;
        }
    }

    /// Read the list of bad blocks recorded in inode 1
    pub fn read_bb_inode(&mut self) -> ExtResult<BadBlocksList> {
        let inode = self.read_inode(EXT4_BAD_INO)?;
        let mut list = BadBlocksList::new();
        if inode.i_blocks == 0 {
            return Ok(list);
        }
        let first = self.sb.s_first_data_block as u64;
        let count = self.sb.blocks_count();
        for mapping in self.block_list(EXT4_BAD_INO, &inode)? {
            if mapping.physical < first || mapping.physical >= count {
                warn!("Ignoring out of range bad block {}", mapping.physical);
                continue;
            }
            list.add(mapping.physical);
        }
        debug!("Bad blocks inode lists {} blocks", list.len());
        Ok(list)
    }

    /// Record `list` in inode 1 using direct and single indirect slots
    pub fn write_bb_inode(&mut self, list: &BadBlocksList) -> ExtResult<()> {
        self.require_rw()?;
        let apb = (self.block_size() / 4) as usize;
        if list.len() > EXT4_NDIR_BLOCKS + apb {
            return Err(ExtError::InvalidArgument(format!("{} bad blocks do not fit", list.len())));
        }
        let mut inode = self.read_inode(EXT4_BAD_INO)?;
        inode.i_block = [0; EXT4_N_BLOCKS];
        let blocks: Vec<u32> = list.iter().map(|b| b as u32).collect();
        let mut used = blocks.len() as u64;
        for (slot, &blk) in inode.i_block.iter_mut().zip(blocks.iter()).take(EXT4_NDIR_BLOCKS) {
            *slot = blk;
        }
        if blocks.len() > EXT4_NDIR_BLOCKS {
            let ind = self.alloc_block(0)?;
            self.write_ind_block(ind, &blocks[EXT4_NDIR_BLOCKS..])?;
            inode.i_block[EXT4_IND_BLOCK] = ind as u32;
            used += 1;
        }
        inode.iblk_set(&self.sb, used);
        inode.i_size = list.len() as u64 * self.block_size() as u64;
        inode.i_mtime = self.now();
        self.write_inode(EXT4_BAD_INO, &inode)?;
        self.badblocks = Some(list.clone());
        Ok(())
    }
}
