// Superblock and group descriptor writeback: backup placement, the
// primary superblock diff write, flush and close

use crate::ext_native::core::*;
use crate::ext_native::filesystem::ExtFilesystem;
use log::{debug, info, trace};

fn test_root(mut group: u32, base: u32) -> bool {
    loop {
        if group < base {
            return false;
        }
        if group == base {
            return true;
        }
        if group % base != 0 {
            return false;
        }
        group /= base;
    }
}

/// Whether `group` carries a superblock copy under the features of `sb`
pub fn group_has_super(sb: &Superblock, group: GroupNumber) -> bool {
    if group == 0 {
        return true;
    }
    if sb.has_compat(EXT4_FEATURE_COMPAT_SPARSE_SUPER2) {
        return group == sb.s_backup_bgs[0] || group == sb.s_backup_bgs[1];
    }
    if group <= 1 || !sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_SPARSE_SUPER) {
        return true;
    }
    if group & 1 == 0 {
        return false;
    }
    test_root(group, 3) || test_root(group, 5) || test_root(group, 7)
}

/// Groups after group 0 that hold backup superblocks, in the order the
/// 3/5/7 power sequences produce them
#[derive(Debug, Clone)]
pub struct BackupGroups {
    three: u32,
    five: u32,
    seven: u32,
    sparse: bool,
    sparse2: Option<[u32; 2]>,
    group_count: u32,
}

impl BackupGroups {
    pub fn new(sb: &Superblock, group_count: u32) -> Self {
        Self {
            three: 1,
            five: 5,
            seven: 7,
            sparse: sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_SPARSE_SUPER),
            sparse2: if sb.has_compat(EXT4_FEATURE_COMPAT_SPARSE_SUPER2) {
                Some(sb.s_backup_bgs)
            } else {
                None
            },
            group_count,
        }
    }

    fn next_candidate(&mut self) -> Option<u64> {
        if let Some(bgs) = self.sparse2 {
            while self.three <= 2 {
                let slot = self.three as usize - 1;
                self.three += 1;
                if bgs[slot] != 0 {
                    return Some(bgs[slot] as u64);
                }
            }
            return None;
        }
        if !self.sparse {
            let ret = self.three;
            self.three += 1;
            return Some(ret as u64);
        }
        let (mut value, mut mult) = (self.three, 3);
        if self.five < value {
            value = self.five;
            mult = 5;
        }
        if self.seven < value {
            value = self.seven;
            mult = 7;
        }
        let next = value.saturating_mul(mult);
        match mult {
            3 => self.three = next,
            5 => self.five = next,
            _ => self.seven = next,
        }
        Some(value as u64)
    }
}

impl Iterator for BackupGroups {
    type Item = GroupNumber;

    fn next(&mut self) -> Option<GroupNumber> {
        loop {
            let candidate = self.next_candidate()?;
            if candidate >= self.group_count as u64 {
                if self.sparse2.is_some() {
                    continue;
                }
                return None;
            }
            return Some(candidate as u32);
        }
    }
}

/// Where a group's superblock and descriptor copies live; zero means absent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuperAndBgdLoc {
    pub super_blk: BlockNumber,
    pub old_desc_blk: BlockNumber,
    pub new_desc_blk: BlockNumber,
    /// Blocks of the group used by these copies (including reserved GDT)
    pub used_blocks: u64,
}

impl ExtFilesystem {
    pub fn bg_has_super(&self, group: GroupNumber) -> bool {
        group_has_super(&self.sb, group)
    }

    pub fn backup_groups(&self) -> BackupGroups {
        BackupGroups::new(&self.sb, self.group_desc_count())
    }

    pub fn super_and_bgd_loc(&self, group: GroupNumber) -> SuperAndBgdLoc {
        let group_block = self.group_first_block(group);
        let meta_bg_feature = self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG);
        let old_desc_blocks = if meta_bg_feature {
            self.sb.s_first_meta_bg as u64
        } else {
            self.desc_blocks() as u64 + self.sb.s_reserved_gdt_blocks as u64
        };

        let mut loc = SuperAndBgdLoc::default();
        let has_super = self.bg_has_super(group);
        if has_super {
            loc.super_blk = group_block;
            loc.used_blocks += 1;
        }
        let meta_bg_size = self.descs_per_block();
        let meta_bg = group / meta_bg_size;
        if !meta_bg_feature || meta_bg < self.sb.s_first_meta_bg {
            if has_super {
                loc.old_desc_blk = group_block + 1;
                loc.used_blocks += old_desc_blocks;
            }
        } else {
            let pos = group % meta_bg_size;
            if pos == 0 || pos == 1 || pos == meta_bg_size - 1 {
                loc.new_desc_blk = group_block + has_super as u64;
                loc.used_blocks += 1;
            }
        }
        loc
    }

    /// Group descriptor table encoded for disk, padded to whole blocks
    fn encode_group_desc_table(&self) -> Vec<u8> {
        let block_size = self.block_size() as usize;
        let desc_size = self.sb.desc_size() as usize;
        let mut buf = vec![0u8; self.desc_blocks() as usize * block_size];
        for (i, gd) in self.group_desc.iter().enumerate() {
            let off = i * desc_size;
            gd.encode(&mut buf[off..off + desc_size], desc_size, self.endian);
        }
        buf
    }

    fn write_backup_super(&mut self, group: GroupNumber, block: BlockNumber) -> ExtResult<()> {
        let mut shadow = self.sb.clone();
        shadow.s_block_group_nr = group.min(EXT4_MAX_BLOCK_GROUP_NR) as u16;
        shadow.update_checksum();
        let bytes = shadow.encode(self.endian);
        trace!("Backup superblock for group {} at block {}", group, block);
        self.io.write_at(block * self.block_size() as u64, &bytes)
    }

    fn write_full_primary(&mut self, bytes: Vec<u8>) -> ExtResult<()> {
        self.io.write_at(SUPERBLOCK_OFFSET, &bytes)?;
        self.orig_super = Some(bytes);
        Ok(())
    }

    /// Write the primary superblock, touching only the 16-bit words that
    /// differ from the last copy read or written
    fn write_primary_superblock(&mut self) -> ExtResult<()> {
        let new = self.sb.encode(self.endian);
        let old = match self.orig_super.take() {
            Some(old) => old,
            None => return self.write_full_primary(new),
        };
        let words = SUPERBLOCK_SIZE / 2;
        let same = |i: usize| old[2 * i..2 * i + 2] == new[2 * i..2 * i + 2];

        let mut idx = 0;
        while idx < words {
            if same(idx) {
                idx += 1;
                continue;
            }
            let start = idx;
            idx += 1;
            while idx < words && !same(idx) {
                idx += 1;
            }
            let (off, len) = (start * 2, (idx - start) * 2);
            match self.io.write_byte(SUPERBLOCK_OFFSET + off as u64, &new[off..off + len]) {
                Ok(()) => trace!("Superblock diff write of {} bytes at {}", len, off),
                Err(ExtError::Unimplemented(_)) => {
                    debug!("Channel has no byte writes, rewriting the whole superblock");
                    return self.write_full_primary(new);
                }
                Err(e) => {
                    self.orig_super = Some(old);
                    return Err(e);
                }
            }
        }
        self.orig_super = Some(new);
        Ok(())
    }

    /// Write dirty bitmaps, every backup superblock, the descriptor tables
    /// and finally the primary superblock
    pub fn flush(&mut self) -> ExtResult<()> {
        self.require_rw()?;
        let fs_state = self.sb.s_state;
        let feature_incompat = self.sb.s_feature_incompat;

        self.sb.s_wtime = self.now();
        self.sb.s_block_group_nr = 0;

        // Bitmap checksums live in the descriptors, so bitmaps go first
        let result = self.write_bitmaps().and_then(|_| self.flush_super_and_descriptors(fs_state, feature_incompat));

        self.sb.s_state = fs_state;
        self.sb.s_feature_incompat = feature_incompat;
        result
    }

    fn flush_super_and_descriptors(&mut self, fs_state: u16, feature_incompat: u32) -> ExtResult<()> {
        // Backups are written marked not clean
        self.sb.s_state &= !EXT4_VALID_FS;
        self.sb.s_feature_incompat &= !EXT4_FEATURE_INCOMPAT_RECOVER;

        if !self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_JOURNAL_DEV) {
            let shadow = self.encode_group_desc_table();
            let block_size = self.block_size() as usize;
            let old_desc_blocks = if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG) {
                self.sb.s_first_meta_bg.min(self.desc_blocks()) as usize
            } else {
                self.desc_blocks() as usize
            };
            let master_only = self.flags.master_sb_only;
            let descs_per_block = self.descs_per_block();

            for group in 0..self.group_desc_count() {
                let loc = self.super_and_bgd_loc(group);
                if !master_only && group > 0 && loc.super_blk != 0 {
                    self.write_backup_super(group, loc.super_blk)?;
                }
                if self.flags.super_only {
                    continue;
                }
                if loc.old_desc_blk != 0 && old_desc_blocks > 0 && (!master_only || group == 0) {
                    self.io.write_blocks(
                        loc.old_desc_blk,
                        old_desc_blocks,
                        &shadow[..old_desc_blocks * block_size],
                    )?;
                }
                if loc.new_desc_blk != 0 {
                    let meta_bg = (group / descs_per_block) as usize;
                    let off = meta_bg * block_size;
                    self.io.write_blocks(loc.new_desc_blk, 1, &shadow[off..off + block_size])?;
                }
            }
        }

        self.sb.s_block_group_nr = 0;
        self.sb.s_state = fs_state;
        self.sb.s_feature_incompat = feature_incompat;
        self.sb.update_checksum();

        self.io.flush()?;
        self.write_primary_superblock()?;
        self.flags.dirty = false;
        self.io.flush()?;
        debug!("Flushed superblock and {} group descriptors", self.group_desc_count());
        Ok(())
    }

    /// Write bitmaps, flush if anything is dirty and release the handle
    pub fn close(mut self) -> ExtResult<()> {
        if self.flags.rw {
            self.write_bitmaps()?;
        }
        if self.flags.dirty {
            self.flush()?;
        }
        info!("Closed filesystem {}", self.sb.uuid_hex());
        Ok(())
    }
}
