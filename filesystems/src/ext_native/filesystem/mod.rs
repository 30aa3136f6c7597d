// Filesystem handle: superblock, group descriptors, bitmaps and the I/O
// channel, opened once and shared by the scanner, iterators and writers.

pub mod alloc;
pub mod bitmaps;
pub mod block_map;
pub mod hooks;
pub mod initialize;
pub mod inode_io;

use crate::ext_native::core::*;
use e2kit_core::{IoChannel, OpenOptions};
use log::{debug, info, warn};

pub use hooks::{FsHooks, Hooked};
pub use inode_io::InodeCache;

/// Transient state flags of an open handle
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFlags {
    pub rw: bool,
    /// In-memory superblock or descriptors differ from disk
    pub dirty: bool,
    /// Something was written through this handle
    pub changed: bool,
    pub bb_dirty: bool,
    pub ib_dirty: bool,
    pub master_sb_only: bool,
    pub super_only: bool,
    pub ignore_csum_errors: bool,
}

pub struct ExtFilesystem {
    pub(crate) io: Box<dyn IoChannel>,
    /// In-memory superblock
    pub sb: Superblock,
    /// On-disk image of the primary superblock as last read or written
    pub(crate) orig_super: Option<Vec<u8>>,
    pub group_desc: Vec<GroupDesc>,
    pub(crate) block_map: Option<Bitmap>,
    pub(crate) inode_map: Option<Bitmap>,
    pub(crate) badblocks: Option<BadBlocksList>,
    pub(crate) hooks: Option<Box<dyn FsHooks>>,
    /// Bypass the get_blocks hook (set while the scanner reads inode 1)
    pub(crate) suppress_get_blocks: bool,
    pub(crate) icache: InodeCache,
    pub flags: FsFlags,
    pub(crate) endian: Endian,
    /// Fixed timestamp for writes, wall clock when unset
    pub(crate) now: Option<u32>,
    group_desc_count: u32,
    desc_blocks: u32,
    inode_blocks_per_group: u32,
}

impl ExtFilesystem {
    /// Open the filesystem on `io`, reading and validating the superblock
    /// and group descriptor table.
    pub fn open(mut io: Box<dyn IoChannel>, options: &OpenOptions) -> ExtResult<Self> {
        info!("Opening ext filesystem on {}", io.name());

        let (sb_offset, group_block) = match options.superblock {
            Some(block) => {
                let block_size = options.block_size.ok_or_else(|| {
                    ExtError::InvalidArgument("backup superblock needs an explicit block size".to_string())
                })?;
                io.set_block_size(block_size);
                (block * block_size as u64, Some(block))
            }
            None => {
                io.set_block_size(SUPERBLOCK_OFFSET as u32);
                (SUPERBLOCK_OFFSET, None)
            }
        };

        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        io.read_at(sb_offset, &mut raw)?;

        let endian = if options.swap_bytes {
            Endian::Big
        } else if Endian::Little.u16(&raw, 0x38) == EXT4_SUPER_MAGIC {
            Endian::Little
        } else if Endian::Big.u16(&raw, 0x38) == EXT4_SUPER_MAGIC {
            Endian::Big
        } else {
            return Err(ExtError::BadMagic(Endian::Little.u16(&raw, 0x38)));
        };
        let sb = Superblock::decode(&raw, endian);
        if sb.s_magic != EXT4_SUPER_MAGIC {
            return Err(ExtError::BadMagic(sb.s_magic));
        }

        let flags = FsFlags {
            rw: options.read_write,
            master_sb_only: options.master_sb_only,
            super_only: options.super_only,
            ignore_csum_errors: options.ignore_csum_errors,
            ..Default::default()
        };

        if !sb.verify_checksum() {
            if flags.ignore_csum_errors {
                warn!("Superblock checksum mismatch on {}, continuing", io.name());
            } else {
                return Err(ExtError::SuperblockChecksumInvalid);
            }
        }
        if sb.s_rev_level > EXT4_MAX_SUPP_REV {
            return Err(ExtError::RevTooHigh(sb.s_rev_level));
        }
        let unsupported = sb.s_feature_incompat & !EXT4_LIB_FEATURE_INCOMPAT_SUPP;
        if unsupported != 0 {
            return Err(ExtError::UnsupportedFeature(format!("incompat 0x{:x}", unsupported)));
        }
        if sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_BIGALLOC) {
            return Err(ExtError::UnsupportedFeature("bigalloc".to_string()));
        }
        Self::validate_geometry(&sb)?;

        let block_size = sb.block_size();
        if let Some(expected) = options.block_size {
            if expected != block_size {
                return Err(ExtError::CorruptSuperblock(format!(
                    "block size {} does not match requested {}",
                    block_size, expected
                )));
            }
        }
        io.set_block_size(block_size);

        let (group_desc_count, desc_blocks, inode_blocks_per_group) = Self::derive_geometry(&sb)?;
        if group_desc_count as u64 * sb.s_inodes_per_group as u64 != sb.s_inodes_count as u64 {
            return Err(ExtError::CorruptSuperblock(format!(
                "{} groups of {} inodes do not add up to {} inodes",
                group_desc_count, sb.s_inodes_per_group, sb.s_inodes_count
            )));
        }

        let from_backup = group_block.is_some();
        let mut fs = Self {
            io,
            orig_super: if from_backup { None } else { Some(raw) },
            sb,
            group_desc: Vec::with_capacity(group_desc_count as usize),
            block_map: None,
            inode_map: None,
            badblocks: None,
            hooks: None,
            suppress_get_blocks: false,
            icache: InodeCache::new(options.inode_cache_size),
            flags,
            endian,
            now: None,
            group_desc_count,
            desc_blocks,
            inode_blocks_per_group,
        };

        let group_block = group_block.unwrap_or(fs.sb.s_first_data_block as u64);
        fs.read_group_descriptors(group_block)?;

        if from_backup && fs.sb.has_group_desc_csum() {
            for group in 0..fs.group_desc_count {
                let gd = &mut fs.group_desc[group as usize];
                gd.clear_flag(EXT4_BG_BLOCK_UNINIT);
                gd.clear_flag(EXT4_BG_INODE_UNINIT);
                gd.itable_unused = 0;
                fs.group_desc_csum_set(group);
            }
            if fs.flags.rw {
                fs.mark_super_dirty();
            }
        }

        info!(
            "Opened filesystem {} ({} groups, {} byte blocks{})",
            fs.sb.uuid_hex(),
            fs.group_desc_count,
            block_size,
            if endian.is_swapped() { ", byte-swapped" } else { "" }
        );
        Ok(fs)
    }

    /// Build a handle around an in-memory superblock and descriptor table
    /// that have not been written yet
    pub(crate) fn assemble(
        io: Box<dyn IoChannel>,
        sb: Superblock,
        group_desc: Vec<GroupDesc>,
        endian: Endian,
    ) -> ExtResult<Self> {
        Self::validate_geometry(&sb)?;
        let block_size = sb.block_size();
        let (group_desc_count, desc_blocks, inode_blocks_per_group) = Self::derive_geometry(&sb)?;
        if group_desc.len() != group_desc_count as usize {
            return Err(ExtError::InvalidArgument(format!(
                "{} descriptors for {} groups",
                group_desc.len(),
                group_desc_count
            )));
        }
        let mut io = io;
        io.set_block_size(block_size);
        Ok(Self {
            io,
            orig_super: None,
            sb,
            group_desc,
            block_map: None,
            inode_map: None,
            badblocks: None,
            hooks: None,
            suppress_get_blocks: false,
            icache: InodeCache::new(4),
            flags: FsFlags {
                rw: true,
                ..Default::default()
            },
            endian,
            now: None,
            group_desc_count,
            desc_blocks,
            inode_blocks_per_group,
        })
    }

    fn validate_geometry(sb: &Superblock) -> ExtResult<()> {
        if sb.s_log_block_size > EXT4_MAX_BLOCK_LOG_SIZE - EXT4_MIN_BLOCK_LOG_SIZE {
            return Err(ExtError::CorruptSuperblock(format!(
                "log block size {}",
                sb.s_log_block_size
            )));
        }
        let block_size = sb.block_size();
        let inode_size = sb.inode_size() as u32;
        if inode_size < EXT4_GOOD_OLD_INODE_SIZE as u32
            || inode_size > block_size
            || !inode_size.is_power_of_two()
        {
            return Err(ExtError::CorruptSuperblock(format!("inode size {}", inode_size)));
        }
        // Group-relative inode indexes are 16 bits wide in places
        let inodes_per_block = block_size / inode_size;
        if sb.s_blocks_per_group == 0
            || sb.s_blocks_per_group > 8 * block_size
            || sb.s_inodes_per_group == 0
            || sb.s_inodes_per_group > 8 * block_size
            || sb.s_inodes_per_group > EXT4_MAX_INODES_PER_GROUP - inodes_per_block
        {
            return Err(ExtError::CorruptSuperblock(format!(
                "{} blocks and {} inodes per group",
                sb.s_blocks_per_group, sb.s_inodes_per_group
            )));
        }
        if sb.is_64bit() {
            let desc_size = sb.s_desc_size;
            if desc_size < EXT4_MIN_DESC_SIZE_64BIT
                || desc_size > EXT4_MAX_DESC_SIZE
                || !desc_size.is_power_of_two()
            {
                return Err(ExtError::CorruptSuperblock(format!("descriptor size {}", desc_size)));
            }
        }
        if sb.s_first_data_block as u64 >= sb.blocks_count() {
            return Err(ExtError::CorruptSuperblock(format!(
                "first data block {} beyond {} blocks",
                sb.s_first_data_block,
                sb.blocks_count()
            )));
        }
        Ok(())
    }

    /// Group count, descriptor blocks and inode table blocks per group of
    /// an already validated superblock
    fn derive_geometry(sb: &Superblock) -> ExtResult<(u32, u32, u32)> {
        let block_size = sb.block_size() as u64;
        let bpg = sb.s_blocks_per_group as u64;
        let data_blocks = sb.blocks_count() - sb.s_first_data_block as u64;
        let groups = (data_blocks + bpg - 1) / bpg;
        let groups = u32::try_from(groups).map_err(|_| {
            ExtError::CorruptSuperblock(format!("{} block groups", groups))
        })?;

        let descs_per_block = block_size / sb.desc_size() as u64;
        let desc_blocks = (groups as u64 + descs_per_block - 1) / descs_per_block;
        let table_bytes = sb.s_inodes_per_group as u64 * sb.inode_size() as u64;
        let inode_blocks = (table_bytes + block_size - 1) / block_size;
        let inode_blocks = u32::try_from(inode_blocks).map_err(|_| {
            ExtError::CorruptSuperblock(format!(
                "inode table of {} inodes of {} bytes",
                sb.s_inodes_per_group,
                sb.inode_size()
            ))
        })?;
        Ok((groups, desc_blocks as u32, inode_blocks))
    }

    /// Block holding descriptor block `i`, given the superblock location
    /// the table belongs to. Under meta_bg, a `group_block` other than the
    /// primary selects the backup copy in the second group of the meta group.
    pub fn descriptor_block_loc(&self, group_block: BlockNumber, i: u32) -> BlockNumber {
        if !self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG) || i < self.sb.s_first_meta_bg {
            return group_block + i as u64 + 1;
        }
        let bg = self.descs_per_block() * i;
        let mut has_super = self.bg_has_super(bg) as u64;
        let mut ret = self.group_first_block(bg);
        if group_block != self.sb.s_first_data_block as u64
            && ret + has_super + (self.sb.s_blocks_per_group as u64) < self.sb.blocks_count()
        {
            ret += self.sb.s_blocks_per_group as u64;
            has_super = self.bg_has_super(bg + 1) as u64;
        }
        ret + has_super
    }

    fn read_group_descriptors(&mut self, group_block: BlockNumber) -> ExtResult<()> {
        let block_size = self.block_size() as usize;
        let desc_size = self.sb.desc_size() as usize;
        let descs_per_block = self.descs_per_block() as usize;
        let mut buf = vec![0u8; self.desc_blocks as usize * block_size];

        let first_meta_bg = if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG) {
            self.sb.s_first_meta_bg.min(self.desc_blocks)
        } else {
            self.desc_blocks
        };
        if first_meta_bg > 0 {
            let start = self.descriptor_block_loc(group_block, 0);
            let len = first_meta_bg as usize * block_size;
            self.io.read_blocks(start, first_meta_bg as usize, &mut buf[..len])?;
        }
        for i in first_meta_bg..self.desc_blocks {
            let blk = self.descriptor_block_loc(group_block, i);
            let off = i as usize * block_size;
            debug!("Reading meta_bg descriptor block {} from {}", i, blk);
            self.io.read_blocks(blk, 1, &mut buf[off..off + block_size])?;
        }

        self.group_desc.clear();
        for group in 0..self.group_desc_count as usize {
            let block = group / descs_per_block;
            let off = block * block_size + (group % descs_per_block) * desc_size;
            let gd = GroupDesc::decode(&buf[off..off + desc_size], desc_size, self.endian);
            self.group_desc.push(gd);
        }

        if self.sb.has_group_desc_csum() {
            for group in 0..self.group_desc_count {
                if !self.group_desc_csum_verify(group) {
                    if self.flags.ignore_csum_errors {
                        warn!("Group descriptor {} checksum mismatch, continuing", group);
                    } else {
                        return Err(ExtError::GroupDescChecksumInvalid(group));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.sb.block_size()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn group_desc_count(&self) -> u32 {
        self.group_desc_count
    }

    /// Blocks used by the descriptor table (without reserved GDT blocks)
    pub fn desc_blocks(&self) -> u32 {
        self.desc_blocks
    }

    pub fn inode_blocks_per_group(&self) -> u32 {
        self.inode_blocks_per_group
    }

    pub fn descs_per_block(&self) -> u32 {
        self.block_size() / self.sb.desc_size() as u32
    }

    pub fn inode_size(&self) -> usize {
        self.sb.inode_size() as usize
    }

    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        self.sb.s_first_data_block as u64 + group as u64 * self.sb.s_blocks_per_group as u64
    }

    pub fn group_last_block(&self, group: GroupNumber) -> BlockNumber {
        if group + 1 == self.group_desc_count {
            self.sb.blocks_count() - 1
        } else {
            self.group_first_block(group) + self.sb.s_blocks_per_group as u64 - 1
        }
    }

    pub fn group_blocks_count(&self, group: GroupNumber) -> u64 {
        self.group_last_block(group) - self.group_first_block(group) + 1
    }

    pub fn group_of_block(&self, block: BlockNumber) -> GroupNumber {
        ((block - self.sb.s_first_data_block as u64) / self.sb.s_blocks_per_group as u64) as u32
    }

    pub fn group_of_ino(&self, ino: InodeNumber) -> GroupNumber {
        (ino - 1) / self.sb.s_inodes_per_group
    }

    pub fn has_group_desc_csum(&self) -> bool {
        self.sb.has_group_desc_csum()
    }

    pub fn csum_seed(&self) -> u32 {
        self.sb.csum_seed()
    }

    pub fn is_rw(&self) -> bool {
        self.flags.rw
    }

    /// Fail with `ReadOnly` unless the handle was opened for writing
    pub fn require_rw(&self) -> ExtResult<()> {
        if self.flags.rw {
            Ok(())
        } else {
            Err(ExtError::ReadOnly)
        }
    }

    pub fn mark_super_dirty(&mut self) {
        self.flags.dirty = true;
        self.flags.changed = true;
    }

    pub fn mark_bb_dirty(&mut self) {
        self.flags.bb_dirty = true;
        self.flags.changed = true;
    }

    pub fn mark_ib_dirty(&mut self) {
        self.flags.ib_dirty = true;
        self.flags.changed = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.dirty
    }

    /// Use a fixed timestamp for superblock and inode times
    pub fn set_now(&mut self, now: Option<u32>) {
        self.now = now;
    }

    pub fn now(&self) -> u32 {
        self.now.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0)
        })
    }

    pub fn set_hooks(&mut self, hooks: Option<Box<dyn FsHooks>>) {
        self.hooks = hooks;
    }

    pub fn group_desc_csum_set(&mut self, group: GroupNumber) {
        if !self.sb.has_group_desc_csum() {
            return;
        }
        let csum = self.group_desc[group as usize].compute_checksum(&self.sb, group);
        self.group_desc[group as usize].checksum = csum;
    }

    pub fn group_desc_csum_verify(&self, group: GroupNumber) -> bool {
        if !self.sb.has_group_desc_csum() {
            return true;
        }
        let gd = &self.group_desc[group as usize];
        gd.checksum == gd.compute_checksum(&self.sb, group)
    }

    /// Recompute every descriptor checksum
    pub fn group_desc_csum_set_all(&mut self) {
        for group in 0..self.group_desc_count {
            self.group_desc_csum_set(group);
        }
    }

    /// Validated inode table location of `group`
    pub fn inode_table_loc(&self, group: GroupNumber) -> ExtResult<BlockNumber> {
        let table = self.group_desc[group as usize].inode_table;
        if table == 0 {
            return Err(ExtError::MissingInodeTable(group));
        }
        if table < self.sb.s_first_data_block as u64
            || table + self.inode_blocks_per_group as u64 - 1 >= self.sb.blocks_count()
        {
            return Err(ExtError::GroupDescBadInodeTable { group });
        }
        Ok(table)
    }

    pub fn read_block(&mut self, block: BlockNumber, buf: &mut [u8]) -> ExtResult<()> {
        self.io.read_blocks(block, 1, buf)
    }

    pub fn write_block(&mut self, block: BlockNumber, buf: &[u8]) -> ExtResult<()> {
        self.require_rw()?;
        self.io.write_blocks(block, 1, buf)?;
        self.flags.changed = true;
        Ok(())
    }

    pub fn zero_blocks(&mut self, block: BlockNumber, count: u64) -> ExtResult<()> {
        self.require_rw()?;
        let zero = vec![0u8; self.block_size() as usize];
        for blk in block..block + count {
            self.io.write_blocks(blk, 1, &zero)?;
        }
        self.flags.changed = true;
        Ok(())
    }

    /// The loaded block bitmap
    pub fn block_bitmap(&self) -> Option<&Bitmap> {
        self.block_map.as_ref()
    }

    pub fn inode_bitmap(&self) -> Option<&Bitmap> {
        self.inode_map.as_ref()
    }

    pub fn badblocks(&self) -> Option<&BadBlocksList> {
        self.badblocks.as_ref()
    }

    pub fn set_badblocks(&mut self, list: Option<BadBlocksList>) {
        self.badblocks = list;
    }

    pub fn channel(&mut self) -> &mut dyn IoChannel {
        self.io.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::filesystem::initialize::initialize;
    use e2kit_core::MemoryChannel;

    /// A freshly made image with its primary superblock rewritten by `edit`
    fn patched_image(edit: impl FnOnce(&mut Superblock)) -> MemoryChannel {
        let params = FsParams::default();
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();
        let mut data = channel.snapshot();
        let offset = SUPERBLOCK_OFFSET as usize;
        let mut sb = Superblock::decode(&data[offset..offset + SUPERBLOCK_SIZE], Endian::Little);
        edit(&mut sb);
        data[offset..offset + SUPERBLOCK_SIZE].copy_from_slice(&sb.encode(Endian::Little));
        MemoryChannel::from_vec(data)
    }

    fn open_patched(channel: MemoryChannel) -> ExtResult<ExtFilesystem> {
        ExtFilesystem::open(Box::new(channel), &OpenOptions::default())
    }

    #[test]
    fn test_oversized_inode_table_is_rejected() {
        // 64 KiB blocks of two 32 KiB inodes, 2^19 of them in one group
        let channel = patched_image(|sb| {
            sb.s_log_block_size = 6;
            sb.s_inode_size = 32768;
            sb.s_inodes_per_group = 524288;
            sb.s_inodes_count = 524288;
        });
        assert!(matches!(open_patched(channel), Err(ExtError::CorruptSuperblock(_))));
    }

    #[test]
    fn test_inodes_per_group_ceiling() {
        // 64 KiB blocks hold 256 inodes of 256 bytes
        let channel = patched_image(|sb| {
            sb.s_log_block_size = 6;
            sb.s_inodes_per_group = 65536 - 255;
            sb.s_inodes_count = 65536 - 255;
        });
        assert!(matches!(open_patched(channel), Err(ExtError::CorruptSuperblock(_))));
    }

    #[test]
    fn test_group_count_beyond_u32_is_rejected() {
        let channel = patched_image(|sb| {
            sb.s_feature_incompat |= EXT4_FEATURE_INCOMPAT_64BIT;
            sb.s_desc_size = 64;
            sb.set_blocks_count((1 << 32) + 2);
            sb.s_blocks_per_group = 1;
            sb.s_inodes_per_group = 8;
            sb.s_inodes_count = 8;
        });
        assert!(matches!(open_patched(channel), Err(ExtError::CorruptSuperblock(_))));
    }

    #[test]
    fn test_derived_geometry() {
        let data = patched_image(|_| {}).snapshot();
        let mut sb = Superblock::decode(&data[1024..2048], Endian::Little);
        let (groups, desc_blocks, inode_blocks) = ExtFilesystem::derive_geometry(&sb).unwrap();
        assert_eq!(groups, 1);
        assert_eq!(desc_blocks, 1);
        assert_eq!(
            inode_blocks,
            sb.s_inodes_per_group * sb.inode_size() as u32 / 1024
        );

        sb.s_feature_incompat |= EXT4_FEATURE_INCOMPAT_64BIT;
        sb.s_desc_size = 64;
        sb.set_blocks_count((1 << 32) + 2);
        sb.s_blocks_per_group = 1;
        assert!(matches!(
            ExtFilesystem::derive_geometry(&sb),
            Err(ExtError::CorruptSuperblock(_))
        ));
    }
}
