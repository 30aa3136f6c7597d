// Superblock and block group descriptor codecs
// Field offsets must match the on-disk format exactly.

use super::checksum;
use super::constants::*;
use super::endian::Endian;
use super::types::*;
use static_assertions::const_assert;

const_assert!(checksum::SUPERBLOCK_CSUM_OFFSET + 4 == SUPERBLOCK_SIZE);
const_assert!(checksum::GROUP_DESC_CSUM_OFFSET + 2 == EXT4_MIN_DESC_SIZE as usize);

/// Parsed superblock.
///
/// Only the fields this library reads or writes are named; every other byte
/// is kept in `raw` and written back untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /* 0x000 */ pub s_inodes_count: u32,
    /* 0x004 */ pub s_blocks_count_lo: u32,
    /* 0x008 */ pub s_r_blocks_count_lo: u32,
    /* 0x00C */ pub s_free_blocks_count_lo: u32,
    /* 0x010 */ pub s_free_inodes_count: u32,
    /* 0x014 */ pub s_first_data_block: u32,
    /* 0x018 */ pub s_log_block_size: u32,
    /* 0x01C */ pub s_log_cluster_size: u32,
    /* 0x020 */ pub s_blocks_per_group: u32,
    /* 0x024 */ pub s_clusters_per_group: u32,
    /* 0x028 */ pub s_inodes_per_group: u32,
    /* 0x02C */ pub s_mtime: u32,
    /* 0x030 */ pub s_wtime: u32,
    /* 0x034 */ pub s_mnt_count: u16,
    /* 0x036 */ pub s_max_mnt_count: u16,
    /* 0x038 */ pub s_magic: u16,
    /* 0x03A */ pub s_state: u16,
    /* 0x03C */ pub s_errors: u16,
    /* 0x03E */ pub s_minor_rev_level: u16,
    /* 0x040 */ pub s_lastcheck: u32,
    /* 0x044 */ pub s_checkinterval: u32,
    /* 0x048 */ pub s_creator_os: u32,
    /* 0x04C */ pub s_rev_level: u32,
    /* 0x050 */ pub s_def_resuid: u16,
    /* 0x052 */ pub s_def_resgid: u16,
    /* 0x054 */ pub s_first_ino: u32,
    /* 0x058 */ pub s_inode_size: u16,
    /* 0x05A */ pub s_block_group_nr: u16,
    /* 0x05C */ pub s_feature_compat: u32,
    /* 0x060 */ pub s_feature_incompat: u32,
    /* 0x064 */ pub s_feature_ro_compat: u32,
    /* 0x068 */ pub s_uuid: [u8; 16],
    /* 0x078 */ pub s_volume_name: [u8; 16],
    /* 0x0CE */ pub s_reserved_gdt_blocks: u16,
    /* 0x0E0 */ pub s_journal_inum: u32,
    /* 0x0FE */ pub s_desc_size: u16,
    /* 0x104 */ pub s_first_meta_bg: u32,
    /* 0x108 */ pub s_mkfs_time: u32,
    /* 0x150 */ pub s_blocks_count_hi: u32,
    /* 0x154 */ pub s_r_blocks_count_hi: u32,
    /* 0x158 */ pub s_free_blocks_count_hi: u32,
    /* 0x15C */ pub s_min_extra_isize: u16,
    /* 0x15E */ pub s_want_extra_isize: u16,
    /* 0x160 */ pub s_flags: u32,
    /* 0x174 */ pub s_log_groups_per_flex: u8,
    /* 0x175 */ pub s_checksum_type: u8,
    /* 0x24C */ pub s_backup_bgs: [u32; 2],
    /* 0x270 */ pub s_checksum_seed: u32,
    /* 0x3FC */ pub s_checksum: u32,
    raw: Vec<u8>,
}

impl Default for Superblock {
    fn default() -> Self {
        Self::decode(&[0u8; SUPERBLOCK_SIZE], Endian::Little)
    }
}

impl Superblock {
    /// Decode from the first 1024 bytes of `buf`
    pub fn decode(buf: &[u8], e: Endian) -> Self {
        let b = &buf[..SUPERBLOCK_SIZE];
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[0x68..0x78]);
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&b[0x78..0x88]);
        Self {
            s_inodes_count: e.u32(b, 0x000),
            s_blocks_count_lo: e.u32(b, 0x004),
            s_r_blocks_count_lo: e.u32(b, 0x008),
            s_free_blocks_count_lo: e.u32(b, 0x00C),
            s_free_inodes_count: e.u32(b, 0x010),
            s_first_data_block: e.u32(b, 0x014),
            s_log_block_size: e.u32(b, 0x018),
            s_log_cluster_size: e.u32(b, 0x01C),
            s_blocks_per_group: e.u32(b, 0x020),
            s_clusters_per_group: e.u32(b, 0x024),
            s_inodes_per_group: e.u32(b, 0x028),
            s_mtime: e.u32(b, 0x02C),
            s_wtime: e.u32(b, 0x030),
            s_mnt_count: e.u16(b, 0x034),
            s_max_mnt_count: e.u16(b, 0x036),
            s_magic: e.u16(b, 0x038),
            s_state: e.u16(b, 0x03A),
            s_errors: e.u16(b, 0x03C),
            s_minor_rev_level: e.u16(b, 0x03E),
            s_lastcheck: e.u32(b, 0x040),
            s_checkinterval: e.u32(b, 0x044),
            s_creator_os: e.u32(b, 0x048),
            s_rev_level: e.u32(b, 0x04C),
            s_def_resuid: e.u16(b, 0x050),
            s_def_resgid: e.u16(b, 0x052),
            s_first_ino: e.u32(b, 0x054),
            s_inode_size: e.u16(b, 0x058),
            s_block_group_nr: e.u16(b, 0x05A),
            s_feature_compat: e.u32(b, 0x05C),
            s_feature_incompat: e.u32(b, 0x060),
            s_feature_ro_compat: e.u32(b, 0x064),
            s_uuid: uuid,
            s_volume_name: volume_name,
            s_reserved_gdt_blocks: e.u16(b, 0x0CE),
            s_journal_inum: e.u32(b, 0x0E0),
            s_desc_size: e.u16(b, 0x0FE),
            s_first_meta_bg: e.u32(b, 0x104),
            s_mkfs_time: e.u32(b, 0x108),
            s_blocks_count_hi: e.u32(b, 0x150),
            s_r_blocks_count_hi: e.u32(b, 0x154),
            s_free_blocks_count_hi: e.u32(b, 0x158),
            s_min_extra_isize: e.u16(b, 0x15C),
            s_want_extra_isize: e.u16(b, 0x15E),
            s_flags: e.u32(b, 0x160),
            s_log_groups_per_flex: b[0x174],
            s_checksum_type: b[0x175],
            s_backup_bgs: [e.u32(b, 0x24C), e.u32(b, 0x250)],
            s_checksum_seed: e.u32(b, 0x270),
            s_checksum: e.u32(b, 0x3FC),
            raw: b.to_vec(),
        }
    }

    /// Encode to the on-disk 1024-byte representation
    pub fn encode(&self, e: Endian) -> Vec<u8> {
        let mut b = self.raw.clone();
        b.resize(SUPERBLOCK_SIZE, 0);
        e.put_u32(&mut b, 0x000, self.s_inodes_count);
        e.put_u32(&mut b, 0x004, self.s_blocks_count_lo);
        e.put_u32(&mut b, 0x008, self.s_r_blocks_count_lo);
        e.put_u32(&mut b, 0x00C, self.s_free_blocks_count_lo);
        e.put_u32(&mut b, 0x010, self.s_free_inodes_count);
        e.put_u32(&mut b, 0x014, self.s_first_data_block);
        e.put_u32(&mut b, 0x018, self.s_log_block_size);
        e.put_u32(&mut b, 0x01C, self.s_log_cluster_size);
        e.put_u32(&mut b, 0x020, self.s_blocks_per_group);
        e.put_u32(&mut b, 0x024, self.s_clusters_per_group);
        e.put_u32(&mut b, 0x028, self.s_inodes_per_group);
        e.put_u32(&mut b, 0x02C, self.s_mtime);
        e.put_u32(&mut b, 0x030, self.s_wtime);
        e.put_u16(&mut b, 0x034, self.s_mnt_count);
        e.put_u16(&mut b, 0x036, self.s_max_mnt_count);
        e.put_u16(&mut b, 0x038, self.s_magic);
        e.put_u16(&mut b, 0x03A, self.s_state);
        e.put_u16(&mut b, 0x03C, self.s_errors);
        e.put_u16(&mut b, 0x03E, self.s_minor_rev_level);
        e.put_u32(&mut b, 0x040, self.s_lastcheck);
        e.put_u32(&mut b, 0x044, self.s_checkinterval);
        e.put_u32(&mut b, 0x048, self.s_creator_os);
        e.put_u32(&mut b, 0x04C, self.s_rev_level);
        e.put_u16(&mut b, 0x050, self.s_def_resuid);
        e.put_u16(&mut b, 0x052, self.s_def_resgid);
        e.put_u32(&mut b, 0x054, self.s_first_ino);
        e.put_u16(&mut b, 0x058, self.s_inode_size);
        e.put_u16(&mut b, 0x05A, self.s_block_group_nr);
        e.put_u32(&mut b, 0x05C, self.s_feature_compat);
        e.put_u32(&mut b, 0x060, self.s_feature_incompat);
        e.put_u32(&mut b, 0x064, self.s_feature_ro_compat);
        b[0x68..0x78].copy_from_slice(&self.s_uuid);
        b[0x78..0x88].copy_from_slice(&self.s_volume_name);
        e.put_u16(&mut b, 0x0CE, self.s_reserved_gdt_blocks);
        e.put_u32(&mut b, 0x0E0, self.s_journal_inum);
        e.put_u16(&mut b, 0x0FE, self.s_desc_size);
        e.put_u32(&mut b, 0x104, self.s_first_meta_bg);
        e.put_u32(&mut b, 0x108, self.s_mkfs_time);
        e.put_u32(&mut b, 0x150, self.s_blocks_count_hi);
        e.put_u32(&mut b, 0x154, self.s_r_blocks_count_hi);
        e.put_u32(&mut b, 0x158, self.s_free_blocks_count_hi);
        e.put_u16(&mut b, 0x15C, self.s_min_extra_isize);
        e.put_u16(&mut b, 0x15E, self.s_want_extra_isize);
        e.put_u32(&mut b, 0x160, self.s_flags);
        b[0x174] = self.s_log_groups_per_flex;
        b[0x175] = self.s_checksum_type;
        e.put_u32(&mut b, 0x24C, self.s_backup_bgs[0]);
        e.put_u32(&mut b, 0x250, self.s_backup_bgs[1]);
        e.put_u32(&mut b, 0x270, self.s_checksum_seed);
        e.put_u32(&mut b, 0x3FC, self.s_checksum);
        b
    }

    pub fn has_compat(&self, mask: u32) -> bool {
        self.s_feature_compat & mask != 0
    }

    pub fn has_incompat(&self, mask: u32) -> bool {
        self.s_feature_incompat & mask != 0
    }

    pub fn has_ro_compat(&self, mask: u32) -> bool {
        self.s_feature_ro_compat & mask != 0
    }

    pub fn is_64bit(&self) -> bool {
        self.has_incompat(EXT4_FEATURE_INCOMPAT_64BIT)
    }

    pub fn has_metadata_csum(&self) -> bool {
        self.has_ro_compat(EXT4_FEATURE_RO_COMPAT_METADATA_CSUM)
    }

    /// gdt_csum or metadata_csum: group descriptors carry checksums and
    /// the uninit flags are meaningful
    pub fn has_group_desc_csum(&self) -> bool {
        self.has_ro_compat(EXT4_FEATURE_RO_COMPAT_GDT_CSUM) || self.has_metadata_csum()
    }

    pub fn block_size(&self) -> u32 {
        EXT4_MIN_BLOCK_SIZE << self.s_log_block_size
    }

    pub fn blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { self.s_blocks_count_hi as u64 } else { 0 };
        (hi << 32) | self.s_blocks_count_lo as u64
    }

    pub fn set_blocks_count(&mut self, count: u64) {
        self.s_blocks_count_lo = count as u32;
        if self.is_64bit() {
            self.s_blocks_count_hi = (count >> 32) as u32;
        }
    }

    pub fn r_blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { self.s_r_blocks_count_hi as u64 } else { 0 };
        (hi << 32) | self.s_r_blocks_count_lo as u64
    }

    pub fn set_r_blocks_count(&mut self, count: u64) {
        self.s_r_blocks_count_lo = count as u32;
        if self.is_64bit() {
            self.s_r_blocks_count_hi = (count >> 32) as u32;
        }
    }

    pub fn free_blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { self.s_free_blocks_count_hi as u64 } else { 0 };
        (hi << 32) | self.s_free_blocks_count_lo as u64
    }

    pub fn set_free_blocks_count(&mut self, count: u64) {
        self.s_free_blocks_count_lo = count as u32;
        if self.is_64bit() {
            self.s_free_blocks_count_hi = (count >> 32) as u32;
        }
    }

    pub fn inode_size(&self) -> u16 {
        if self.s_rev_level == EXT4_GOOD_OLD_REV {
            EXT4_GOOD_OLD_INODE_SIZE
        } else {
            self.s_inode_size
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level == EXT4_GOOD_OLD_REV {
            EXT4_GOOD_OLD_FIRST_INO
        } else {
            self.s_first_ino
        }
    }

    pub fn desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.s_desc_size
        } else {
            EXT4_MIN_DESC_SIZE
        }
    }

    /// Seed shared by all metadata_csum checksums
    pub fn csum_seed(&self) -> u32 {
        let explicit = if self.has_incompat(EXT4_FEATURE_INCOMPAT_CSUM_SEED) {
            Some(self.s_checksum_seed)
        } else {
            None
        };
        checksum::csum_seed(&self.s_uuid, explicit)
    }

    pub fn compute_checksum(&self) -> u32 {
        checksum::superblock_checksum(&self.encode(Endian::Little))
    }

    pub fn update_checksum(&mut self) {
        if self.has_metadata_csum() {
            self.s_checksum = self.compute_checksum();
        }
    }

    pub fn verify_checksum(&self) -> bool {
        !self.has_metadata_csum() || self.s_checksum == self.compute_checksum()
    }

    pub fn uuid_hex(&self) -> String {
        hex::encode(self.s_uuid)
    }
}

/// Block group descriptor with the lo/hi halves already combined
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDesc {
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
    pub exclude_bitmap: BlockNumber,
    pub block_bitmap_csum: u32,
    pub inode_bitmap_csum: u32,
    pub itable_unused: u32,
    pub checksum: u16,
    /// Bytes past the 64-byte layout when s_desc_size is larger
    extra: Vec<u8>,
}

impl GroupDesc {
    pub fn decode(buf: &[u8], desc_size: usize, e: Endian) -> Self {
        let lo = |off| e.u32(buf, off) as u64;
        let mut gd = Self {
            block_bitmap: lo(0x00),
            inode_bitmap: lo(0x04),
            inode_table: lo(0x08),
            free_blocks_count: e.u16(buf, 0x0C) as u32,
            free_inodes_count: e.u16(buf, 0x0E) as u32,
            used_dirs_count: e.u16(buf, 0x10) as u32,
            flags: e.u16(buf, 0x12),
            exclude_bitmap: lo(0x14),
            block_bitmap_csum: e.u16(buf, 0x18) as u32,
            inode_bitmap_csum: e.u16(buf, 0x1A) as u32,
            itable_unused: e.u16(buf, 0x1C) as u32,
            checksum: e.u16(buf, 0x1E),
            extra: Vec::new(),
        };
        if desc_size >= EXT4_MIN_DESC_SIZE_64BIT as usize {
            gd.block_bitmap |= (e.u32(buf, 0x20) as u64) << 32;
            gd.inode_bitmap |= (e.u32(buf, 0x24) as u64) << 32;
            gd.inode_table |= (e.u32(buf, 0x28) as u64) << 32;
            gd.free_blocks_count |= (e.u16(buf, 0x2C) as u32) << 16;
            gd.free_inodes_count |= (e.u16(buf, 0x2E) as u32) << 16;
            gd.used_dirs_count |= (e.u16(buf, 0x30) as u32) << 16;
            gd.itable_unused |= (e.u16(buf, 0x32) as u32) << 16;
            gd.exclude_bitmap |= (e.u32(buf, 0x34) as u64) << 32;
            gd.block_bitmap_csum |= (e.u16(buf, 0x38) as u32) << 16;
            gd.inode_bitmap_csum |= (e.u16(buf, 0x3A) as u32) << 16;
            gd.extra = buf[0x3C..desc_size].to_vec();
        }
        gd
    }

    /// Encode into `buf[..desc_size]`
    pub fn encode(&self, buf: &mut [u8], desc_size: usize, e: Endian) {
        e.put_u32(buf, 0x00, self.block_bitmap as u32);
        e.put_u32(buf, 0x04, self.inode_bitmap as u32);
        e.put_u32(buf, 0x08, self.inode_table as u32);
        e.put_u16(buf, 0x0C, self.free_blocks_count as u16);
        e.put_u16(buf, 0x0E, self.free_inodes_count as u16);
        e.put_u16(buf, 0x10, self.used_dirs_count as u16);
        e.put_u16(buf, 0x12, self.flags);
        e.put_u32(buf, 0x14, self.exclude_bitmap as u32);
        e.put_u16(buf, 0x18, self.block_bitmap_csum as u16);
        e.put_u16(buf, 0x1A, self.inode_bitmap_csum as u16);
        e.put_u16(buf, 0x1C, self.itable_unused as u16);
        e.put_u16(buf, 0x1E, self.checksum);
        if desc_size >= EXT4_MIN_DESC_SIZE_64BIT as usize {
            e.put_u32(buf, 0x20, (self.block_bitmap >> 32) as u32);
            e.put_u32(buf, 0x24, (self.inode_bitmap >> 32) as u32);
            e.put_u32(buf, 0x28, (self.inode_table >> 32) as u32);
            e.put_u16(buf, 0x2C, (self.free_blocks_count >> 16) as u16);
            e.put_u16(buf, 0x2E, (self.free_inodes_count >> 16) as u16);
            e.put_u16(buf, 0x30, (self.used_dirs_count >> 16) as u16);
            e.put_u16(buf, 0x32, (self.itable_unused >> 16) as u16);
            e.put_u32(buf, 0x34, (self.exclude_bitmap >> 32) as u32);
            e.put_u16(buf, 0x38, (self.block_bitmap_csum >> 16) as u16);
            e.put_u16(buf, 0x3A, (self.inode_bitmap_csum >> 16) as u16);
            let extra = &mut buf[0x3C..desc_size];
            extra.fill(0);
            let n = self.extra.len().min(extra.len());
            extra[..n].copy_from_slice(&self.extra[..n]);
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    /// Checksum of this descriptor for `group`, or 0 when the filesystem
    /// carries no descriptor checksums
    pub fn compute_checksum(&self, sb: &Superblock, group: GroupNumber) -> u16 {
        let desc_size = sb.desc_size() as usize;
        let mut bytes = vec![0u8; desc_size];
        self.encode(&mut bytes, desc_size, Endian::Little);
        if sb.has_metadata_csum() {
            checksum::group_desc_checksum_crc32c(sb.csum_seed(), group, &bytes)
        } else if sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_GDT_CSUM) {
            checksum::group_desc_checksum_crc16(&sb.s_uuid, group, &bytes)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> Superblock {
        let mut sb = Superblock::default();
        sb.s_magic = EXT4_SUPER_MAGIC;
        sb.s_inodes_count = 2048;
        sb.s_blocks_count_lo = 8192;
        sb.s_log_block_size = 2;
        sb.s_rev_level = EXT4_DYNAMIC_REV;
        sb.s_inode_size = 256;
        sb.s_uuid = [0x42; 16];
        sb
    }

    #[test]
    fn test_superblock_encode_offsets() {
        let sb = sample_superblock();
        let bytes = sb.encode(Endian::Little);
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(&bytes[0x38..0x3A], &[0x53, 0xEF]);
        assert_eq!(&bytes[0x04..0x08], &8192u32.to_le_bytes());
        assert_eq!(sb.block_size(), 4096);

        let swapped = sb.encode(Endian::Big);
        assert_eq!(&swapped[0x38..0x3A], &[0xEF, 0x53]);
        let back = Superblock::decode(&swapped, Endian::Big);
        assert_eq!(back.s_magic, EXT4_SUPER_MAGIC);
        assert_eq!(back.s_inodes_count, 2048);
        assert_eq!(back.encode(Endian::Big), swapped);
    }

    #[test]
    fn test_superblock_preserves_unknown_bytes() {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        raw[0x200] = 0x77; // s_mount_opts
        raw[0x38] = 0x53;
        raw[0x39] = 0xEF;
        let sb = Superblock::decode(&raw, Endian::Little);
        assert_eq!(sb.encode(Endian::Little), raw);
    }

    #[test]
    fn test_superblock_checksum() {
        let mut sb = sample_superblock();
        sb.s_feature_ro_compat |= EXT4_FEATURE_RO_COMPAT_METADATA_CSUM;
        sb.update_checksum();
        assert!(sb.verify_checksum());
        sb.s_free_inodes_count += 1;
        assert!(!sb.verify_checksum());
    }

    #[test]
    fn test_64bit_counts() {
        let mut sb = sample_superblock();
        sb.set_blocks_count(1 << 33);
        assert_eq!(sb.blocks_count(), 0);
        sb.s_feature_incompat |= EXT4_FEATURE_INCOMPAT_64BIT;
        sb.set_blocks_count(1 << 33);
        assert_eq!(sb.blocks_count(), 1 << 33);
    }

    #[test]
    fn test_group_desc_32_and_64() {
        let gd = GroupDesc {
            block_bitmap: 0x1_0000_0010,
            inode_bitmap: 17,
            inode_table: 18,
            free_blocks_count: 0x12345,
            free_inodes_count: 100,
            flags: EXT4_BG_INODE_ZEROED,
            ..Default::default()
        };
        let mut buf = vec![0u8; 64];
        gd.encode(&mut buf, 64, Endian::Little);
        let back = GroupDesc::decode(&buf, 64, Endian::Little);
        assert_eq!(back.block_bitmap, gd.block_bitmap);
        assert_eq!(back.free_blocks_count, 0x12345);
        assert_eq!(back.flags, EXT4_BG_INODE_ZEROED);

        let mut small = vec![0u8; 32];
        gd.encode(&mut small, 32, Endian::Little);
        let back = GroupDesc::decode(&small, 32, Endian::Little);
        assert_eq!(back.block_bitmap, 0x10);
        assert_eq!(back.free_blocks_count, 0x2345);
    }
}
