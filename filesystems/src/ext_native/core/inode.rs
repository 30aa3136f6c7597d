// Inode codec
// The first 128 bytes are decoded into named fields; anything past that
// (extra fields, in-inode extended attributes) is carried in `raw`.

use super::checksum;
use super::constants::*;
use super::endian::{le_u32, put_le_u32, Endian};
use super::structures::Superblock;
use super::types::*;

/// Offset of i_extra_isize
pub const INODE_EXTRA_ISIZE_OFFSET: usize = 0x80;
/// Offset of i_block
pub const INODE_I_BLOCK_OFFSET: usize = 0x28;
/// Size of i_block in bytes
pub const INODE_I_BLOCK_SIZE: usize = EXT4_N_BLOCKS * 4;
/// Bytes of extra space needed for i_checksum_hi
const INODE_CSUM_HI_EXTRA_END: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /* 0x00 */ pub i_mode: u16,
    /* 0x02 */ pub i_uid: u32,
    /* 0x04 */ pub i_size: u64,
    /* 0x08 */ pub i_atime: u32,
    /* 0x0C */ pub i_ctime: u32,
    /* 0x10 */ pub i_mtime: u32,
    /* 0x14 */ pub i_dtime: u32,
    /* 0x18 */ pub i_gid: u32,
    /* 0x1A */ pub i_links_count: u16,
    /* 0x1C */ pub i_blocks: u64,
    /* 0x20 */ pub i_flags: u32,
    /* 0x24 */ pub i_version: u32,
    /* 0x28 */ pub i_block: [u32; EXT4_N_BLOCKS],
    /* 0x64 */ pub i_generation: u32,
    /* 0x68 */ pub i_file_acl: u64,
    /* 0x70 */ pub i_faddr: u32,
    /* 0x7C */ pub i_checksum: u32,
    /* 0x80 */ pub i_extra_isize: u16,
    raw: Vec<u8>,
}

impl Inode {
    /// Zeroed inode of the given on-disk size
    pub fn new(inode_size: usize) -> Self {
        Self::decode(&vec![0u8; inode_size.max(EXT4_GOOD_OLD_INODE_SIZE as usize)], Endian::Little)
    }

    fn i_block_endian(mode: u16, flags: u32, blocks: u64, file_acl: u64, e: Endian) -> Endian {
        let fast_symlink = mode & S_IFMT == S_IFLNK && blocks == 0 && file_acl == 0;
        if flags & (EXT4_EXTENTS_FL | EXT4_INLINE_DATA_FL) != 0 || fast_symlink {
            Endian::Little
        } else {
            e
        }
    }

    pub fn decode(buf: &[u8], e: Endian) -> Self {
        let mode = e.u16(buf, 0x00);
        let flags = e.u32(buf, 0x20);
        let blocks = e.u32(buf, 0x1C) as u64 | (e.u16(buf, 0x74) as u64) << 32;
        let file_acl = e.u32(buf, 0x68) as u64 | (e.u16(buf, 0x76) as u64) << 32;
        let be = Self::i_block_endian(mode, flags, blocks, file_acl, e);
        let mut i_block = [0u32; EXT4_N_BLOCKS];
        for (i, slot) in i_block.iter_mut().enumerate() {
            *slot = be.u32(buf, INODE_I_BLOCK_OFFSET + i * 4);
        }
        let large = buf.len() > EXT4_GOOD_OLD_INODE_SIZE as usize;
        let extra_isize = if large { e.u16(buf, INODE_EXTRA_ISIZE_OFFSET) } else { 0 };
        let mut checksum = e.u16(buf, 0x7C) as u32;
        if large && extra_isize >= INODE_CSUM_HI_EXTRA_END {
            checksum |= (e.u16(buf, 0x82) as u32) << 16;
        }
        Self {
            i_mode: mode,
            i_uid: e.u16(buf, 0x02) as u32 | (e.u16(buf, 0x78) as u32) << 16,
            i_size: e.u32(buf, 0x04) as u64 | (e.u32(buf, 0x6C) as u64) << 32,
            i_atime: e.u32(buf, 0x08),
            i_ctime: e.u32(buf, 0x0C),
            i_mtime: e.u32(buf, 0x10),
            i_dtime: e.u32(buf, 0x14),
            i_gid: e.u16(buf, 0x18) as u32 | (e.u16(buf, 0x7A) as u32) << 16,
            i_links_count: e.u16(buf, 0x1A),
            i_blocks: blocks,
            i_flags: flags,
            i_version: e.u32(buf, 0x24),
            i_block,
            i_generation: e.u32(buf, 0x64),
            i_file_acl: file_acl,
            i_faddr: e.u32(buf, 0x70),
            i_checksum: checksum,
            i_extra_isize: extra_isize,
            raw: buf.to_vec(),
        }
    }

    /// Encode to `inode_size` bytes
    pub fn encode(&self, inode_size: usize, e: Endian) -> Vec<u8> {
        let mut b = self.raw.clone();
        b.resize(inode_size, 0);
        e.put_u16(&mut b, 0x00, self.i_mode);
        e.put_u16(&mut b, 0x02, self.i_uid as u16);
        e.put_u32(&mut b, 0x04, self.i_size as u32);
        e.put_u32(&mut b, 0x08, self.i_atime);
        e.put_u32(&mut b, 0x0C, self.i_ctime);
        e.put_u32(&mut b, 0x10, self.i_mtime);
        e.put_u32(&mut b, 0x14, self.i_dtime);
        e.put_u16(&mut b, 0x18, self.i_gid as u16);
        e.put_u16(&mut b, 0x1A, self.i_links_count);
        e.put_u32(&mut b, 0x1C, self.i_blocks as u32);
        e.put_u32(&mut b, 0x20, self.i_flags);
        e.put_u32(&mut b, 0x24, self.i_version);
        let be = Self::i_block_endian(self.i_mode, self.i_flags, self.i_blocks, self.i_file_acl, e);
        for (i, &blk) in self.i_block.iter().enumerate() {
            be.put_u32(&mut b, INODE_I_BLOCK_OFFSET + i * 4, blk);
        }
        e.put_u32(&mut b, 0x64, self.i_generation);
        e.put_u32(&mut b, 0x68, self.i_file_acl as u32);
        e.put_u32(&mut b, 0x6C, (self.i_size >> 32) as u32);
        e.put_u32(&mut b, 0x70, self.i_faddr);
        e.put_u16(&mut b, 0x74, (self.i_blocks >> 32) as u16);
        e.put_u16(&mut b, 0x76, (self.i_file_acl >> 32) as u16);
        e.put_u16(&mut b, 0x78, (self.i_uid >> 16) as u16);
        e.put_u16(&mut b, 0x7A, (self.i_gid >> 16) as u16);
        e.put_u16(&mut b, 0x7C, self.i_checksum as u16);
        if inode_size > EXT4_GOOD_OLD_INODE_SIZE as usize {
            e.put_u16(&mut b, INODE_EXTRA_ISIZE_OFFSET, self.i_extra_isize);
            if self.i_extra_isize >= INODE_CSUM_HI_EXTRA_END {
                e.put_u16(&mut b, 0x82, (self.i_checksum >> 16) as u16);
            }
        }
        b
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.i_mode & S_IFMT == S_IFREG
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.i_flags & flag != 0
    }

    pub fn has_inline_data(&self) -> bool {
        self.has_flag(EXT4_INLINE_DATA_FL)
    }

    /// i_block as the 60 raw little-endian bytes the extent tree and
    /// inline data code work with
    pub fn i_block_bytes(&self) -> [u8; INODE_I_BLOCK_SIZE] {
        let mut out = [0u8; INODE_I_BLOCK_SIZE];
        for (i, &blk) in self.i_block.iter().enumerate() {
            put_le_u32(&mut out, i * 4, blk);
        }
        out
    }

    pub fn set_i_block_bytes(&mut self, bytes: &[u8]) {
        let mut padded = [0u8; INODE_I_BLOCK_SIZE];
        let n = bytes.len().min(INODE_I_BLOCK_SIZE);
        padded[..n].copy_from_slice(&bytes[..n]);
        for (i, slot) in self.i_block.iter_mut().enumerate() {
            *slot = le_u32(&padded, i * 4);
        }
    }

    /// Bytes past the 128-byte base inode (extra fields and in-inode xattrs)
    pub fn extra_bytes(&self) -> &[u8] {
        let start = (EXT4_GOOD_OLD_INODE_SIZE as usize).min(self.raw.len());
        &self.raw[start..]
    }

    pub fn extra_bytes_mut(&mut self) -> &mut [u8] {
        let start = (EXT4_GOOD_OLD_INODE_SIZE as usize).min(self.raw.len());
        &mut self.raw[start..]
    }

    /// On-disk size this inode was decoded from
    pub fn raw_size(&self) -> usize {
        self.raw.len()
    }

    /// Grow or shrink the carried raw image to `inode_size`
    pub fn resize_raw(&mut self, inode_size: usize) {
        self.raw.resize(inode_size, 0);
    }

    /// Number of 512-byte sectors held, given the block size
    pub fn blocks_in_fs_units(&self, sb: &Superblock) -> u64 {
        if sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_HUGE_FILE) && self.has_flag(EXT4_HUGE_FILE_FL) {
            self.i_blocks
        } else {
            self.i_blocks / (sb.block_size() as u64 / 512)
        }
    }

    /// Add `num_blocks` filesystem blocks to i_blocks
    pub fn iblk_add_blocks(&mut self, sb: &Superblock, num_blocks: u64) {
        if sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_HUGE_FILE) && self.has_flag(EXT4_HUGE_FILE_FL) {
            self.i_blocks += num_blocks;
        } else {
            self.i_blocks += num_blocks * (sb.block_size() as u64 / 512);
        }
    }

    pub fn iblk_sub_blocks(&mut self, sb: &Superblock, num_blocks: u64) {
        let units = if sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_HUGE_FILE) && self.has_flag(EXT4_HUGE_FILE_FL) {
            num_blocks
        } else {
            num_blocks * (sb.block_size() as u64 / 512)
        };
        self.i_blocks = self.i_blocks.saturating_sub(units);
    }

    pub fn iblk_set(&mut self, sb: &Superblock, num_blocks: u64) {
        self.i_blocks = 0;
        self.iblk_add_blocks(sb, num_blocks);
    }

    fn has_csum_hi(&self, inode_size: usize) -> bool {
        inode_size > EXT4_GOOD_OLD_INODE_SIZE as usize && self.i_extra_isize >= INODE_CSUM_HI_EXTRA_END
    }

    /// metadata_csum checksum of this inode as inode number `ino`
    pub fn compute_checksum(&self, sb: &Superblock, ino: InodeNumber) -> u32 {
        let inode_size = sb.inode_size() as usize;
        let mut bytes = self.encode(inode_size, Endian::Little);
        bytes[0x7C] = 0;
        bytes[0x7D] = 0;
        let has_hi = self.has_csum_hi(inode_size);
        if has_hi {
            bytes[0x82] = 0;
            bytes[0x83] = 0;
        }
        let crc = checksum::inode_checksum(sb.csum_seed(), ino, self.i_generation, &bytes);
        if has_hi {
            crc
        } else {
            crc & 0xFFFF
        }
    }

    pub fn update_checksum(&mut self, sb: &Superblock, ino: InodeNumber) {
        if sb.has_metadata_csum() {
            self.i_checksum = self.compute_checksum(sb, ino);
        }
    }

    /// True when the checksum matches, checksums are off, or the inode is
    /// entirely zero (never used).
    pub fn verify_checksum(&self, sb: &Superblock, ino: InodeNumber) -> bool {
        if !sb.has_metadata_csum() {
            return true;
        }
        let inode_size = sb.inode_size() as usize;
        let stored = if self.has_csum_hi(inode_size) {
            self.i_checksum
        } else {
            self.i_checksum & 0xFFFF
        };
        if stored == self.compute_checksum(sb, ino) {
            return true;
        }
        self.encode(inode_size, Endian::Little).iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csum_sb() -> Superblock {
        let mut sb = Superblock::default();
        sb.s_rev_level = EXT4_DYNAMIC_REV;
        sb.s_inode_size = 256;
        sb.s_log_block_size = 2;
        sb.s_feature_ro_compat = EXT4_FEATURE_RO_COMPAT_METADATA_CSUM;
        sb.s_uuid = [9; 16];
        sb
    }

    #[test]
    fn test_inode_fields_split_across_lo_hi() {
        let mut inode = Inode::new(256);
        inode.i_mode = S_IFREG | 0o644;
        inode.i_size = 0x1_0000_0004;
        inode.i_uid = 0x0001_0002;
        inode.i_extra_isize = 32;
        let bytes = inode.encode(256, Endian::Little);
        assert_eq!(&bytes[0x04..0x08], &4u32.to_le_bytes());
        assert_eq!(&bytes[0x6C..0x70], &1u32.to_le_bytes());
        assert_eq!(&bytes[0x78..0x7A], &1u16.to_le_bytes());
        assert_eq!(&bytes[0x80..0x82], &32u16.to_le_bytes());

        let back = Inode::decode(&bytes, Endian::Little);
        assert_eq!(back.i_size, inode.i_size);
        assert_eq!(back.i_uid, inode.i_uid);
        assert!(back.is_reg());
    }

    #[test]
    fn test_extent_i_block_never_swapped() {
        let mut inode = Inode::new(128);
        inode.i_flags = EXT4_EXTENTS_FL;
        inode.i_block[0] = 0x0001_F30A;
        let bytes = inode.encode(128, Endian::Big);
        assert_eq!(&bytes[0x28..0x2C], &[0x0A, 0xF3, 0x01, 0x00]);
        assert_eq!(&bytes[0x20..0x24], &EXT4_EXTENTS_FL.to_be_bytes());
        assert_eq!(Inode::decode(&bytes, Endian::Big).i_block[0], 0x0001_F30A);
    }

    #[test]
    fn test_inode_checksum() {
        let sb = csum_sb();
        let mut inode = Inode::new(256);
        inode.i_mode = S_IFDIR | 0o755;
        inode.i_extra_isize = 32;
        inode.i_generation = 77;
        inode.update_checksum(&sb, 12);
        assert!(inode.verify_checksum(&sb, 12));
        assert!(!inode.verify_checksum(&sb, 13));
        inode.i_links_count = 5;
        assert!(!inode.verify_checksum(&sb, 12));

        let zero = Inode::new(256);
        assert!(zero.verify_checksum(&sb, 20));
    }

    #[test]
    fn test_i_block_bytes() {
        let mut inode = Inode::new(256);
        let payload: Vec<u8> = (0..60).collect();
        inode.set_i_block_bytes(&payload);
        assert_eq!(inode.i_block[0], u32::from_le_bytes([0, 1, 2, 3]));
        assert_eq!(&inode.i_block_bytes()[..], &payload[..]);
    }
}
