// On-disk constants for the ext2/3/4 family

// Magic numbers
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;
pub const EXT4_XATTR_MAGIC: u32 = 0xEA02_0000;

// Superblock placement
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;

// Block sizes
pub const EXT4_MIN_BLOCK_LOG_SIZE: u32 = 10;
pub const EXT4_MAX_BLOCK_LOG_SIZE: u32 = 16;
pub const EXT4_MIN_BLOCK_SIZE: u32 = 1 << EXT4_MIN_BLOCK_LOG_SIZE;
pub const EXT4_MAX_BLOCK_SIZE: u32 = 1 << EXT4_MAX_BLOCK_LOG_SIZE;

// Inode and descriptor sizes
pub const EXT4_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT4_GOOD_OLD_FIRST_INO: u32 = 11;
/// i_extra_isize of a freshly written large inode
pub const EXT4_INODE_LARGE_EXTRA_ISIZE: u16 = 32;
pub const EXT4_MIN_DESC_SIZE: u16 = 32;
pub const EXT4_MIN_DESC_SIZE_64BIT: u16 = 64;
pub const EXT4_MAX_DESC_SIZE: u16 = 1024;

// Special inode numbers
pub const EXT4_BAD_INO: u32 = 1;
pub const EXT4_ROOT_INO: u32 = 2;
pub const EXT4_RESIZE_INO: u32 = 7;
pub const EXT4_JOURNAL_INO: u32 = 8;

// i_block layout
pub const EXT4_NDIR_BLOCKS: usize = 12;
pub const EXT4_IND_BLOCK: usize = 12;
pub const EXT4_DIND_BLOCK: usize = 13;
pub const EXT4_TIND_BLOCK: usize = 14;
pub const EXT4_N_BLOCKS: usize = 15;

// Feature flags - Compatible
pub const EXT4_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const EXT4_FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;
pub const EXT4_FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;
pub const EXT4_FEATURE_COMPAT_DIR_INDEX: u32 = 0x0020;
pub const EXT4_FEATURE_COMPAT_SPARSE_SUPER2: u32 = 0x0200;

// Feature flags - Incompatible
pub const EXT4_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const EXT4_FEATURE_INCOMPAT_RECOVER: u32 = 0x0004;
pub const EXT4_FEATURE_INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const EXT4_FEATURE_INCOMPAT_META_BG: u32 = 0x0010;
pub const EXT4_FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
pub const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const EXT4_FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const EXT4_FEATURE_INCOMPAT_CSUM_SEED: u32 = 0x2000;
pub const EXT4_FEATURE_INCOMPAT_INLINE_DATA: u32 = 0x8000;

// Feature flags - Read-only compatible
pub const EXT4_FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const EXT4_FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const EXT4_FEATURE_RO_COMPAT_HUGE_FILE: u32 = 0x0008;
pub const EXT4_FEATURE_RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const EXT4_FEATURE_RO_COMPAT_DIR_NLINK: u32 = 0x0020;
pub const EXT4_FEATURE_RO_COMPAT_EXTRA_ISIZE: u32 = 0x0040;
pub const EXT4_FEATURE_RO_COMPAT_BIGALLOC: u32 = 0x0200;
pub const EXT4_FEATURE_RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

// Features this library knows how to handle
pub const EXT4_LIB_FEATURE_INCOMPAT_SUPP: u32 = EXT4_FEATURE_INCOMPAT_FILETYPE
    | EXT4_FEATURE_INCOMPAT_RECOVER
    | EXT4_FEATURE_INCOMPAT_JOURNAL_DEV
    | EXT4_FEATURE_INCOMPAT_META_BG
    | EXT4_FEATURE_INCOMPAT_EXTENTS
    | EXT4_FEATURE_INCOMPAT_64BIT
    | EXT4_FEATURE_INCOMPAT_FLEX_BG
    | EXT4_FEATURE_INCOMPAT_CSUM_SEED
    | EXT4_FEATURE_INCOMPAT_INLINE_DATA;

// Filesystem states
pub const EXT4_VALID_FS: u16 = 0x0001;
pub const EXT4_ERROR_FS: u16 = 0x0002;

// Revision levels
pub const EXT4_GOOD_OLD_REV: u32 = 0;
pub const EXT4_DYNAMIC_REV: u32 = 1;
pub const EXT4_MAX_SUPP_REV: u32 = EXT4_DYNAMIC_REV;

// Checksum types
pub const EXT4_CRC32C_CHKSUM: u8 = 1;

// Inode flags
pub const EXT4_INDEX_FL: u32 = 0x0000_1000;
pub const EXT4_HUGE_FILE_FL: u32 = 0x0004_0000;
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

// File types for directory entries
pub const EXT4_FT_UNKNOWN: u8 = 0;
pub const EXT4_FT_REG_FILE: u8 = 1;
pub const EXT4_FT_DIR: u8 = 2;
pub const EXT4_FT_CHRDEV: u8 = 3;
pub const EXT4_FT_BLKDEV: u8 = 4;
pub const EXT4_FT_FIFO: u8 = 5;
pub const EXT4_FT_SOCK: u8 = 6;
pub const EXT4_FT_SYMLINK: u8 = 7;
pub const EXT4_FT_MAX: u8 = 8;
/// file_type byte of the fake entry holding a directory block checksum
pub const EXT4_FT_DIR_CSUM: u8 = 0xDE;

// Block group flags
pub const EXT4_BG_INODE_UNINIT: u16 = 0x0001;
pub const EXT4_BG_BLOCK_UNINIT: u16 = 0x0002;
pub const EXT4_BG_INODE_ZEROED: u16 = 0x0004;

// Inode mode bits
pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

// Directory entry geometry
pub const EXT4_DIR_ENTRY_HEADER_LEN: usize = 8;
pub const EXT4_DIR_ROUND: usize = 3;
pub const EXT4_NAME_LEN: usize = 255;
pub const EXT4_DIR_TAIL_SIZE: usize = 12;
pub const EXT4_MAX_REC_LEN: u32 = (1 << 16) - 1;

// Inline data
pub const EXT4_MIN_INLINE_DATA_SIZE: usize = 60;
pub const EXT4_INLINE_DATA_DOTDOT_SIZE: usize = 4;
pub const EXT4_XATTR_INDEX_SYSTEM: u8 = 7;
pub const EXT4_XATTR_SYSTEM_DATA: &str = "data";

// Extended attribute entry geometry
pub const EXT4_XATTR_ENTRY_HEADER_LEN: usize = 16;
pub const EXT4_XATTR_PAD: usize = 4;
pub const EXT4_XATTR_IBODY_HEADER_LEN: usize = 4;

// Inode scanning
pub const EXT4_DEFAULT_SCAN_BUFFER_BLOCKS: u32 = 8;
/// Backup superblock numbers are stored in a 16 bit field
pub const EXT4_MAX_BLOCK_GROUP_NR: u32 = 65535;
/// Ceiling on inodes per group, less one block's worth of inodes
pub const EXT4_MAX_INODES_PER_GROUP: u32 = 65536;
