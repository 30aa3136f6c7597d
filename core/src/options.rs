use serde::{Deserialize, Serialize};

/// How a filesystem handle is opened and later flushed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Allow mutation; every write path fails with `ReadOnly` otherwise
    pub read_write: bool,
    /// Open from the superblock at this block instead of the primary one
    pub superblock: Option<u64>,
    /// Block size to assume when `superblock` is given
    pub block_size: Option<u32>,
    /// Log superblock/descriptor checksum mismatches instead of failing
    pub ignore_csum_errors: bool,
    /// Only write the primary superblock and group 0 descriptors on flush
    pub master_sb_only: bool,
    /// Write superblocks on flush but leave descriptor tables alone
    pub super_only: bool,
    /// Treat the image as byte-swapped (big-endian)
    pub swap_bytes: bool,
    /// Number of inodes cached by the handle, 0 disables caching
    pub inode_cache_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read_write: false,
            superblock: None,
            block_size: None,
            ignore_csum_errors: false,
            master_sb_only: false,
            super_only: false,
            swap_bytes: false,
            inode_cache_size: 4,
        }
    }
}

impl OpenOptions {
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Self::default()
        }
    }
}
