// Common types used throughout the ext2/3/4 implementation

use super::constants::*;
use serde::{Deserialize, Serialize};

pub use e2kit_core::{ExtError, Result as ExtResult};

/// Block number type (64-bit for ext4)
pub type BlockNumber = u64;

/// Inode number type
pub type InodeNumber = u32;

/// Group number type
pub type GroupNumber = u32;

/// Parameters for building a new filesystem image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsParams {
    /// Total blocks on the device
    pub blocks_count: u64,
    /// Block size in bytes (1024..=65536, power of two)
    pub block_size: u32,
    /// Blocks per group, 0 picks 8 × block_size
    pub blocks_per_group: u32,
    /// Inodes per group
    pub inodes_per_group: u32,
    /// On-disk inode size
    pub inode_size: u16,
    /// Blocks reserved after the descriptor table for online growth
    pub reserved_gdt_blocks: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    /// sparse_super2 backup groups
    pub backup_bgs: [u32; 2],
    /// First descriptor block laid out meta_bg style (meta_bg only)
    pub first_meta_bg: u32,
    pub uuid: [u8; 16],
    /// Volume label
    pub label: Option<String>,
    /// Store the image byte-swapped
    pub swap_bytes: bool,
}

impl Default for FsParams {
    fn default() -> Self {
        Self {
            blocks_count: 8192,
            block_size: 1024,
            blocks_per_group: 0,
            inodes_per_group: 128,
            inode_size: 256,
            reserved_gdt_blocks: 0,
            feature_compat: EXT4_FEATURE_COMPAT_EXT_ATTR,
            feature_incompat: EXT4_FEATURE_INCOMPAT_FILETYPE,
            feature_ro_compat: EXT4_FEATURE_RO_COMPAT_SPARSE_SUPER
                | EXT4_FEATURE_RO_COMPAT_LARGE_FILE,
            backup_bgs: [0, 0],
            first_meta_bg: 0,
            uuid: [
                0x5a, 0x1e, 0x0b, 0x4c, 0x92, 0x33, 0x4e, 0x1f,
                0x8d, 0x27, 0x61, 0x0c, 0xe4, 0x7b, 0x10, 0xa9,
            ],
            label: None,
            swap_bytes: false,
        }
    }
}

impl FsParams {
    pub fn effective_blocks_per_group(&self) -> u32 {
        if self.blocks_per_group == 0 {
            self.block_size * 8
        } else {
            self.blocks_per_group
        }
    }

    pub fn has_incompat(&self, mask: u32) -> bool {
        self.feature_incompat & mask != 0
    }

    pub fn has_ro_compat(&self, mask: u32) -> bool {
        self.feature_ro_compat & mask != 0
    }

    pub fn has_compat(&self, mask: u32) -> bool {
        self.feature_compat & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_blocks_per_group() {
        let params = FsParams::default();
        assert_eq!(params.effective_blocks_per_group(), 8192);

        let params = FsParams {
            block_size: 4096,
            blocks_per_group: 1024,
            ..Default::default()
        };
        assert_eq!(params.effective_blocks_per_group(), 1024);
    }
}
