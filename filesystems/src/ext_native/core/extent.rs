// Extent tree node codec

use super::constants::*;
use super::endian::{le_u16, le_u32, put_le_u16, put_le_u32};
use super::types::*;

pub const EXTENT_HEADER_SIZE: usize = 12;
pub const EXTENT_ENTRY_SIZE: usize = 12;
/// Extents with ee_len above this are uninitialized
pub const EXT_INIT_MAX_LEN: u16 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    pub eh_magic: u16,
    pub eh_entries: u16,
    pub eh_max: u16,
    pub eh_depth: u16,
    pub eh_generation: u32,
}

impl ExtentHeader {
    pub fn new_leaf(max_entries: u16) -> Self {
        Self {
            eh_magic: EXT4_EXTENT_MAGIC,
            eh_entries: 0,
            eh_max: max_entries,
            eh_depth: 0,
            eh_generation: 0,
        }
    }

    pub fn read(buf: &[u8]) -> Self {
        Self {
            eh_magic: le_u16(buf, 0),
            eh_entries: le_u16(buf, 2),
            eh_max: le_u16(buf, 4),
            eh_depth: le_u16(buf, 6),
            eh_generation: le_u32(buf, 8),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        put_le_u16(buf, 0, self.eh_magic);
        put_le_u16(buf, 2, self.eh_entries);
        put_le_u16(buf, 4, self.eh_max);
        put_le_u16(buf, 6, self.eh_depth);
        put_le_u32(buf, 8, self.eh_generation);
    }

    /// Sanity check against the space the node lives in
    pub fn validate(&self, ino: InodeNumber, node_size: usize) -> ExtResult<()> {
        let capacity = (node_size - EXTENT_HEADER_SIZE) / EXTENT_ENTRY_SIZE;
        let detail = if self.eh_magic != EXT4_EXTENT_MAGIC {
            format!("bad magic 0x{:04X}", self.eh_magic)
        } else if self.eh_max as usize > capacity {
            format!("eh_max {} exceeds node capacity {}", self.eh_max, capacity)
        } else if self.eh_entries > self.eh_max {
            format!("{} entries with eh_max {}", self.eh_entries, self.eh_max)
        } else {
            return Ok(());
        };
        Err(ExtError::ExtentCorrupted { ino, detail })
    }
}

/// Leaf entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub ee_block: u32,
    pub ee_len: u16,
    pub ee_start: BlockNumber,
}

impl Extent {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            ee_block: le_u32(buf, 0),
            ee_len: le_u16(buf, 4),
            ee_start: (le_u16(buf, 6) as u64) << 32 | le_u32(buf, 8) as u64,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        put_le_u32(buf, 0, self.ee_block);
        put_le_u16(buf, 4, self.ee_len);
        put_le_u16(buf, 6, (self.ee_start >> 32) as u16);
        put_le_u32(buf, 8, self.ee_start as u32);
    }

    /// Number of blocks covered, uninitialized or not
    pub fn len(&self) -> u32 {
        if self.ee_len > EXT_INIT_MAX_LEN {
            (self.ee_len - EXT_INIT_MAX_LEN) as u32
        } else {
            self.ee_len as u32
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interior entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentIndex {
    pub ei_block: u32,
    pub ei_leaf: BlockNumber,
}

impl ExtentIndex {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            ei_block: le_u32(buf, 0),
            ei_leaf: (le_u16(buf, 8) as u64) << 32 | le_u32(buf, 4) as u64,
        }
    }
}

/// i_block holding a single-extent leaf mapping `count` blocks at `start`
/// to logical block 0
pub fn single_extent_i_block(start: BlockNumber, count: u16) -> [u8; EXT4_N_BLOCKS * 4] {
    let mut buf = [0u8; EXT4_N_BLOCKS * 4];
    let max = ((buf.len() - EXTENT_HEADER_SIZE) / EXTENT_ENTRY_SIZE) as u16;
    let mut header = ExtentHeader::new_leaf(max);
    header.eh_entries = 1;
    header.write(&mut buf);
    Extent {
        ee_block: 0,
        ee_len: count,
        ee_start: start,
    }
    .write(&mut buf[EXTENT_HEADER_SIZE..]);
    buf
}
