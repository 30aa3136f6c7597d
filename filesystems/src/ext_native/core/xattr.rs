// Extended attributes stored in the inode body, after i_extra_isize
//
// Region layout: 4-byte magic, packed entries terminated by a zero u32,
// values packed from the end of the region downwards. Value offsets are
// relative to the first entry.

use super::constants::*;
use super::endian::{le_u16, le_u32, put_le_u16, put_le_u32};
use super::inode::Inode;
use super::types::*;

const NAME_HASH_SHIFT: u32 = 5;
const VALUE_HASH_SHIFT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub name_index: u8,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl XattrEntry {
    pub fn new(name_index: u8, name: &str, value: Vec<u8>) -> Self {
        Self {
            name_index,
            name: name.as_bytes().to_vec(),
            value,
        }
    }

    pub fn matches(&self, name_index: u8, name: &str) -> bool {
        self.name_index == name_index && self.name == name.as_bytes()
    }

    /// Bytes of the entry record (without the value)
    pub fn entry_len(&self) -> usize {
        entry_len(self.name.len())
    }

    /// Bytes the value occupies once padded
    pub fn value_len(&self) -> usize {
        value_len(self.value.len())
    }

    pub fn hash(&self) -> u32 {
        xattr_hash(&self.name, &self.value)
    }
}

pub fn entry_len(name_len: usize) -> usize {
    (name_len + EXT4_XATTR_ENTRY_HEADER_LEN + EXT4_XATTR_PAD - 1) & !(EXT4_XATTR_PAD - 1)
}

pub fn value_len(size: usize) -> usize {
    (size + EXT4_XATTR_PAD - 1) & !(EXT4_XATTR_PAD - 1)
}

/// Entry hash over the name, then the value as padded little-endian words
pub fn xattr_hash(name: &[u8], value: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &c in name {
        hash = (hash << NAME_HASH_SHIFT) ^ (hash >> (32 - NAME_HASH_SHIFT)) ^ c as u32;
    }
    if !value.is_empty() {
        let mut padded = value.to_vec();
        padded.resize(value_len(value.len()), 0);
        for word in padded.chunks_exact(4) {
            hash = (hash << VALUE_HASH_SHIFT) ^ (hash >> (32 - VALUE_HASH_SHIFT)) ^ le_u32(word, 0);
        }
    }
    hash
}

/// Byte range of the in-inode xattr region within the inode's extra bytes
fn region_bounds(inode: &Inode, inode_size: usize) -> Option<(usize, usize)> {
    if inode_size <= EXT4_GOOD_OLD_INODE_SIZE as usize {
        return None;
    }
    let extra_len = inode_size - EXT4_GOOD_OLD_INODE_SIZE as usize;
    let start = inode.i_extra_isize as usize;
    if start + EXT4_XATTR_IBODY_HEADER_LEN + 4 > extra_len || inode.extra_bytes().len() < extra_len {
        return None;
    }
    Some((start, extra_len))
}

/// Total bytes available for entries and values (after the magic)
pub fn ibody_capacity(inode: &Inode, inode_size: usize) -> usize {
    match region_bounds(inode, inode_size) {
        Some((start, end)) => end - start - EXT4_XATTR_IBODY_HEADER_LEN,
        None => 0,
    }
}

/// Bytes `entries` need in the region, including the terminator
pub fn ibody_required(entries: &[XattrEntry]) -> usize {
    entries.iter().map(|e| e.entry_len() + e.value_len()).sum::<usize>() + 4
}

/// Parse the in-inode attributes of inode `ino`
pub fn read_ibody(inode: &Inode, ino: InodeNumber, inode_size: usize) -> ExtResult<Vec<XattrEntry>> {
    let (start, end) = match region_bounds(inode, inode_size) {
        Some(bounds) => bounds,
        None => return Ok(Vec::new()),
    };
    let region = &inode.extra_bytes()[start..end];
    if le_u32(region, 0) != EXT4_XATTR_MAGIC {
        return Ok(Vec::new());
    }
    let first = EXT4_XATTR_IBODY_HEADER_LEN;
    let area = &region[first..];
    let mut entries = Vec::new();
    let mut off = 0usize;
    loop {
        if off + 4 > area.len() {
            return Err(ExtError::XattrCorrupted(ino));
        }
        if le_u32(area, off) == 0 {
            break;
        }
        if off + EXT4_XATTR_ENTRY_HEADER_LEN > area.len() {
            return Err(ExtError::XattrCorrupted(ino));
        }
        let name_len = area[off] as usize;
        let name_index = area[off + 1];
        let value_offs = le_u16(area, off + 2) as usize;
        let value_inum = le_u32(area, off + 4);
        let value_size = le_u32(area, off + 8) as usize;
        let rec = entry_len(name_len);
        if off + rec > area.len() || value_inum != 0 {
            return Err(ExtError::XattrCorrupted(ino));
        }
        let name_start = off + EXT4_XATTR_ENTRY_HEADER_LEN;
        let name = area[name_start..name_start + name_len].to_vec();
        let value = if value_size == 0 {
            Vec::new()
        } else {
            if value_offs + value_size > area.len() {
                return Err(ExtError::XattrCorrupted(ino));
            }
            area[value_offs..value_offs + value_size].to_vec()
        };
        entries.push(XattrEntry {
            name_index,
            name,
            value,
        });
        off += rec;
    }
    Ok(entries)
}

/// Replace the in-inode attributes of inode `ino` with `entries`
pub fn write_ibody(inode: &mut Inode, ino: InodeNumber, inode_size: usize, entries: &[XattrEntry]) -> ExtResult<()> {
    let (start, end) = match region_bounds(inode, inode_size) {
        Some(bounds) => bounds,
        None if entries.is_empty() => return Ok(()),
        None => return Err(ExtError::XattrNoSpace(ino)),
    };
    let capacity = end - start - EXT4_XATTR_IBODY_HEADER_LEN;
    if ibody_required(entries) > capacity {
        return Err(ExtError::XattrNoSpace(ino));
    }
    let region = &mut inode.extra_bytes_mut()[start..end];
    region.fill(0);
    if entries.is_empty() {
        return Ok(());
    }
    put_le_u32(region, 0, EXT4_XATTR_MAGIC);
    let area = &mut region[EXT4_XATTR_IBODY_HEADER_LEN..];
    let mut entry_off = 0usize;
    let mut value_end = area.len();
    for entry in entries {
        let value_offs = if entry.value.is_empty() {
            0
        } else {
            value_end -= entry.value_len();
            area[value_end..value_end + entry.value.len()].copy_from_slice(&entry.value);
            value_end
        };
        area[entry_off] = entry.name.len() as u8;
        area[entry_off + 1] = entry.name_index;
        put_le_u16(area, entry_off + 2, value_offs as u16);
        put_le_u32(area, entry_off + 4, 0);
        put_le_u32(area, entry_off + 8, entry.value.len() as u32);
        put_le_u32(area, entry_off + 12, entry.hash());
        let name_start = entry_off + EXT4_XATTR_ENTRY_HEADER_LEN;
        area[name_start..name_start + entry.name.len()].copy_from_slice(&entry.name);
        entry_off += entry.entry_len();
    }
    Ok(())
}
