// CRC helpers for ext metadata
// metadata_csum uses CRC32c (Castagnoli); the older gdt_csum feature uses
// CRC16 (ANSI, reflected polynomial 0xA001).

use crc32c;

/// Offset of the checksum field in the superblock
pub const SUPERBLOCK_CSUM_OFFSET: usize = 0x3FC;
/// Offset of bg_checksum in a group descriptor
pub const GROUP_DESC_CSUM_OFFSET: usize = 0x1E;

/// Raw CRC32c update starting from `initial`, without the final inversion
pub fn crc32c_ext4(data: &[u8], initial: u32) -> u32 {
    !crc32c::crc32c_append(!initial, data)
}

/// CRC16 as used by gdt_csum
pub fn crc16(data: &[u8], initial: u16) -> u16 {
    let mut crc = initial;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Seed for every metadata_csum checksum
pub fn csum_seed(uuid: &[u8; 16], explicit_seed: Option<u32>) -> u32 {
    match explicit_seed {
        Some(seed) => seed,
        None => crc32c_ext4(uuid, !0),
    }
}

/// Checksum over a little-endian encoded superblock
pub fn superblock_checksum(sb_bytes: &[u8]) -> u32 {
    crc32c_ext4(&sb_bytes[..SUPERBLOCK_CSUM_OFFSET], !0)
}

/// Group descriptor checksum under metadata_csum
pub fn group_desc_checksum_crc32c(seed: u32, group: u32, desc_bytes: &[u8]) -> u16 {
    let mut desc = desc_bytes.to_vec();
    desc[GROUP_DESC_CSUM_OFFSET] = 0;
    desc[GROUP_DESC_CSUM_OFFSET + 1] = 0;
    let crc = crc32c_ext4(&group.to_le_bytes(), seed);
    (crc32c_ext4(&desc, crc) & 0xFFFF) as u16
}

/// Group descriptor checksum under gdt_csum
pub fn group_desc_checksum_crc16(uuid: &[u8; 16], group: u32, desc_bytes: &[u8]) -> u16 {
    let mut crc = crc16(uuid, !0);
    crc = crc16(&group.to_le_bytes(), crc);
    crc = crc16(&desc_bytes[..GROUP_DESC_CSUM_OFFSET], crc);
    let rest = GROUP_DESC_CSUM_OFFSET + 2;
    if rest < desc_bytes.len() {
        crc = crc16(&desc_bytes[rest..], crc);
    }
    crc
}

/// Inode checksum; `inode_bytes` is the full on-disk inode, little-endian,
/// with the checksum fields already zeroed by the caller.
pub fn inode_checksum(seed: u32, ino: u32, generation: u32, inode_bytes: &[u8]) -> u32 {
    let mut crc = crc32c_ext4(&ino.to_le_bytes(), seed);
    crc = crc32c_ext4(&generation.to_le_bytes(), crc);
    crc32c_ext4(inode_bytes, crc)
}

/// Directory leaf block checksum over the entries before the tail
pub fn dirent_checksum(seed: u32, ino: u32, generation: u32, entries: &[u8]) -> u32 {
    let mut crc = crc32c_ext4(&ino.to_le_bytes(), seed);
    crc = crc32c_ext4(&generation.to_le_bytes(), crc);
    crc32c_ext4(entries, crc)
}

/// Block or inode bitmap checksum
pub fn bitmap_checksum(seed: u32, bitmap: &[u8]) -> u32 {
    crc32c_ext4(bitmap, seed)
}
