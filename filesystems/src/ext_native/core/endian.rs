// Byte order of on-disk structures
// ext2/3/4 is little-endian; byte-swapped images store every multi-byte
// field big-endian. All decode/encode goes through this boundary.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn from_swap(swap_bytes: bool) -> Self {
        if swap_bytes {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn is_swapped(self) -> bool {
        self == Endian::Big
    }

    pub fn u16(self, buf: &[u8], off: usize) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(&buf[off..off + 2]),
            Endian::Big => BigEndian::read_u16(&buf[off..off + 2]),
        }
    }

    pub fn u32(self, buf: &[u8], off: usize) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(&buf[off..off + 4]),
            Endian::Big => BigEndian::read_u32(&buf[off..off + 4]),
        }
    }

    pub fn u64(self, buf: &[u8], off: usize) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(&buf[off..off + 8]),
            Endian::Big => BigEndian::read_u64(&buf[off..off + 8]),
        }
    }

    pub fn put_u16(self, buf: &mut [u8], off: usize, value: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(&mut buf[off..off + 2], value),
            Endian::Big => BigEndian::write_u16(&mut buf[off..off + 2], value),
        }
    }

    pub fn put_u32(self, buf: &mut [u8], off: usize, value: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(&mut buf[off..off + 4], value),
            Endian::Big => BigEndian::write_u32(&mut buf[off..off + 4], value),
        }
    }

    pub fn put_u64(self, buf: &mut [u8], off: usize, value: u64) {
        match self {
            Endian::Little => LittleEndian::write_u64(&mut buf[off..off + 8], value),
            Endian::Big => BigEndian::write_u64(&mut buf[off..off + 8], value),
        }
    }
}

/// Little-endian helpers for structures that are never byte-swapped
/// (directory entries, extent trees, xattr entries, i_block of extent or
/// inline inodes).
pub fn le_u16(buf: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&buf[off..off + 2])
}

pub fn le_u32(buf: &[u8], off: usize) -> u32 {
    LittleEndian::read_u32(&buf[off..off + 4])
}

pub fn put_le_u16(buf: &mut [u8], off: usize, value: u16) {
    LittleEndian::write_u16(&mut buf[off..off + 2], value);
}

pub fn put_le_u32(buf: &mut [u8], off: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[off..off + 4], value);
}
