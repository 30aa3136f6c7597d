// Directory entry codec
// Directory records are always little-endian on disk.

use super::checksum;
use super::constants::*;
use super::endian::{le_u16, le_u32, put_le_u16, put_le_u32};
use super::types::*;

/// Space a record with a `name_len`-byte name occupies
pub fn dir_rec_len(name_len: usize) -> usize {
    (name_len + EXT4_DIR_ENTRY_HEADER_LEN + EXT4_DIR_ROUND) & !EXT4_DIR_ROUND
}

/// Decode an on-disk rec_len. Block sizes of 64KiB and up encode lengths
/// that do not fit in 16 bits using the low two bits.
pub fn decode_rec_len(block_size: u32, raw: u16) -> u32 {
    let len = raw as u32;
    if block_size < 65536 {
        return len;
    }
    if len == EXT4_MAX_REC_LEN || len == 0 {
        return block_size;
    }
    (len & 65532) | ((len & 3) << 16)
}

/// Encode a rec_len for the given block size
pub fn encode_rec_len(block_size: u32, len: u32) -> ExtResult<u16> {
    if len > block_size || block_size > (1 << 18) || len & 3 != 0 {
        return Err(ExtError::InvalidArgument(format!(
            "rec_len {} not valid for block size {}",
            len, block_size
        )));
    }
    if len < 65536 {
        return Ok(len as u16);
    }
    if len == block_size {
        return Ok(if block_size == 65536 { EXT4_MAX_REC_LEN as u16 } else { 0 });
    }
    Ok(((len & 65532) | ((len >> 16) & 3)) as u16)
}

/// Fixed 8-byte header of a directory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntryHeader {
    pub inode: InodeNumber,
    /// Decoded record length
    pub rec_len: u32,
    pub name_len: u8,
    pub file_type: u8,
}

impl DirEntryHeader {
    pub fn read(buf: &[u8], offset: usize, block_size: u32) -> Self {
        Self {
            inode: le_u32(buf, offset),
            rec_len: decode_rec_len(block_size, le_u16(buf, offset + 4)),
            name_len: buf[offset + 6],
            file_type: buf[offset + 7],
        }
    }

    pub fn write(&self, buf: &mut [u8], offset: usize, block_size: u32) -> ExtResult<()> {
        put_le_u32(buf, offset, self.inode);
        put_le_u16(buf, offset + 4, encode_rec_len(block_size, self.rec_len)?);
        buf[offset + 6] = self.name_len;
        buf[offset + 7] = self.file_type;
        Ok(())
    }

    /// Bytes this record actually needs
    pub fn min_rec_len(&self) -> usize {
        dir_rec_len(self.name_len as usize)
    }

    pub fn is_csum_tail(&self) -> bool {
        self.inode == 0
            && self.rec_len as usize == EXT4_DIR_TAIL_SIZE
            && self.name_len == 0
            && self.file_type == EXT4_FT_DIR_CSUM
    }
}

/// Write a complete record (header plus name) at `offset`
pub fn write_entry(
    buf: &mut [u8],
    offset: usize,
    block_size: u32,
    inode: InodeNumber,
    rec_len: u32,
    name: &[u8],
    file_type: u8,
) -> ExtResult<()> {
    if name.len() > EXT4_NAME_LEN {
        return Err(ExtError::InvalidArgument(format!("name of {} bytes too long", name.len())));
    }
    DirEntryHeader {
        inode,
        rec_len,
        name_len: name.len() as u8,
        file_type,
    }
    .write(buf, offset, block_size)?;
    let start = offset + EXT4_DIR_ENTRY_HEADER_LEN;
    buf[start..start + name.len()].copy_from_slice(name);
    Ok(())
}

/// Offset of the checksum tail in a directory block
pub fn dir_tail_offset(block_size: u32) -> usize {
    block_size as usize - EXT4_DIR_TAIL_SIZE
}

/// Lay down an empty checksum tail at the end of `buf`
pub fn init_dir_tail(buf: &mut [u8], block_size: u32) {
    let off = dir_tail_offset(block_size);
    buf[off..off + EXT4_DIR_TAIL_SIZE].fill(0);
    put_le_u16(buf, off + 4, EXT4_DIR_TAIL_SIZE as u16);
    buf[off + 7] = EXT4_FT_DIR_CSUM;
}

/// True when the block ends in a well-formed checksum tail
pub fn has_dir_tail(buf: &[u8], block_size: u32) -> bool {
    let off = dir_tail_offset(block_size);
    DirEntryHeader::read(buf, off, block_size).is_csum_tail()
}

pub fn dir_block_checksum(seed: u32, dir_ino: InodeNumber, generation: u32, buf: &[u8], block_size: u32) -> u32 {
    checksum::dirent_checksum(seed, dir_ino, generation, &buf[..dir_tail_offset(block_size)])
}

pub fn set_dir_block_checksum(seed: u32, dir_ino: InodeNumber, generation: u32, buf: &mut [u8], block_size: u32) {
    let crc = dir_block_checksum(seed, dir_ino, generation, buf, block_size);
    put_le_u32(buf, dir_tail_offset(block_size) + 8, crc);
}

pub fn verify_dir_block_checksum(seed: u32, dir_ino: InodeNumber, generation: u32, buf: &[u8], block_size: u32) -> bool {
    let stored = le_u32(buf, dir_tail_offset(block_size) + 8);
    stored == dir_block_checksum(seed, dir_ino, generation, buf, block_size)
}

/// Directory entry file type for an inode mode
pub fn file_type_from_mode(mode: u16) -> u8 {
    match mode & S_IFMT {
        S_IFREG => EXT4_FT_REG_FILE,
        S_IFDIR => EXT4_FT_DIR,
        S_IFCHR => EXT4_FT_CHRDEV,
        S_IFBLK => EXT4_FT_BLKDEV,
        S_IFIFO => EXT4_FT_FIFO,
        S_IFSOCK => EXT4_FT_SOCK,
        S_IFLNK => EXT4_FT_SYMLINK,
        _ => EXT4_FT_UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_rec_len() {
        assert_eq!(dir_rec_len(1), 12);
        assert_eq!(dir_rec_len(2), 12);
        assert_eq!(dir_rec_len(4), 12);
        assert_eq!(dir_rec_len(5), 16);
        assert_eq!(dir_rec_len(255), 264);
    }

    #[test]
    fn test_rec_len_large_blocks() {
        assert_eq!(decode_rec_len(4096, 0), 0);
        assert_eq!(decode_rec_len(65536, 0), 65536);
        assert_eq!(decode_rec_len(65536, 65535), 65536);
        assert_eq!(encode_rec_len(65536, 65536).unwrap(), 65535);
        assert_eq!(encode_rec_len(131072, 131072).unwrap(), 0);

        let raw = encode_rec_len(262144, 0x1_0010).unwrap();
        assert_eq!(decode_rec_len(262144, raw), 0x1_0010);
        assert!(encode_rec_len(4096, 4098).is_err());
        assert!(encode_rec_len(4096, 8192).is_err());
    }

    #[test]
    fn test_dir_tail() {
        let bs = 1024;
        let mut buf = vec![0u8; bs as usize];
        write_entry(&mut buf, 0, bs, 2, bs - 12, b".", EXT4_FT_DIR).unwrap();
        assert!(!has_dir_tail(&buf, bs));
        init_dir_tail(&mut buf, bs);
        assert!(has_dir_tail(&buf, bs));

        set_dir_block_checksum(5, 2, 0, &mut buf, bs);
        assert!(verify_dir_block_checksum(5, 2, 0, &buf, bs));
        buf[8] = b'x';
        assert!(!verify_dir_block_checksum(5, 2, 0, &buf, bs));
    }
}
