// Inline data: payloads kept in i_block plus the system.data attribute,
// and their conversion into a regular data block

use crate::ext_native::core::dirent::{self, dir_rec_len, write_entry, DirEntryHeader};
use crate::ext_native::core::endian::le_u32;
use crate::ext_native::core::extent::{ExtentHeader, EXTENT_ENTRY_SIZE, EXTENT_HEADER_SIZE};
use crate::ext_native::core::xattr::{self, XattrEntry};
use crate::ext_native::core::*;
use crate::ext_native::filesystem::ExtFilesystem;
use log::{debug, info};

fn is_system_data(entry: &XattrEntry) -> bool {
    entry.matches(EXT4_XATTR_INDEX_SYSTEM, EXT4_XATTR_SYSTEM_DATA)
}

impl ExtFilesystem {
    /// Value of the system.data attribute (the bytes past i_block)
    pub(crate) fn inline_ea_get(&self, ino: InodeNumber, inode: &Inode) -> ExtResult<Vec<u8>> {
        let entries = xattr::read_ibody(inode, ino, self.inode_size())?;
        Ok(entries
            .into_iter()
            .find(is_system_data)
            .map(|entry| entry.value)
            .unwrap_or_default())
    }

    /// Store `data` as the system.data attribute of the in-memory `inode`
    pub(crate) fn inline_ea_set(&self, ino: InodeNumber, inode: &mut Inode, data: &[u8]) -> ExtResult<()> {
        let mut entries = xattr::read_ibody(inode, ino, self.inode_size())?;
        let value = data.to_vec();
        match entries.iter_mut().find(|e| is_system_data(e)) {
            Some(entry) => entry.value = value,
            None => entries.insert(0, XattrEntry::new(EXT4_XATTR_INDEX_SYSTEM, EXT4_XATTR_SYSTEM_DATA, value)),
        }
        xattr::write_ibody(inode, ino, self.inode_size(), &entries).map_err(|e| match e {
            ExtError::XattrNoSpace(_) => ExtError::InlineDataNoSpace(ino),
            other => other,
        })
    }

    fn read_inline_inode(&mut self, ino: InodeNumber) -> ExtResult<Inode> {
        let inode = self.read_inode(ino)?;
        if !inode.has_inline_data() {
            return Err(ExtError::NoInlineData(ino));
        }
        Ok(inode)
    }

    /// Full inline payload: i_block followed by the attribute overflow
    fn inline_payload(&self, ino: InodeNumber, inode: &Inode) -> ExtResult<Vec<u8>> {
        let mut payload = inode.i_block_bytes().to_vec();
        payload.extend(self.inline_ea_get(ino, inode)?);
        Ok(payload)
    }

    /// Give a new inline inode its empty system.data attribute
    pub fn inline_data_init(&mut self, ino: InodeNumber) -> ExtResult<()> {
        let mut inode = self.read_inode(ino)?;
        self.inline_ea_set(ino, &mut inode, &[])?;
        self.write_inode(ino, &inode)
    }

    /// Bytes of inline storage in use: i_block plus the overflow
    pub fn inline_data_size(&mut self, ino: InodeNumber) -> ExtResult<usize> {
        let inode = self.read_inline_inode(ino)?;
        Ok(EXT4_MIN_INLINE_DATA_SIZE + self.inline_ea_get(ino, &inode)?.len())
    }

    pub fn inline_data_get(&mut self, ino: InodeNumber) -> ExtResult<Vec<u8>> {
        let inode = self.read_inline_inode(ino)?;
        self.inline_payload(ino, &inode)
    }

    /// Replace the inline payload of `ino` with `data`, spilling past
    /// i_block into the system.data attribute
    pub fn inline_data_set(&mut self, ino: InodeNumber, data: &[u8]) -> ExtResult<()> {
        self.require_rw()?;
        let mut inode = self.read_inline_inode(ino)?;
        let split = data.len().min(EXT4_MIN_INLINE_DATA_SIZE);
        let mut i_block = [0u8; EXT4_MIN_INLINE_DATA_SIZE];
        i_block[..split].copy_from_slice(&data[..split]);
        inode.set_i_block_bytes(&i_block);
        self.inline_ea_set(ino, &mut inode, &data[split..])?;
        inode.i_size = data.len() as u64;
        self.write_inode(ino, &inode)?;
        debug!("Inode {} holds {} inline bytes", ino, data.len());
        Ok(())
    }

    /// Drop the system.data attribute of `ino`
    pub fn inline_data_ea_remove(&mut self, ino: InodeNumber) -> ExtResult<()> {
        self.require_rw()?;
        let mut inode = self.read_inode(ino)?;
        let mut entries = xattr::read_ibody(&inode, ino, self.inode_size())?;
        let before = entries.len();
        entries.retain(|e| !is_system_data(e));
        if entries.len() == before {
            return Ok(());
        }
        xattr::write_ibody(&mut inode, ino, self.inode_size(), &entries)?;
        self.write_inode(ino, &inode)
    }

    /// Lay an inline directory payload out as a directory block: `.` and
    /// `..` first, then the stored records with the last one stretched to
    /// the end of the block
    fn inline_dir_to_block(&self, ino: InodeNumber, payload: &[u8]) -> ExtResult<Vec<u8>> {
        let bs = self.block_size();
        let csum_size = if self.sb.has_metadata_csum() {
            EXT4_DIR_TAIL_SIZE
        } else {
            0
        };
        let usable = bs as usize - csum_size;
        let ft = if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_FILETYPE) {
            EXT4_FT_DIR
        } else {
            0
        };
        let dot_len = dir_rec_len(1);
        let dotdot_len = dir_rec_len(2);
        let start = dot_len + dotdot_len;
        let records = &payload[EXT4_INLINE_DATA_DOTDOT_SIZE..];
        let size = start + records.len();
        if size > usable {
            return Err(ExtError::DirNoSpace(ino));
        }

        let mut buf = vec![0u8; bs as usize];
        write_entry(&mut buf, 0, bs, ino, dot_len as u32, b".", ft)?;
        write_entry(&mut buf, dot_len, bs, le_u32(payload, 0), dotdot_len as u32, b"..", ft)?;
        buf[start..size].copy_from_slice(records);

        let mut offset = start;
        let mut last = start;
        while offset < size {
            let rec_len = DirEntryHeader::read(&buf, offset, bs).rec_len as usize;
            if rec_len < 8 || offset + rec_len > size {
                return Err(ExtError::DirCorrupted {
                    dir: ino,
                    block: 0,
                    detail: format!("inline record at {} has rec_len {}", offset, rec_len),
                });
            }
            last = offset;
            offset += rec_len;
        }
        let mut header = DirEntryHeader::read(&buf, last, bs);
        header.rec_len += (usable - offset) as u32;
        header.write(&mut buf, last, bs)?;
        if csum_size > 0 {
            dirent::init_dir_tail(&mut buf, bs);
        }
        Ok(buf)
    }

    /// Move the inline payload of `ino` into a newly allocated block and
    /// turn the inode into a regular block-mapped one.
    ///
    /// The block is written first, then the inode; the block bitmap only
    /// changes in memory, so an interrupted expansion leaves either an
    /// untouched inline inode or an inode whose block the on-disk bitmap
    /// still shows as free.
    pub fn inline_data_expand(&mut self, ino: InodeNumber) -> ExtResult<()> {
        self.require_rw()?;
        let mut inode = self.read_inline_inode(ino)?;
        let payload = self.inline_payload(ino, &inode)?;
        if self.block_bitmap().is_none() {
            self.read_bitmaps()?;
        }
        let bs = self.block_size() as usize;

        let (block, size) = if inode.is_dir() {
            let mut buf = self.inline_dir_to_block(ino, &payload)?;
            let block = self.new_block(0, None)?;
            self.write_dir_block(block, &mut buf, ino)?;
            (Some(block), bs as u64)
        } else {
            let len = (inode.i_size as usize).min(payload.len());
            if len == 0 {
                (None, 0)
            } else {
                let mut buf = vec![0u8; bs];
                buf[..len].copy_from_slice(&payload[..len]);
                let block = self.new_block(0, None)?;
                self.write_block(block, &buf)?;
                (Some(block), len as u64)
            }
        };

        let mut entries = xattr::read_ibody(&inode, ino, self.inode_size())?;
        entries.retain(|e| !is_system_data(e));
        xattr::write_ibody(&mut inode, ino, self.inode_size(), &entries)?;
        inode.i_block = [0; EXT4_N_BLOCKS];
        inode.i_flags &= !EXT4_INLINE_DATA_FL;
        inode.i_size = size;
        match block {
            Some(block) => {
                self.set_first_block(&mut inode, block);
                inode.iblk_add_blocks(&self.sb, 1);
            }
            None if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_EXTENTS) => {
                let mut root = [0u8; EXT4_N_BLOCKS * 4];
                let max = ((root.len() - EXTENT_HEADER_SIZE) / EXTENT_ENTRY_SIZE) as u16;
                ExtentHeader::new_leaf(max).write(&mut root);
                inode.set_i_block_bytes(&root);
                inode.i_flags |= EXT4_EXTENTS_FL;
            }
            None => {}
        }
        self.write_inode(ino, &inode)?;
        if let Some(block) = block {
            self.block_alloc_stats(block, 1)?;
        }
        info!("Expanded inline inode {} into block {:?}", ino, block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::filesystem::initialize::initialize;
    use crate::ext_native::reader::dir_iterate::{DirEntryKind, DirIterFlags, DirentAction};
    use e2kit_core::{MemoryChannel, OpenOptions};

    fn inline_params(extra_ro: u32) -> FsParams {
        let base = FsParams::default();
        FsParams {
            feature_incompat: base.feature_incompat
                | EXT4_FEATURE_INCOMPAT_INLINE_DATA
                | EXT4_FEATURE_INCOMPAT_EXTENTS,
            feature_ro_compat: base.feature_ro_compat | extra_ro,
            ..base
        }
    }

    fn open_rw(params: FsParams) -> ExtFilesystem {
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();
        let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::read_write()).unwrap();
        fs.read_bitmaps().unwrap();
        fs
    }

    fn inline_file(fs: &mut ExtFilesystem) -> InodeNumber {
        let ino = fs.new_inode(EXT4_ROOT_INO, None).unwrap();
        let mut inode = Inode::new(fs.inode_size());
        inode.i_mode = S_IFREG | 0o644;
        inode.i_links_count = 1;
        inode.i_flags = EXT4_INLINE_DATA_FL;
        fs.write_new_inode(ino, &inode).unwrap();
        fs.inode_alloc_stats(ino, 1, false).unwrap();
        fs.inline_data_init(ino).unwrap();
        fs.link(EXT4_ROOT_INO, b"notes", ino, EXT4_FT_REG_FILE).unwrap();
        ino
    }

    #[test]
    fn test_set_get_with_overflow() {
        let mut fs = open_rw(inline_params(0));
        let ino = inline_file(&mut fs);
        assert_eq!(fs.inline_data_size(ino).unwrap(), EXT4_MIN_INLINE_DATA_SIZE);

        let short = b"hello".to_vec();
        fs.inline_data_set(ino, &short).unwrap();
        assert_eq!(&fs.inline_data_get(ino).unwrap()[..5], b"hello");
        assert_eq!(fs.read_inode(ino).unwrap().i_size, 5);

        let long: Vec<u8> = (0..100u8).collect();
        fs.inline_data_set(ino, &long).unwrap();
        assert_eq!(fs.inline_data_size(ino).unwrap(), 100);
        assert_eq!(fs.inline_data_get(ino).unwrap(), long);

        let huge = vec![7u8; 400];
        assert!(matches!(fs.inline_data_set(ino, &huge), Err(ExtError::InlineDataNoSpace(i)) if i == ino));
        assert_eq!(fs.inline_data_get(ino).unwrap(), long);

        assert!(matches!(fs.inline_data_size(EXT4_ROOT_INO), Err(ExtError::NoInlineData(2))));
    }

    #[test]
    fn test_ea_remove() {
        let mut fs = open_rw(inline_params(0));
        let ino = inline_file(&mut fs);
        fs.inline_data_set(ino, &[1u8; 80]).unwrap();
        fs.inline_data_ea_remove(ino).unwrap();
        assert_eq!(fs.inline_data_size(ino).unwrap(), EXT4_MIN_INLINE_DATA_SIZE);
        fs.inline_data_ea_remove(ino).unwrap();
    }

    fn expand_scenario(params: FsParams) {
        let mut fs = open_rw(params);
        let dir = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"inl"), true).unwrap();
        fs.link(dir, b"foo", 12, EXT4_FT_REG_FILE).unwrap();
        let free = fs.sb.free_blocks_count();

        fs.inline_data_expand(dir).unwrap();
        let inode = fs.read_inode(dir).unwrap();
        assert!(!inode.has_inline_data());
        assert_eq!(inode.blocks_in_fs_units(&fs.sb), 1);
        assert_eq!(inode.i_size, 1024);
        assert_eq!(fs.sb.free_blocks_count(), free - 1);
        let block = fs.bmap(dir, &inode, 0).unwrap().unwrap();
        assert!(fs.block_bitmap().unwrap().test(block).unwrap());

        let mut records = Vec::new();
        fs.dir_iterate(
            dir,
            DirIterFlags {
                include_csum: true,
                ..Default::default()
            },
            |visit| {
                let header = visit.header();
                records.push((visit.kind, visit.name().to_vec(), header.inode, header.rec_len));
                DirentAction::CONTINUE
            },
        )
        .unwrap();
        let csum = fs.sb.has_metadata_csum();
        let live: Vec<_> = records.iter().filter(|r| r.0 != DirEntryKind::Checksum).collect();
        assert_eq!(live.len(), 3);
        assert_eq!((live[0].1.as_slice(), live[0].2), (&b"."[..], dir));
        assert_eq!((live[1].1.as_slice(), live[1].2), (&b".."[..], EXT4_ROOT_INO));
        assert_eq!((live[2].1.as_slice(), live[2].2), (&b"foo"[..], 12));
        let sum: u32 = live.iter().map(|r| r.3).sum();
        assert_eq!(sum as usize, 1024 - if csum { EXT4_DIR_TAIL_SIZE } else { 0 });
        assert_eq!(records.len(), if csum { 4 } else { 3 });

        assert!(matches!(fs.inline_data_expand(dir), Err(ExtError::NoInlineData(_))));
    }

    #[test]
    fn test_expand_directory() {
        expand_scenario(inline_params(0));
    }

    #[test]
    fn test_expand_directory_with_checksums() {
        expand_scenario(inline_params(EXT4_FEATURE_RO_COMPAT_METADATA_CSUM));
    }

    #[test]
    fn test_expand_regular_file() {
        let mut fs = open_rw(inline_params(0));
        let ino = inline_file(&mut fs);
        let data: Vec<u8> = (0..90u8).collect();
        fs.inline_data_set(ino, &data).unwrap();
        fs.inline_data_expand(ino).unwrap();

        let inode = fs.read_inode(ino).unwrap();
        assert!(!inode.has_inline_data());
        assert!(inode.has_flag(EXT4_EXTENTS_FL));
        assert_eq!(inode.i_size, 90);
        let block = fs.bmap(ino, &inode, 0).unwrap().unwrap();
        let mut buf = vec![0u8; 1024];
        fs.read_block(block, &mut buf).unwrap();
        assert_eq!(&buf[..90], data.as_slice());
        assert!(buf[90..].iter().all(|&b| b == 0));
        assert!(xattr::read_ibody(&inode, ino, fs.inode_size()).unwrap().is_empty());
    }
}
