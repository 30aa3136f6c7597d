// Creating directories and adding entries to them

use crate::ext_native::core::dirent::{self, dir_rec_len, write_entry};
use crate::ext_native::core::endian::put_le_u32;
use crate::ext_native::core::*;
use crate::ext_native::filesystem::ExtFilesystem;
use crate::ext_native::reader::dir_iterate::{DirIterFlags, DirentAction, DirentVisit};
use log::{debug, info};

/// State carried through the record walk of `link`
struct LinkRequest<'a> {
    name: &'a [u8],
    ino: InodeNumber,
    file_type: u8,
    csum_size: usize,
    done: bool,
    error: Option<ExtError>,
}

impl LinkRequest<'_> {
    fn visit(&mut self, visit: &mut DirentVisit<'_>) -> DirentAction {
        if self.done {
            return DirentAction::ABORT;
        }
        match self.try_place(visit) {
            Ok(action) => action,
            Err(e) => {
                self.error = Some(e);
                DirentAction::ABORT
            }
        }
    }

    /// Absorb a following empty record, then split a live record or fill
    /// an empty one
    fn try_place(&mut self, visit: &mut DirentVisit<'_>) -> ExtResult<DirentAction> {
        let needed = dir_rec_len(self.name.len()) as u32;
        let mut header = visit.header();
        let mut action = DirentAction::CONTINUE;

        let next_off = visit.offset + header.rec_len as usize;
        if next_off + 8 + self.csum_size < visit.buflen {
            let next = visit.header_at(next_off);
            if next.inode == 0 && next_off + next.rec_len as usize <= visit.buflen {
                header.rec_len += next.rec_len;
                visit.set_header(&header)?;
                action = DirentAction::CHANGED;
            }
        }

        if header.inode != 0 {
            let min = header.min_rec_len() as u32;
            if header.rec_len < min + needed {
                return Ok(action);
            }
            let rest = header.rec_len - min;
            header.rec_len = min;
            visit.set_header(&header)?;
            visit.write_entry_at(visit.offset + min as usize, 0, rest, b"", 0)?;
            return Ok(DirentAction::CHANGED);
        }

        if header.rec_len < needed {
            return Ok(action);
        }
        visit.write_entry_at(visit.offset, self.ino, header.rec_len, self.name, self.file_type)?;
        self.done = true;
        Ok(DirentAction::CHANGED | DirentAction::ABORT)
    }
}

impl ExtFilesystem {
    fn dir_csum_size(&self) -> usize {
        if self.sb.has_metadata_csum() {
            EXT4_DIR_TAIL_SIZE
        } else {
            0
        }
    }

    fn dir_file_type(&self, file_type: u8) -> u8 {
        if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_FILETYPE) {
            file_type
        } else {
            0
        }
    }

    /// A fresh directory block. With `dir_ino` non-zero it holds `.` and
    /// `..`; otherwise a single empty record.
    pub fn new_dir_block(&self, dir_ino: InodeNumber, parent_ino: InodeNumber) -> ExtResult<Vec<u8>> {
        let bs = self.block_size();
        let csum_size = self.dir_csum_size();
        let mut buf = vec![0u8; bs as usize];
        let usable = bs - csum_size as u32;
        if dir_ino != 0 {
            let ft = self.dir_file_type(EXT4_FT_DIR);
            let dot_len = dir_rec_len(1) as u32;
            write_entry(&mut buf, 0, bs, dir_ino, dot_len, b".", ft)?;
            write_entry(&mut buf, dot_len as usize, bs, parent_ino, usable - dot_len, b"..", ft)?;
        } else {
            write_entry(&mut buf, 0, bs, 0, usable, b"", 0)?;
        }
        if csum_size > 0 {
            dirent::init_dir_tail(&mut buf, bs);
        }
        Ok(buf)
    }

    /// Write a block of directory `dir`, setting its checksum tail first
    pub fn write_dir_block(&mut self, block: BlockNumber, buf: &mut [u8], dir: InodeNumber) -> ExtResult<()> {
        self.require_rw()?;
        let bs = self.block_size();
        if self.sb.has_metadata_csum() {
            if dirent::has_dir_tail(buf, bs) {
                let generation = self.read_inode(dir)?.i_generation;
                dirent::set_dir_block_checksum(self.csum_seed(), dir, generation, buf, bs);
            } else {
                debug!("Directory {} block {} has no checksum tail", dir, block);
            }
        }
        self.write_block(block, buf)
    }

    /// Add `name` -> `ino` to directory `dir`. An inline directory with no
    /// room left is expanded into a block first.
    pub fn link(&mut self, dir: InodeNumber, name: &[u8], ino: InodeNumber, file_type: u8) -> ExtResult<()> {
        self.require_rw()?;
        if name.is_empty() || name.len() > EXT4_NAME_LEN {
            return Err(ExtError::InvalidArgument(format!("name of {} bytes", name.len())));
        }
        let mut request = LinkRequest {
            name,
            ino,
            file_type: self.dir_file_type(file_type),
            csum_size: self.dir_csum_size(),
            done: false,
            error: None,
        };
        let flags = DirIterFlags {
            include_empty: true,
            ..Default::default()
        };
        self.dir_iterate(dir, flags, |visit| request.visit(visit))?;
        if let Some(e) = request.error.take() {
            return Err(e);
        }

        if !request.done {
            let inode = self.read_inode(dir)?;
            if !inode.has_inline_data() {
                return Err(ExtError::DirNoSpace(dir));
            }
            self.inline_data_expand(dir)?;
            self.dir_iterate(dir, flags, |visit| request.visit(visit))?;
            if let Some(e) = request.error.take() {
                return Err(e);
            }
            if !request.done {
                return Err(ExtError::DirNoSpace(dir));
            }
        }

        let mut inode = self.read_inode(dir)?;
        if inode.has_flag(EXT4_INDEX_FL) {
            inode.i_flags &= !EXT4_INDEX_FL;
            self.write_inode(dir, &inode)?;
        }
        debug!("Linked {} as inode {} in directory {}", String::from_utf8_lossy(name), ino, dir);
        Ok(())
    }

    /// Create a directory under `parent`. `ino` of 0 allocates a new inode;
    /// `name` of None skips linking (used for the root). Inline storage is
    /// used when `inline` is asked for and the filesystem supports it.
    pub fn mkdir(
        &mut self,
        parent: InodeNumber,
        ino: InodeNumber,
        name: Option<&[u8]>,
        inline: bool,
    ) -> ExtResult<InodeNumber> {
        self.require_rw()?;
        if self.block_bitmap().is_none() || self.inode_bitmap().is_none() {
            self.read_bitmaps()?;
        }
        let inline = inline
            && self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_INLINE_DATA)
            && (ino == 0 || ino >= self.sb.first_ino());

        if let Some(name) = name {
            if self.lookup(parent, name)?.is_some() {
                return Err(ExtError::DirEntryExists {
                    dir: parent,
                    name: String::from_utf8_lossy(name).into_owned(),
                });
            }
        }

        let ino = if ino == 0 { self.new_inode(parent, None)? } else { ino };
        let mut inode = Inode::new(self.inode_size());
        inode.i_mode = S_IFDIR | 0o755;
        inode.i_links_count = 2;

        let block = if inline {
            let mut i_block = [0u8; EXT4_MIN_INLINE_DATA_SIZE];
            put_le_u32(&mut i_block, 0, parent);
            let area = (EXT4_MIN_INLINE_DATA_SIZE - EXT4_INLINE_DATA_DOTDOT_SIZE) as u32;
            write_entry(&mut i_block, EXT4_INLINE_DATA_DOTDOT_SIZE, self.block_size(), 0, area, b"", 0)?;
            inode.set_i_block_bytes(&i_block);
            inode.i_flags |= EXT4_INLINE_DATA_FL;
            inode.i_size = EXT4_MIN_INLINE_DATA_SIZE as u64;
            None
        } else {
            let goal = self.group_first_block(self.group_of_ino(ino));
            let block = self.new_block(goal, None)?;
            self.set_first_block(&mut inode, block);
            inode.i_size = self.block_size() as u64;
            inode.iblk_set(&self.sb, 1);
            Some(block)
        };

        self.write_new_inode(ino, &inode)?;
        match block {
            Some(block) => {
                let mut buf = self.new_dir_block(ino, parent)?;
                self.write_dir_block(block, &mut buf, ino)?;
                self.block_alloc_stats(block, 1)?;
            }
            None => self.inline_data_init(ino)?,
        }
        self.inode_alloc_stats(ino, 1, true)?;

        if let Some(name) = name {
            self.link(parent, name, ino, EXT4_FT_DIR)?;
        }
        if parent != ino {
            let mut parent_inode = self.read_inode(parent)?;
            parent_inode.i_links_count += 1;
            self.write_inode(parent, &parent_inode)?;
        }
        info!(
            "Created {}directory inode {} under {}",
            if inline { "inline " } else { "" },
            ino,
            parent
        );
        Ok(ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::core::endian::le_u32;
    use crate::ext_native::filesystem::initialize::initialize;
    use e2kit_core::{MemoryChannel, OpenOptions};

    fn open_rw(params: FsParams) -> ExtFilesystem {
        let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
        initialize(Box::new(channel.clone()), &params).unwrap();
        let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::read_write()).unwrap();
        fs.read_bitmaps().unwrap();
        fs
    }

    #[test]
    fn test_new_dir_block_layout() {
        let fs = open_rw(FsParams::default());
        let buf = fs.new_dir_block(12, 2).unwrap();
        let dot = dirent::DirEntryHeader::read(&buf, 0, 1024);
        let dotdot = dirent::DirEntryHeader::read(&buf, 12, 1024);
        assert_eq!((dot.inode, dot.rec_len, dot.name_len), (12, 12, 1));
        assert_eq!((dotdot.inode, dotdot.rec_len, dotdot.name_len), (2, 1012, 2));

        let empty = fs.new_dir_block(0, 0).unwrap();
        assert_eq!(dirent::DirEntryHeader::read(&empty, 0, 1024).rec_len, 1024);
    }

    #[test]
    fn test_mkdir_counts_and_links() {
        let mut fs = open_rw(FsParams::default());
        let root_links = fs.read_inode(EXT4_ROOT_INO).unwrap().i_links_count;
        let dirs = fs.group_desc[0].used_dirs_count;
        let free_blocks = fs.sb.free_blocks_count();

        let ino = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"etc"), false).unwrap();
        assert_eq!(fs.lookup(EXT4_ROOT_INO, b"etc").unwrap(), Some(ino));
        assert_eq!(fs.read_inode(EXT4_ROOT_INO).unwrap().i_links_count, root_links + 1);
        assert_eq!(fs.group_desc[0].used_dirs_count, dirs + 1);
        assert_eq!(fs.sb.free_blocks_count(), free_blocks - 1);

        let inode = fs.read_inode(ino).unwrap();
        assert!(inode.is_dir());
        assert_eq!(inode.i_links_count, 2);
        assert_eq!(fs.lookup(ino, b"..").unwrap(), Some(EXT4_ROOT_INO));

        assert!(matches!(
            fs.mkdir(EXT4_ROOT_INO, 0, Some(b"etc"), false),
            Err(ExtError::DirEntryExists { dir: EXT4_ROOT_INO, .. })
        ));
    }

    #[test]
    fn test_link_fills_block_then_reports_no_space() {
        let mut fs = open_rw(FsParams::default());
        let dir = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"full"), false).unwrap();
        // 1000 free bytes after "." and "..", 16 bytes per 8-byte name
        let mut linked = 0;
        loop {
            let name = format!("entry{:03}", linked);
            match fs.link(dir, name.as_bytes(), 100 + linked, EXT4_FT_REG_FILE) {
                Ok(()) => linked += 1,
                Err(ExtError::DirNoSpace(d)) => {
                    assert_eq!(d, dir);
                    break;
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(linked, 1000 / 16);
        assert_eq!(fs.lookup(dir, b"entry041").unwrap(), Some(141));
    }

    #[test]
    fn test_inline_mkdir_and_overflow_expands() {
        let params = FsParams {
            feature_incompat: FsParams::default().feature_incompat
                | EXT4_FEATURE_INCOMPAT_INLINE_DATA
                | EXT4_FEATURE_INCOMPAT_EXTENTS,
            ..Default::default()
        };
        let mut fs = open_rw(params);
        let dir = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"small"), true).unwrap();
        let inode = fs.read_inode(dir).unwrap();
        assert!(inode.has_inline_data());
        assert_eq!(le_u32(&inode.i_block_bytes(), 0), EXT4_ROOT_INO);
        assert_eq!(fs.lookup(dir, b"..").unwrap(), Some(EXT4_ROOT_INO));

        fs.link(dir, b"a", 30, EXT4_FT_REG_FILE).unwrap();
        assert_eq!(fs.lookup(dir, b"a").unwrap(), Some(30));
        assert!(fs.read_inode(dir).unwrap().has_inline_data());

        // Long names soon exhaust the i_block area
        for i in 0..20u32 {
            let name = format!("a-rather-long-file-name-{:02}", i);
            fs.link(dir, name.as_bytes(), 31 + i, EXT4_FT_REG_FILE).unwrap();
        }
        let inode = fs.read_inode(dir).unwrap();
        assert!(!inode.has_inline_data());
        assert_eq!(fs.lookup(dir, b"a").unwrap(), Some(30));
        assert_eq!(fs.lookup(dir, b"a-rather-long-file-name-19").unwrap(), Some(50));
    }
}
