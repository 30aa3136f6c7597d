// Directory record iteration over data blocks and inline directories

use crate::ext_native::core::dirent::{self, dir_rec_len, write_entry, DirEntryHeader};
use crate::ext_native::core::endian::{le_u32, put_le_u32};
use crate::ext_native::core::*;
use crate::ext_native::filesystem::ExtFilesystem;
use log::{trace, warn};
use std::ops::BitOr;

/// Which records the visitor gets to see besides live entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirIterFlags {
    /// Records with inode 0 (and holes, as one empty record per block)
    pub include_empty: bool,
    /// Deleted records still recoverable inside a live record's slack
    pub include_removed: bool,
    /// The checksum tail of each block
    pub include_csum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryKind {
    Dot,
    DotDot,
    Other,
    Deleted,
    Checksum,
}

/// What the visitor wants done after seeing a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirentAction {
    changed: bool,
    abort: bool,
}

impl DirentAction {
    pub const CONTINUE: Self = Self {
        changed: false,
        abort: false,
    };
    /// The record was modified in place; the block must be written back
    pub const CHANGED: Self = Self {
        changed: true,
        abort: false,
    };
    pub const ABORT: Self = Self {
        changed: false,
        abort: true,
    };

    pub fn is_changed(self) -> bool {
        self.changed
    }

    pub fn is_abort(self) -> bool {
        self.abort
    }
}

impl BitOr for DirentAction {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            changed: self.changed || rhs.changed,
            abort: self.abort || rhs.abort,
        }
    }
}

/// One record handed to a visitor, with the whole buffer it lives in
pub struct DirentVisit<'a> {
    pub dir: InodeNumber,
    pub kind: DirEntryKind,
    pub offset: usize,
    /// Length of the record area: the block size, or the size of an
    /// inline region
    pub buflen: usize,
    pub buf: &'a mut [u8],
    block_size: u32,
}

impl DirentVisit<'_> {
    pub fn header(&self) -> DirEntryHeader {
        DirEntryHeader::read(self.buf, self.offset, self.block_size)
    }

    pub fn name(&self) -> &[u8] {
        let start = self.offset + EXT4_DIR_ENTRY_HEADER_LEN;
        let len = self.buf[self.offset + 6] as usize;
        &self.buf[start..start + len]
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn set_inode(&mut self, ino: InodeNumber) {
        put_le_u32(self.buf, self.offset, ino);
    }

    pub fn set_header(&mut self, header: &DirEntryHeader) -> ExtResult<()> {
        header.write(self.buf, self.offset, self.block_size)
    }

    /// Header of the record at `offset` in the same buffer
    pub fn header_at(&self, offset: usize) -> DirEntryHeader {
        DirEntryHeader::read(self.buf, offset, self.block_size)
    }

    /// Overwrite the record at `offset` in the same buffer
    pub fn write_entry_at(
        &mut self,
        offset: usize,
        ino: InodeNumber,
        rec_len: u32,
        name: &[u8],
        file_type: u8,
    ) -> ExtResult<()> {
        write_entry(self.buf, offset, self.block_size, ino, rec_len, name, file_type)
    }
}

type Visitor<'v> = dyn FnMut(&mut DirentVisit<'_>) -> DirentAction + 'v;

#[derive(Debug, Default, Clone, Copy)]
struct BufferOutcome {
    changed: bool,
    abort: bool,
}

/// Where a record buffer came from, for error reporting and tail detection
#[derive(Debug, Clone, Copy)]
enum RecordArea {
    Block(BlockNumber),
    Hole,
    Inline,
}

impl RecordArea {
    fn block(self) -> BlockNumber {
        match self {
            RecordArea::Block(block) => block,
            RecordArea::Hole | RecordArea::Inline => 0,
        }
    }
}

/// A run of records between `offset` and `end` parses cleanly
fn validate_run(buf: &[u8], block_size: u32, mut offset: usize, end: usize) -> bool {
    while offset < end && offset + 12 <= buf.len() {
        let header = DirEntryHeader::read(buf, offset, block_size);
        let rec_len = header.rec_len as usize;
        offset += rec_len;
        if rec_len < 8 || rec_len % 4 != 0 || header.name_len as usize + 8 > rec_len {
            return false;
        }
    }
    offset == end
}

fn corrupted(dir: InodeNumber, area: RecordArea, detail: String) -> ExtError {
    ExtError::DirCorrupted {
        dir,
        block: area.block(),
        detail,
    }
}

/// Walk the records of one buffer, calling `visitor` on each one the flags
/// select. Every record is validated before the visitor sees it.
#[allow(clippy::too_many_arguments)]
fn process_records(
    dir: InodeNumber,
    area: RecordArea,
    buf: &mut [u8],
    buflen: usize,
    block_size: u32,
    first_kind: DirEntryKind,
    csum_size: usize,
    flags: DirIterFlags,
    visitor: &mut Visitor<'_>,
) -> ExtResult<BufferOutcome> {
    let mut outcome = BufferOutcome::default();
    if buflen < 8 {
        return Err(corrupted(dir, area, format!("record area of {} bytes", buflen)));
    }
    let mut kind = first_kind;
    let mut offset = 0usize;
    let mut next_real = 0usize;

    while offset < buflen - 8 {
        let header = DirEntryHeader::read(buf, offset, block_size);
        let mut rec_len = header.rec_len as usize;
        if offset + rec_len > buflen
            || rec_len < 8
            || rec_len % 4 != 0
            || header.name_len as usize + 8 > rec_len
        {
            return Err(corrupted(
                dir,
                area,
                format!(
                    "record at {} has rec_len {} name_len {}",
                    offset, rec_len, header.name_len
                ),
            ));
        }

        let mut visit_kind = Some(kind);
        if header.inode == 0 {
            let is_tail = matches!(area, RecordArea::Block(_))
                && csum_size > 0
                && offset == buflen - csum_size
                && header.is_csum_tail();
            if is_tail {
                visit_kind = flags.include_csum.then_some(DirEntryKind::Checksum);
            } else if !flags.include_empty {
                visit_kind = None;
            }
        }

        if let Some(entry_kind) = visit_kind {
            let entry_kind = if next_real > offset {
                DirEntryKind::Deleted
            } else {
                entry_kind
            };
            let mut visit = DirentVisit {
                dir,
                kind: entry_kind,
                offset,
                buflen,
                buf: &mut *buf,
                block_size,
            };
            let action = visitor(&mut visit);
            kind = match kind {
                DirEntryKind::Dot => DirEntryKind::DotDot,
                _ => DirEntryKind::Other,
            };
            if action.is_changed() {
                rec_len = DirEntryHeader::read(buf, offset, block_size).rec_len as usize;
                outcome.changed = true;
            }
            if action.is_abort() {
                outcome.abort = true;
                break;
            }
        }

        if next_real == offset {
            next_real += rec_len;
        }
        if flags.include_removed {
            let name_len = DirEntryHeader::read(buf, offset, block_size).name_len as usize;
            let size = dir_rec_len(name_len);
            if rec_len != size {
                let end = offset + rec_len;
                offset += size;
                while offset < end && !validate_run(&buf[..buflen], block_size, offset, end) {
                    offset += 4;
                }
                continue;
            }
        }
        if rec_len == 0 {
            return Err(corrupted(dir, area, format!("record at {} rewritten with rec_len 0", offset)));
        }
        offset += rec_len;
    }
    Ok(outcome)
}

impl ExtFilesystem {
    /// Read a directory block of directory `dir`, verifying its checksum
    /// tail when metadata checksums are on
    pub fn read_dir_block(&mut self, block: BlockNumber, dir: InodeNumber) -> ExtResult<Vec<u8>> {
        let generation = self.read_inode(dir)?.i_generation;
        let (buf, csum_ok) = self.read_dir_block_checked(block, dir, generation)?;
        if !csum_ok {
            return Err(ExtError::DirChecksumInvalid(block));
        }
        Ok(buf)
    }

    /// Raw read plus a checksum verdict; a block without a tail passes
    fn read_dir_block_checked(
        &mut self,
        block: BlockNumber,
        dir: InodeNumber,
        generation: u32,
    ) -> ExtResult<(Vec<u8>, bool)> {
        let bs = self.block_size();
        let mut buf = vec![0u8; bs as usize];
        self.read_block(block, &mut buf)?;
        let mut ok = true;
        if self.sb.has_metadata_csum()
            && !self.flags.ignore_csum_errors
            && dirent::has_dir_tail(&buf, bs)
            && !dirent::verify_dir_block_checksum(self.csum_seed(), dir, generation, &buf, bs)
        {
            warn!("Directory {} block {} fails its checksum", dir, block);
            ok = false;
        }
        Ok((buf, ok))
    }

    /// Call `visitor` on every record of directory `dir`, writing back any
    /// block the visitor changed. Inline directories are walked through
    /// their synthesized `.` and `..` records, the i_block area and the
    /// extended attribute overflow.
    pub fn dir_iterate<F>(&mut self, dir: InodeNumber, flags: DirIterFlags, mut visitor: F) -> ExtResult<()>
    where
        F: FnMut(&mut DirentVisit<'_>) -> DirentAction,
    {
        self.check_directory(dir)?;
        let inode = self.read_inode(dir)?;
        if inode.has_inline_data() {
            return self.inline_dir_iterate(dir, inode, flags, &mut visitor);
        }

        let bs = self.block_size();
        let csum_size = if self.sb.has_metadata_csum() {
            EXT4_DIR_TAIL_SIZE
        } else {
            0
        };
        let mappings = self.block_list(dir, &inode)?;
        let size_blocks = (inode.i_size + bs as u64 - 1) / bs as u64;
        let mut logical_blocks: Vec<(u64, Option<BlockNumber>)> =
            mappings.iter().map(|m| (m.logical, Some(m.physical))).collect();
        if flags.include_empty {
            let mut mapped = mappings.iter().map(|m| m.logical).peekable();
            for logical in 0..size_blocks {
                while mapped.peek().map_or(false, |&l| l < logical) {
                    mapped.next();
                }
                if mapped.peek() != Some(&logical) {
                    logical_blocks.push((logical, None));
                }
            }
            logical_blocks.sort_by_key(|&(logical, _)| logical);
        }

        let mut csum_error = None;
        for (logical, physical) in logical_blocks {
            let first_kind = if logical == 0 {
                DirEntryKind::Dot
            } else {
                DirEntryKind::Other
            };
            let (mut buf, area) = match physical {
                Some(block) => {
                    let (buf, ok) = self.read_dir_block_checked(block, dir, inode.i_generation)?;
                    if !ok && csum_error.is_none() {
                        csum_error = Some(block);
                    }
                    (buf, RecordArea::Block(block))
                }
                None => {
                    let mut buf = vec![0u8; bs as usize];
                    write_entry(&mut buf, 0, bs, 0, bs, b"", 0)?;
                    (buf, RecordArea::Hole)
                }
            };
            trace!("Directory {} logical block {} -> {:?}", dir, logical, physical);
            let outcome = process_records(
                dir,
                area,
                &mut buf,
                bs as usize,
                bs,
                first_kind,
                csum_size,
                flags,
                &mut visitor,
            )?;
            if outcome.changed {
                match physical {
                    Some(block) => self.write_dir_block(block, &mut buf, dir)?,
                    None => {
                        return Err(ExtError::InvalidArgument(format!(
                            "directory {} has a hole at logical block {}",
                            dir, logical
                        )))
                    }
                }
            }
            if outcome.abort {
                break;
            }
        }

        match csum_error {
            Some(block) => Err(ExtError::DirChecksumInvalid(block)),
            None => Ok(()),
        }
    }

    fn inline_dir_iterate(
        &mut self,
        dir: InodeNumber,
        mut inode: Inode,
        flags: DirIterFlags,
        visitor: &mut Visitor<'_>,
    ) -> ExtResult<()> {
        let bs = self.block_size();
        let file_type = if self.sb.has_incompat(EXT4_FEATURE_INCOMPAT_FILETYPE) {
            EXT4_FT_DIR
        } else {
            0
        };
        let synth_len = dir_rec_len(2);

        let mut dot = vec![0u8; synth_len];
        write_entry(&mut dot, 0, bs, dir, synth_len as u32, b".", file_type)?;
        let outcome = process_records(
            dir,
            RecordArea::Inline,
            &mut dot,
            synth_len,
            bs,
            DirEntryKind::Dot,
            0,
            flags,
            visitor,
        )?;
        if outcome.changed {
            return Err(ExtError::InvalidArgument(format!(
                "the . entry of inline directory {} is not stored",
                dir
            )));
        }
        if outcome.abort {
            return Ok(());
        }

        let mut i_block = inode.i_block_bytes();
        let mut dotdot = vec![0u8; synth_len];
        write_entry(&mut dotdot, 0, bs, le_u32(&i_block, 0), synth_len as u32, b"..", file_type)?;
        let outcome = process_records(
            dir,
            RecordArea::Inline,
            &mut dotdot,
            synth_len,
            bs,
            DirEntryKind::DotDot,
            0,
            flags,
            visitor,
        )?;
        if outcome.changed {
            put_le_u32(&mut i_block, 0, le_u32(&dotdot, 0));
            inode.set_i_block_bytes(&i_block);
            self.write_inode(dir, &inode)?;
        }
        if outcome.abort {
            return Ok(());
        }

        let area_len = EXT4_MIN_INLINE_DATA_SIZE - EXT4_INLINE_DATA_DOTDOT_SIZE;
        let outcome = process_records(
            dir,
            RecordArea::Inline,
            &mut i_block[EXT4_INLINE_DATA_DOTDOT_SIZE..EXT4_MIN_INLINE_DATA_SIZE],
            area_len,
            bs,
            DirEntryKind::Other,
            0,
            flags,
            visitor,
        )?;
        if outcome.changed {
            inode.set_i_block_bytes(&i_block);
            self.write_inode(dir, &inode)?;
        }
        if outcome.abort {
            return Ok(());
        }

        let mut overflow = self.inline_ea_get(dir, &inode)?;
        if overflow.is_empty() {
            return Ok(());
        }
        let len = overflow.len();
        let outcome = process_records(
            dir,
            RecordArea::Inline,
            &mut overflow,
            len,
            bs,
            DirEntryKind::Other,
            0,
            flags,
            visitor,
        )?;
        if outcome.changed {
            self.inline_ea_set(dir, &mut inode, &overflow)?;
            self.write_inode(dir, &inode)?;
        }
        Ok(())
    }

    /// Inode number of `name` in directory `dir`
    pub fn lookup(&mut self, dir: InodeNumber, name: &[u8]) -> ExtResult<Option<InodeNumber>> {
        let mut found = None;
        self.dir_iterate(dir, DirIterFlags::default(), |visit| {
            if visit.name() == name {
                found = Some(visit.header().inode);
                DirentAction::ABORT
            } else {
                DirentAction::CONTINUE
            }
        })?;
        Ok(found)
    }
}
