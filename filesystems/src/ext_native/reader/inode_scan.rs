// Sequential scan over every group's inode table
//
// The cursor reads several inode table blocks at a time, skips groups the
// descriptors mark as uninitialised, and keeps going past bad blocks in the
// inode table by handing back zeroed inodes flagged as such.

use crate::ext_native::core::*;
use crate::ext_native::filesystem::ExtFilesystem;
use log::{debug, warn};

/// Called with the number of each group once its inodes are exhausted
pub type DoneGroupFn = Box<dyn FnMut(&mut ExtFilesystem, GroupNumber) -> ExtResult<()>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFlags {
    /// Skip groups without an inode table instead of failing
    pub skip_missing_itable: bool,
    /// Skip INODE_UNINIT groups (on by default when descriptors carry checksums)
    pub do_lazy: bool,
}

/// Advisory condition attached to a scanned inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Ok,
    /// The inode lies in a known bad block; its contents are zeroed
    BadBlockInInodeTable,
    ChecksumInvalid,
}

#[derive(Debug, Clone)]
pub struct ScannedInode {
    /// 0 once the scan is over
    pub ino: InodeNumber,
    pub inode: Inode,
    pub status: ScanStatus,
}

impl ScannedInode {
    pub fn is_end(&self) -> bool {
        self.ino == 0
    }
}

/// Position in the sorted bad block list, advanced as the scan moves
/// through the inode tables
#[derive(Debug, Clone, Default)]
struct BadBlockCursor {
    blocks: Vec<BlockNumber>,
    next: usize,
}

impl BadBlockCursor {
    fn new(list: Option<&BadBlocksList>) -> Self {
        Self {
            blocks: list.map(|l| l.as_slice().to_vec()).unwrap_or_default(),
            next: 0,
        }
    }

    fn reset(&mut self) {
        self.next = 0;
    }

    /// Shrink a read of `count` blocks at `block` so it stops at the next
    /// bad block; a read starting on a bad block covers just that block
    fn clamp(&mut self, block: BlockNumber, count: u64) -> (u64, bool) {
        while self.next < self.blocks.len() && self.blocks[self.next] < block {
            self.next += 1;
        }
        let bad = match self.blocks.get(self.next) {
            Some(&bad) => bad,
            None => return (count, false),
        };
        if bad == block {
            self.next += 1;
            return (1, true);
        }
        if block + count > bad {
            return (bad - block, false);
        }
        (count, false)
    }
}

pub struct InodeScan {
    buffer: Vec<u8>,
    /// Holds an inode split across two buffer refills
    temp: Vec<u8>,
    ptr: usize,
    bytes_left: usize,
    buffer_blocks: u64,
    inode_size: usize,
    current_group: GroupNumber,
    groups_left: u32,
    current_block: BlockNumber,
    current_inode: InodeNumber,
    inodes_left: u32,
    blocks_left: u64,
    flags: ScanFlags,
    bad_blocks: BadBlockCursor,
    /// The buffer holds a bad block
    bad_inode_blk: bool,
    /// Leftover bytes carried into the next refill came from a bad block
    bad_extra_bytes: bool,
    done: bool,
    done_group: Option<DoneGroupFn>,
}

impl InodeScan {
    /// Start a scan at the first inode of group 0. `buffer_blocks` of 0
    /// picks the default read-ahead.
    pub fn open(fs: &mut ExtFilesystem, buffer_blocks: u32) -> ExtResult<Self> {
        if fs.badblocks().is_none() {
            fs.suppress_get_blocks = true;
            let list = fs.read_bb_inode();
            fs.suppress_get_blocks = false;
            match list {
                Ok(list) => fs.set_badblocks(Some(list)),
                Err(e) => warn!("Could not read the bad blocks inode: {}", e),
            }
        }

        let buffer_blocks = if buffer_blocks == 0 {
            EXT4_DEFAULT_SCAN_BUFFER_BLOCKS
        } else {
            buffer_blocks
        } as u64;
        let inode_size = fs.inode_size();
        let mut scan = Self {
            buffer: vec![0u8; buffer_blocks as usize * fs.block_size() as usize],
            temp: vec![0u8; inode_size],
            ptr: 0,
            bytes_left: 0,
            buffer_blocks,
            inode_size,
            current_group: 0,
            groups_left: fs.group_desc_count() - 1,
            current_block: 0,
            current_inode: 0,
            inodes_left: 0,
            blocks_left: 0,
            flags: ScanFlags {
                skip_missing_itable: false,
                do_lazy: fs.has_group_desc_csum(),
            },
            bad_blocks: BadBlockCursor::new(fs.badblocks()),
            bad_inode_blk: false,
            bad_extra_bytes: false,
            done: false,
            done_group: None,
        };
        scan.setup_group(fs, 0)?;
        debug!(
            "Inode scan over {} groups, {} block read-ahead, {} bad blocks",
            fs.group_desc_count(),
            buffer_blocks,
            scan.bad_blocks.blocks.len()
        );
        Ok(scan)
    }

    pub fn flags(&self) -> ScanFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ScanFlags) {
        self.flags = flags;
    }

    pub fn set_done_group(&mut self, callback: Option<DoneGroupFn>) {
        self.done_group = callback;
    }

    pub fn current_group(&self) -> GroupNumber {
        self.current_group
    }

    fn setup_group(&mut self, fs: &ExtFilesystem, group: GroupNumber) -> ExtResult<()> {
        let ipg = fs.sb.s_inodes_per_group;
        let block_size = fs.block_size() as u64;
        self.current_group = group;
        self.current_block = fs.group_desc[group as usize].inode_table;
        self.current_inode = group * ipg;
        self.ptr = 0;
        self.bytes_left = 0;
        self.bad_inode_blk = false;
        self.bad_extra_bytes = false;
        self.inodes_left = ipg;
        self.blocks_left = fs.inode_blocks_per_group() as u64;
        if fs.has_group_desc_csum() {
            let unused = fs.group_desc[group as usize].itable_unused;
            self.inodes_left = ipg.saturating_sub(unused);
            let per_block = block_size / self.inode_size as u64;
            self.blocks_left = (self.inodes_left as u64 + per_block - 1) / per_block;
        }
        if self.current_block != 0
            && (self.current_block < fs.sb.s_first_data_block as u64
                || self.current_block + fs.inode_blocks_per_group() as u64 - 1 >= fs.sb.blocks_count())
        {
            return Err(ExtError::GroupDescBadInodeTable { group });
        }
        Ok(())
    }

    fn next_blockgroup(&mut self, fs: &ExtFilesystem) -> ExtResult<()> {
        self.groups_left -= 1;
        self.setup_group(fs, self.current_group + 1)
    }

    /// Jump to the first inode of `group`
    pub fn goto_blockgroup(&mut self, fs: &ExtFilesystem, group: GroupNumber) -> ExtResult<()> {
        if group >= fs.group_desc_count() {
            return Err(ExtError::InvalidArgument(format!("no group {}", group)));
        }
        self.groups_left = fs.group_desc_count() - group - 1;
        self.bad_blocks.reset();
        self.done = false;
        self.setup_group(fs, group)
    }

    fn next_blocks(&mut self, fs: &mut ExtFilesystem) -> ExtResult<()> {
        let block_size = fs.block_size() as usize;
        let mut num = self.buffer_blocks.min(self.blocks_left);

        if self.bad_inode_blk {
            if self.bytes_left > 0 {
                self.bad_extra_bytes = true;
            }
            self.bad_inode_blk = false;
        }
        if self.current_block != 0 {
            let (clamped, bad) = self.bad_blocks.clamp(self.current_block, num);
            num = clamped;
            self.bad_inode_blk = bad;
        }

        let len = num as usize * block_size;
        if self.bad_inode_blk || self.current_block == 0 {
            if self.bad_inode_blk {
                warn!(
                    "Bad block {} in the inode table of group {}",
                    self.current_block, self.current_group
                );
            }
            self.buffer[..len].fill(0);
        } else {
            fs.channel().read_blocks(self.current_block, num as usize, &mut self.buffer[..len])?;
        }
        self.ptr = 0;
        self.bytes_left = len;
        self.blocks_left -= num;
        if self.current_block != 0 {
            self.current_block += num;
        }
        Ok(())
    }

    /// The next inode in number order. Returns an inode number of 0 once
    /// every group is exhausted, and keeps doing so on later calls.
    pub fn next_inode(&mut self, fs: &mut ExtFilesystem) -> ExtResult<ScannedInode> {
        if self.done {
            return Ok(self.end_of_scan());
        }
        let mut force_new_group = false;
        loop {
            if self.inodes_left == 0 || force_new_group {
                force_new_group = false;
                if let Some(callback) = self.done_group.as_mut() {
                    callback(fs, self.current_group)?;
                }
                if self.groups_left == 0 {
                    self.done = true;
                    return Ok(self.end_of_scan());
                }
                self.next_blockgroup(fs)?;
                continue;
            }
            let group = self.current_group;
            if self.flags.do_lazy && fs.group_desc[group as usize].has_flag(EXT4_BG_INODE_UNINIT) {
                force_new_group = true;
                continue;
            }
            if self.current_block == 0 && self.bytes_left == 0 && self.blocks_left > 0 {
                if self.flags.skip_missing_itable {
                    force_new_group = true;
                    continue;
                }
                return Err(ExtError::MissingInodeTable(group));
            }
            break;
        }

        let inode_size = self.inode_size;
        let mut extra = 0;
        if self.bytes_left < inode_size {
            extra = self.bytes_left;
            if extra > 0 {
                self.temp[..extra].copy_from_slice(&self.buffer[self.ptr..self.ptr + extra]);
            }
            self.next_blocks(fs)?;
            if self.bytes_left < inode_size - extra {
                return Err(ExtError::GroupDescBadInodeTable {
                    group: self.current_group,
                });
            }
        }

        let endian = fs.endian();
        let (inode, bad) = if extra > 0 {
            let need = inode_size - extra;
            self.temp[extra..].copy_from_slice(&self.buffer[self.ptr..self.ptr + need]);
            self.ptr += need;
            self.bytes_left -= need;
            let bad = self.bad_extra_bytes || self.bad_inode_blk;
            self.bad_extra_bytes = false;
            (Inode::decode(&self.temp, endian), bad)
        } else {
            let inode = Inode::decode(&self.buffer[self.ptr..self.ptr + inode_size], endian);
            self.ptr += inode_size;
            self.bytes_left -= inode_size;
            (inode, self.bad_inode_blk)
        };

        self.inodes_left -= 1;
        self.current_inode += 1;
        let ino = self.current_inode;
        let status = if bad {
            ScanStatus::BadBlockInInodeTable
        } else if !fs.flags.ignore_csum_errors && !inode.verify_checksum(&fs.sb, ino) {
            ScanStatus::ChecksumInvalid
        } else {
            ScanStatus::Ok
        };
        Ok(ScannedInode { ino, inode, status })
    }

    fn end_of_scan(&self) -> ScannedInode {
        ScannedInode {
            ino: 0,
            inode: Inode::new(self.inode_size),
            status: ScanStatus::Ok,
        }
    }

    /// Iterate until the end of the scan
    pub fn iter<'a>(&'a mut self, fs: &'a mut ExtFilesystem) -> InodeScanIter<'a> {
        InodeScanIter { scan: self, fs, failed: false }
    }
}

pub struct InodeScanIter<'a> {
    scan: &'a mut InodeScan,
    fs: &'a mut ExtFilesystem,
    failed: bool,
}

impl Iterator for InodeScanIter<'_> {
    type Item = ExtResult<ScannedInode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.scan.next_inode(self.fs) {
            Ok(scanned) if scanned.is_end() => None,
            Ok(scanned) => Some(Ok(scanned)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
