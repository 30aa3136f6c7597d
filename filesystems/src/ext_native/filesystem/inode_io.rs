// Inode table reads and writes with a small per-handle cache

use super::hooks::Hooked;
use super::ExtFilesystem;
use crate::ext_native::core::*;
use log::{trace, warn};

/// Round-robin cache of recently read inodes
#[derive(Debug, Clone)]
pub struct InodeCache {
    slots: Vec<Option<(InodeNumber, Inode)>>,
    last: usize,
}

impl InodeCache {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            last: 0,
        }
    }

    pub fn get(&self, ino: InodeNumber) -> Option<&Inode> {
        self.slots
            .iter()
            .flatten()
            .find(|(cached, _)| *cached == ino)
            .map(|(_, inode)| inode)
    }

    pub fn insert(&mut self, ino: InodeNumber, inode: Inode) {
        if self.slots.is_empty() {
            return;
        }
        if let Some(slot) = self.slots.iter_mut().flatten().find(|(cached, _)| *cached == ino) {
            slot.1 = inode;
            return;
        }
        self.last = (self.last + 1) % self.slots.len();
        self.slots[self.last] = Some((ino, inode));
    }

    /// Refresh an entry only if `ino` is already cached
    pub fn update(&mut self, ino: InodeNumber, inode: &Inode) {
        if let Some(slot) = self.slots.iter_mut().flatten().find(|(cached, _)| *cached == ino) {
            slot.1 = inode.clone();
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

impl ExtFilesystem {
    /// Byte offset of inode `ino` in the image
    pub fn inode_offset(&self, ino: InodeNumber) -> ExtResult<u64> {
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(ExtError::BadInodeNumber(ino));
        }
        let group = self.group_of_ino(ino);
        if group >= self.group_desc_count() {
            return Err(ExtError::BadInodeNumber(ino));
        }
        let table = self.inode_table_loc(group)?;
        let index = ((ino - 1) % self.sb.s_inodes_per_group) as u64;
        Ok(table * self.block_size() as u64 + index * self.inode_size() as u64)
    }

    /// Read inode `ino`, verifying its checksum
    pub fn read_inode(&mut self, ino: InodeNumber) -> ExtResult<Inode> {
        self.read_inode_full(ino, true)
    }

    /// Read inode `ino`; with `verify` false a checksum mismatch is ignored
    pub fn read_inode_full(&mut self, ino: InodeNumber, verify: bool) -> ExtResult<Inode> {
        if let Hooked::Handled(inode) = self.with_hooks(|h, fs| h.read_inode(fs, ino))? {
            return Ok(inode);
        }
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(ExtError::BadInodeNumber(ino));
        }
        if let Some(inode) = self.icache.get(ino) {
            return Ok(inode.clone());
        }

        let offset = self.inode_offset(ino)?;
        let mut buf = vec![0u8; self.inode_size()];
        self.io.read_at(offset, &mut buf)?;
        let inode = Inode::decode(&buf, self.endian);

        if inode.verify_checksum(&self.sb, ino) {
            self.icache.insert(ino, inode.clone());
        } else if verify && !self.flags.ignore_csum_errors {
            return Err(ExtError::InodeChecksumInvalid(ino));
        } else {
            trace!("Inode {} checksum mismatch ignored", ino);
        }
        Ok(inode)
    }

    /// Write inode `ino`, refreshing its checksum.
    ///
    /// An inode carrying fewer bytes than the on-disk inode size keeps the
    /// on-disk extra fields.
    pub fn write_inode(&mut self, ino: InodeNumber, inode: &Inode) -> ExtResult<()> {
        if let Hooked::Handled(()) = self.with_hooks(|h, fs| h.write_inode(fs, ino, inode))? {
            return Ok(());
        }
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(ExtError::BadInodeNumber(ino));
        }
        self.require_rw()?;

        let inode_size = self.inode_size();
        let mut full = inode.clone();
        if full.raw_size() < inode_size {
            let on_disk = self.read_inode_full(ino, false)?;
            let keep = full.raw_size().max(EXT4_GOOD_OLD_INODE_SIZE as usize) - EXT4_GOOD_OLD_INODE_SIZE as usize;
            full.resize_raw(inode_size);
            let tail = &on_disk.extra_bytes()[keep..];
            full.extra_bytes_mut()[keep..].copy_from_slice(tail);
            full.i_extra_isize = on_disk.i_extra_isize;
        }
        full.update_checksum(&self.sb, ino);

        let offset = self.inode_offset(ino)?;
        let bytes = full.encode(inode_size, self.endian);
        self.icache.update(ino, &full);
        self.io.write_at(offset, &bytes)?;
        self.flags.changed = true;
        Ok(())
    }

    /// Write a freshly built inode, zeroing the extra area and setting
    /// i_extra_isize for large inodes
    pub fn write_new_inode(&mut self, ino: InodeNumber, inode: &Inode) -> ExtResult<()> {
        let inode_size = self.inode_size();
        let mut fresh = inode.clone();
        fresh.resize_raw(inode_size);
        if inode_size > EXT4_GOOD_OLD_INODE_SIZE as usize {
            fresh.extra_bytes_mut().fill(0);
            fresh.i_extra_isize = EXT4_INODE_LARGE_EXTRA_ISIZE;
        }
        if fresh.i_ctime == 0 {
            fresh.i_ctime = self.now();
        }
        if fresh.i_mtime == 0 {
            fresh.i_mtime = fresh.i_ctime;
        }
        if fresh.i_atime == 0 {
            fresh.i_atime = fresh.i_ctime;
        }
        self.write_inode(ino, &fresh)
    }

    /// Set i_size, turning on large_file when a regular file crosses 2GiB
    pub fn inode_size_set(&mut self, inode: &mut Inode, size: u64) {
        if size > 0x7FFF_FFFF
            && inode.is_reg()
            && !self.sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_LARGE_FILE)
        {
            warn!("Enabling large_file for a {} byte file", size);
            self.sb.s_feature_ro_compat |= EXT4_FEATURE_RO_COMPAT_LARGE_FILE;
            self.mark_super_dirty();
        }
        inode.i_size = size;
    }

    pub fn flush_inode_cache(&mut self) {
        self.icache.clear();
    }
}
