// Block device abstraction shared by every filesystem component

use crate::error::{ExtError, Result};
use log::debug;
use std::cell::RefCell;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

/// Default block size of a freshly opened channel, before the superblock is known
pub const DEFAULT_CHANNEL_BLOCK_SIZE: u32 = 1024;

/// Read/write access to a device in units of blocks.
///
/// The filesystem code never touches files directly; everything goes through
/// one of these. Implementations are single threaded and blocking.
pub trait IoChannel {
    fn name(&self) -> &str;

    fn block_size(&self) -> u32;

    fn set_block_size(&mut self, block_size: u32);

    /// Read exactly `buf.len()` bytes starting at byte `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` starting at byte `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn read_blocks(&mut self, block: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let len = count * self.block_size() as usize;
        if buf.len() < len {
            return Err(ExtError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold {} blocks",
                buf.len(),
                count
            )));
        }
        let offset = block * self.block_size() as u64;
        self.read_at(offset, &mut buf[..len])
    }

    fn write_blocks(&mut self, block: u64, count: usize, buf: &[u8]) -> Result<()> {
        let len = count * self.block_size() as usize;
        if buf.len() < len {
            return Err(ExtError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold {} blocks",
                buf.len(),
                count
            )));
        }
        let offset = block * self.block_size() as u64;
        self.write_at(offset, &buf[..len])
    }

    /// Write a byte range without read-modify-write of the surrounding block.
    /// Channels that cannot do this return `Unimplemented` and callers fall
    /// back to whole-structure writes.
    fn write_byte(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        Err(ExtError::Unimplemented("write_byte"))
    }

    fn flush(&mut self) -> Result<()>;
}

/// Channel backed by a regular file or block device node
pub struct FileChannel {
    file: File,
    name: String,
    block_size: u32,
}

impl FileChannel {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, path.as_ref().to_string_lossy().to_string()))
    }

    pub fn from_file(file: File, name: String) -> Self {
        Self {
            file,
            name,
            block_size: DEFAULT_CHANNEL_BLOCK_SIZE,
        }
    }
}

impl IoChannel for FileChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut got = 0;
        while got < buf.len() {
            match self.file.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if got < buf.len() {
            buf[got..].fill(0);
            return Err(ExtError::ShortRead {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn write_byte(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(offset, data)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// How a recorded write reached the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Blocks,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub len: usize,
    pub kind: WriteKind,
}

struct MemoryState {
    data: Vec<u8>,
    writes: Vec<WriteRecord>,
    write_byte_enabled: bool,
    write_budget: Option<usize>,
    flushes: usize,
}

/// In-memory device image.
///
/// Clones share the same image, so a test can hand one clone to a
/// filesystem handle and keep another to inspect what was written.
#[derive(Clone)]
pub struct MemoryChannel {
    state: Rc<RefCell<MemoryState>>,
    block_size: u32,
}

impl MemoryChannel {
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                data,
                writes: Vec::new(),
                write_byte_enabled: true,
                write_budget: None,
                flushes: 0,
            })),
            block_size: DEFAULT_CHANNEL_BLOCK_SIZE,
        }
    }

    /// Copy of the current image contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.borrow().data.clone()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.borrow().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }

    pub fn flush_count(&self) -> usize {
        self.state.borrow().flushes
    }

    /// Make `write_byte` report `Unimplemented`, like a channel without
    /// byte-granular writes.
    pub fn set_write_byte_enabled(&self, enabled: bool) {
        self.state.borrow_mut().write_byte_enabled = enabled;
    }

    /// Allow only `budget` more writes; every write after that fails.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    fn record_write(&self, offset: u64, data: &[u8], kind: WriteKind) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(budget) = state.write_budget.as_mut() {
            if *budget == 0 {
                debug!("memory channel: write at {} rejected, budget exhausted", offset);
                return Err(std::io::Error::new(ErrorKind::Other, "device write budget exhausted").into());
            }
            *budget -= 1;
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > state.data.len() {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("write of {} bytes at {} past end of image", data.len(), offset),
            )
            .into());
        }
        state.data[start..end].copy_from_slice(data);
        state.writes.push(WriteRecord {
            offset,
            len: data.len(),
            kind,
        });
        Ok(())
    }
}

impl IoChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.borrow();
        let start = (offset as usize).min(state.data.len());
        let end = (start + buf.len()).min(state.data.len());
        let got = end - start;
        buf[..got].copy_from_slice(&state.data[start..end]);
        if got < buf.len() {
            buf[got..].fill(0);
            return Err(ExtError::ShortRead {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.record_write(offset, buf, WriteKind::Blocks)
    }

    fn write_byte(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.state.borrow().write_byte_enabled {
            return Err(ExtError::Unimplemented("write_byte"));
        }
        self.record_write(offset, data, WriteKind::Bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.state.borrow_mut().flushes += 1;
        Ok(())
    }
}
