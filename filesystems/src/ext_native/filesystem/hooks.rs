// Caller-supplied overrides for inode I/O, block lookup, directory checks,
// block allocation and bitmap writeback.
//
// While a hook runs it is detached from the handle, so a hook that calls
// back into the same operation reaches the built-in implementation.

use super::ExtFilesystem;
use crate::ext_native::core::*;

/// Result of a hook: either it did the work or the built-in path runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hooked<T> {
    Handled(T),
    NotHandled,
}

/// Override points consulted before the built-in implementations.
///
/// Every method defaults to `NotHandled`.
pub trait FsHooks {
    fn read_inode(&mut self, _fs: &mut ExtFilesystem, _ino: InodeNumber) -> ExtResult<Hooked<Inode>> {
        Ok(Hooked::NotHandled)
    }

    fn write_inode(
        &mut self,
        _fs: &mut ExtFilesystem,
        _ino: InodeNumber,
        _inode: &Inode,
    ) -> ExtResult<Hooked<()>> {
        Ok(Hooked::NotHandled)
    }

    /// The 15 i_block slots of `ino`
    fn get_blocks(&mut self, _fs: &mut ExtFilesystem, _ino: InodeNumber) -> ExtResult<Hooked<[u32; EXT4_N_BLOCKS]>> {
        Ok(Hooked::NotHandled)
    }

    /// Confirm `ino` is a directory
    fn check_directory(&mut self, _fs: &mut ExtFilesystem, _ino: InodeNumber) -> ExtResult<Hooked<()>> {
        Ok(Hooked::NotHandled)
    }

    fn alloc_block(&mut self, _fs: &mut ExtFilesystem, _goal: BlockNumber) -> ExtResult<Hooked<BlockNumber>> {
        Ok(Hooked::NotHandled)
    }

    fn write_bitmaps(&mut self, _fs: &mut ExtFilesystem) -> ExtResult<Hooked<()>> {
        Ok(Hooked::NotHandled)
    }
}

impl ExtFilesystem {
    /// Run `f` against the installed hooks with the hooks detached
    pub(crate) fn with_hooks<T>(
        &mut self,
        f: impl FnOnce(&mut dyn FsHooks, &mut ExtFilesystem) -> ExtResult<Hooked<T>>,
    ) -> ExtResult<Hooked<T>> {
        let mut hooks = match self.hooks.take() {
            Some(hooks) => hooks,
            None => return Ok(Hooked::NotHandled),
        };
        let result = f(hooks.as_mut(), self);
        // A hook may install replacement hooks; keep those
        if self.hooks.is_none() {
            self.hooks = Some(hooks);
        }
        result
    }

    /// i_block of `ino`, from the get_blocks hook when it answers
    pub fn get_blocks(&mut self, ino: InodeNumber) -> ExtResult<[u32; EXT4_N_BLOCKS]> {
        if !self.suppress_get_blocks {
            if let Hooked::Handled(blocks) = self.with_hooks(|h, fs| h.get_blocks(fs, ino))? {
                return Ok(blocks);
            }
        }
        Ok(self.read_inode(ino)?.i_block)
    }

    /// Fail with `NotADirectory` unless `ino` is a directory
    pub fn check_directory(&mut self, ino: InodeNumber) -> ExtResult<()> {
        if let Hooked::Handled(()) = self.with_hooks(|h, fs| h.check_directory(fs, ino))? {
            return Ok(());
        }
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(ExtError::BadInodeNumber(ino));
        }
        if !self.read_inode(ino)?.is_dir() {
            return Err(ExtError::NotADirectory(ino));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_native::filesystem::initialize::initialize;
    use e2kit_core::{MemoryChannel, OpenOptions};
    use std::cell::Cell;
    use std::rc::Rc;

    struct FakeRoot {
        calls: Rc<Cell<u32>>,
    }

    impl FsHooks for FakeRoot {
        fn read_inode(&mut self, fs: &mut ExtFilesystem, ino: InodeNumber) -> ExtResult<Hooked<Inode>> {
            self.calls.set(self.calls.get() + 1);
            if ino != EXT4_ROOT_INO {
                return Ok(Hooked::NotHandled);
            }
            // Re-entering reaches the built-in reader
            let mut inode = fs.read_inode(ino)?;
            inode.i_uid = 4242;
            Ok(Hooked::Handled(inode))
        }

        fn get_blocks(&mut self, _fs: &mut ExtFilesystem, ino: InodeNumber) -> ExtResult<Hooked<[u32; EXT4_N_BLOCKS]>> {
            if ino == 12 {
                let mut blocks = [0u32; EXT4_N_BLOCKS];
                blocks[0] = 777;
                return Ok(Hooked::Handled(blocks));
            }
            Ok(Hooked::NotHandled)
        }
    }

    #[test]
    fn test_hooks_override_and_fall_back() {
        let channel = MemoryChannel::new(8192 * 1024);
        initialize(Box::new(channel.clone()), &FsParams::default()).unwrap();
        let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::default()).unwrap();

        let calls = Rc::new(Cell::new(0));
        fs.set_hooks(Some(Box::new(FakeRoot { calls: calls.clone() })));

        assert_eq!(fs.read_inode(EXT4_ROOT_INO).unwrap().i_uid, 4242);
        assert_eq!(calls.get(), 1);
        assert_eq!(fs.read_inode(11).unwrap().i_uid, 0);
        assert_eq!(calls.get(), 2);

        assert_eq!(fs.get_blocks(12).unwrap()[0], 777);
        fs.suppress_get_blocks = true;
        assert_eq!(fs.get_blocks(12).unwrap()[0], 0);

        fs.check_directory(EXT4_ROOT_INO).unwrap();
        assert!(matches!(fs.check_directory(12), Err(ExtError::NotADirectory(12))));
    }
}
