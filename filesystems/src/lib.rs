// Native ext2/ext3/ext4 support, independent of any kernel driver
pub mod ext_native;

// Re-export the filesystem handle and its walkers
pub use ext_native::{
    initialize, BadBlocksList, Bitmap, BitmapKind, DirEntryKind, DirIterFlags, DirentAction,
    DirentVisit, ExtFilesystem, FsFlags, FsHooks, FsParams, GroupDesc, Hooked, Inode, InodeScan,
    RelocationTable, ScanFlags, ScanStatus, Superblock,
};
pub use ext_native::core::{ExtError, ExtResult};
pub use e2kit_core::{FileChannel, IoChannel, MemoryChannel, OpenOptions};
