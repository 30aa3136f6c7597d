// User-space ext2/ext3/ext4 library

pub mod core;
pub mod filesystem;
pub mod reader;
pub mod writer;

pub use self::core::{Bitmap, BitmapKind, BadBlocksList, FsParams, Inode, Superblock, GroupDesc};
pub use self::filesystem::initialize::initialize;
pub use self::filesystem::{ExtFilesystem, FsFlags, FsHooks, Hooked};
pub use self::reader::{DirEntryKind, DirIterFlags, DirentAction, DirentVisit, InodeScan, ScanFlags, ScanStatus};
pub use self::writer::RelocationTable;
