// Walks over inode tables and directory contents

pub mod dir_iterate;
pub mod inode_scan;

pub use dir_iterate::{DirEntryKind, DirIterFlags, DirentAction, DirentVisit};
pub use inode_scan::{DoneGroupFn, InodeScan, ScanFlags, ScanStatus, ScannedInode};
