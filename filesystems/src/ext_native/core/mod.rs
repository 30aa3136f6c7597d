// On-disk formats and in-memory primitives shared by every component

pub mod badblocks;
pub mod bitmap;
pub mod checksum;
pub mod constants;
pub mod dirent;
pub mod endian;
pub mod extent;
pub mod inode;
pub mod structures;
pub mod types;
pub mod xattr;

// Re-export commonly used items
pub use badblocks::BadBlocksList;
pub use bitmap::{Bitmap, BitmapKind};
pub use constants::*;
pub use endian::Endian;
pub use inode::Inode;
pub use structures::{GroupDesc, Superblock};
pub use types::*;
