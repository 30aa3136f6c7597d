use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read at byte {offset}: wanted {wanted}, got {got}")]
    ShortRead { offset: u64, wanted: usize, got: usize },

    #[error("Operation not implemented by I/O channel: {0}")]
    Unimplemented(&'static str),

    #[error("Bad superblock magic: 0x{0:04X}")]
    BadMagic(u16),

    #[error("Filesystem revision too high: {0}")]
    RevTooHigh(u32),

    #[error("Corrupt superblock: {0}")]
    CorruptSuperblock(String),

    #[error("Superblock checksum does not match")]
    SuperblockChecksumInvalid,

    #[error("Group descriptor {0} checksum does not match")]
    GroupDescChecksumInvalid(u32),

    #[error("Group {group} has an inode table outside the group")]
    GroupDescBadInodeTable { group: u32 },

    #[error("Group {0} has no inode table")]
    MissingInodeTable(u32),

    #[error("Illegal inode number: {0}")]
    BadInodeNumber(u32),

    #[error("Illegal block number: {0}")]
    BadBlockNumber(u64),

    #[error("Bitmap checksum of group {0} does not match")]
    BitmapChecksumInvalid(u32),

    #[error("Inode {0} checksum does not match")]
    InodeChecksumInvalid(u32),

    #[error("Bad block {0} found in inode table")]
    BadBlockInInodeTable(u64),

    #[error("Directory {dir} corrupted at block {block}: {detail}")]
    DirCorrupted { dir: u32, block: u64, detail: String },

    #[error("Directory block {0} checksum does not match")]
    DirChecksumInvalid(u64),

    #[error("Inode {0} is not a directory")]
    NotADirectory(u32),

    #[error("Inline data directory cannot be iterated without inline support")]
    InlineDataCantIterate,

    #[error("Inode {0} has no inline data")]
    NoInlineData(u32),

    #[error("No room for inline data in inode {0}")]
    InlineDataNoSpace(u32),

    #[error("Extended attribute area of inode {0} is corrupt")]
    XattrCorrupted(u32),

    #[error("No space for extended attributes in inode {0}")]
    XattrNoSpace(u32),

    #[error("Extent tree of inode {ino} is corrupt: {detail}")]
    ExtentCorrupted { ino: u32, detail: String },

    #[error("Resize inode is corrupt: {0}")]
    ResizeInodeCorrupt(String),

    #[error("Bitmap position {pos} outside [{start}, {end}]")]
    BitmapOutOfRange { pos: u64, start: u64, end: u64 },

    #[error("Block and inode bitmaps are not loaded")]
    BitmapsNotLoaded,

    #[error("Could not allocate block")]
    BlockAllocFail,

    #[error("Could not allocate inode")]
    InodeAllocFail,

    #[error("No free space in directory {0}")]
    DirNoSpace(u32),

    #[error("Directory {dir} already has an entry named {name}")]
    DirEntryExists { dir: u32, name: String },

    #[error("Filesystem opened read-only")]
    ReadOnly,

    #[error("Relocation of block {old} conflicts with an existing entry")]
    RelocationConflict { old: u64 },

    #[error("Relocation cycle through blocks {0:?}")]
    RelocationCycle(Vec<u64>),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, ExtError>;

impl ExtError {
    /// True for the structural corruption family callers may want to repair.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ExtError::CorruptSuperblock(_)
                | ExtError::SuperblockChecksumInvalid
                | ExtError::GroupDescChecksumInvalid(_)
                | ExtError::GroupDescBadInodeTable { .. }
                | ExtError::MissingInodeTable(_)
                | ExtError::BitmapChecksumInvalid(_)
                | ExtError::InodeChecksumInvalid(_)
                | ExtError::DirCorrupted { .. }
                | ExtError::DirChecksumInvalid(_)
                | ExtError::XattrCorrupted(_)
                | ExtError::ExtentCorrupted { .. }
                | ExtError::ResizeInodeCorrupt(_)
        )
    }
}
