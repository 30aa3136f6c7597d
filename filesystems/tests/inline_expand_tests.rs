// Inline directory expansion on a real image, including what an
// interrupted expansion leaves behind

use e2kit_filesystems::ext_native::core::*;
use e2kit_filesystems::{initialize, ExtFilesystem, InodeScan, MemoryChannel, OpenOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn inline_image() -> MemoryChannel {
    let base = FsParams::default();
    let params = FsParams {
        feature_incompat: base.feature_incompat
            | EXT4_FEATURE_INCOMPAT_INLINE_DATA
            | EXT4_FEATURE_INCOMPAT_EXTENTS,
        feature_ro_compat: base.feature_ro_compat | EXT4_FEATURE_RO_COMPAT_METADATA_CSUM,
        ..base
    };
    let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
    initialize(Box::new(channel.clone()), &params).unwrap();
    channel
}

fn open_rw(channel: &MemoryChannel) -> ExtFilesystem {
    let mut fs = ExtFilesystem::open(Box::new(channel.clone()), &OpenOptions::read_write()).unwrap();
    fs.read_bitmaps().unwrap();
    fs
}

/// An inline directory holding one entry, flushed to disk
fn inline_dir(channel: &MemoryChannel) -> InodeNumber {
    let mut fs = open_rw(channel);
    let dir = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"small"), true).unwrap();
    fs.link(dir, b"foo", 12, EXT4_FT_REG_FILE).unwrap();
    fs.close().unwrap();
    dir
}

#[test]
fn test_expand_survives_reopen() {
    init_logging();
    let channel = inline_image();
    let dir = inline_dir(&channel);

    let mut fs = open_rw(&channel);
    let free = fs.sb.free_blocks_count();
    fs.inline_data_expand(dir).unwrap();
    fs.close().unwrap();

    let mut fs = open_rw(&channel);
    let inode = fs.read_inode(dir).unwrap();
    assert!(!inode.has_inline_data());
    assert!(inode.has_flag(EXT4_EXTENTS_FL));
    let block = fs.bmap(dir, &inode, 0).unwrap().unwrap();
    assert!(fs.block_bitmap().unwrap().test(block).unwrap());
    assert_eq!(fs.sb.free_blocks_count(), free - 1);
    assert_eq!(fs.lookup(dir, b"foo").unwrap(), Some(12));
    assert_eq!(fs.lookup(dir, b"..").unwrap(), Some(EXT4_ROOT_INO));
    // The checksum tail was written with the block
    fs.read_dir_block(block, dir).unwrap();
}

#[test]
fn test_interrupted_before_inode_write_stays_inline() {
    init_logging();
    let channel = inline_image();
    let dir = inline_dir(&channel);

    let mut fs = open_rw(&channel);
    channel.set_write_budget(Some(1));
    assert!(matches!(fs.inline_data_expand(dir), Err(ExtError::Io(_))));
    drop(fs);
    channel.set_write_budget(None);

    let mut fs = open_rw(&channel);
    let inode = fs.read_inode(dir).unwrap();
    assert!(inode.has_inline_data());
    assert_eq!(fs.lookup(dir, b"foo").unwrap(), Some(12));
}

#[test]
fn test_interrupted_before_bitmap_write_is_detectable() {
    init_logging();
    let channel = inline_image();
    let dir = inline_dir(&channel);

    let mut fs = open_rw(&channel);
    channel.set_write_budget(Some(2));
    fs.inline_data_expand(dir).unwrap();
    // Lost before flush: the bitmap change never reaches the device
    drop(fs);
    channel.set_write_budget(None);

    let mut fs = open_rw(&channel);
    let inode = fs.read_inode(dir).unwrap();
    assert!(!inode.has_inline_data());
    let block = fs.bmap(dir, &inode, 0).unwrap().unwrap();
    assert!(!fs.block_bitmap().unwrap().test(block).unwrap());
}

#[test]
fn test_resize_inode_visible_to_scan_and_backups() {
    init_logging();
    let params = FsParams {
        blocks_per_group: 1024,
        reserved_gdt_blocks: 4,
        feature_compat: FsParams::default().feature_compat | EXT4_FEATURE_COMPAT_RESIZE_INODE,
        ..Default::default()
    };
    let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
    initialize(Box::new(channel.clone()), &params).unwrap();

    let mut fs = ExtFilesystem::open(Box::new(channel.clone()), &OpenOptions::default()).unwrap();
    assert_eq!(fs.sb.s_reserved_gdt_blocks, 4);
    let mut scan = InodeScan::open(&mut fs, 8).unwrap();
    let resize = scan
        .iter(&mut fs)
        .map(|item| item.unwrap())
        .find(|scanned| scanned.ino == EXT4_RESIZE_INO)
        .unwrap();
    assert!(resize.inode.is_reg());
    assert_ne!(resize.inode.i_block[EXT4_DIND_BLOCK], 0);

    // The backup in group 1 describes the same layout
    let options = OpenOptions {
        superblock: Some(1025),
        block_size: Some(1024),
        ..Default::default()
    };
    let mut backup = ExtFilesystem::open(Box::new(channel), &options).unwrap();
    assert_eq!(backup.sb.s_reserved_gdt_blocks, 4);
    let from_backup = backup.read_inode(EXT4_RESIZE_INO).unwrap();
    assert_eq!(from_backup.i_block, resize.inode.i_block);
}
