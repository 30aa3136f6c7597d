// Whole-image tests: build a filesystem, reopen it, and check what reached
// the device

use e2kit_filesystems::ext_native::core::dirent::DirEntryHeader;
use e2kit_filesystems::ext_native::core::*;
use e2kit_filesystems::ext_native::reader::DirEntryKind;
use e2kit_filesystems::{
    initialize, DirIterFlags, DirentAction, ExtFilesystem, FileChannel, InodeScan, MemoryChannel,
    OpenOptions, ScanStatus,
};
use e2kit_core::WriteKind;
use std::io::Write;
use tempfile::NamedTempFile;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn image(params: &FsParams) -> MemoryChannel {
    let channel = MemoryChannel::new((params.blocks_count * params.block_size as u64) as usize);
    initialize(Box::new(channel.clone()), params).unwrap();
    channel
}

fn open(channel: &MemoryChannel, options: &OpenOptions) -> ExtFilesystem {
    ExtFilesystem::open(Box::new(channel.clone()), options).unwrap()
}

fn many_groups() -> FsParams {
    FsParams {
        blocks_count: 16384,
        blocks_per_group: 256,
        inodes_per_group: 32,
        ..Default::default()
    }
}

#[test]
fn test_scan_visits_every_inode_once() {
    init_logging();
    let params = many_groups();
    let channel = image(&params);
    let mut fs = open(&channel, &OpenOptions::default());
    assert_eq!(fs.group_desc_count(), 64);

    let mut scan = InodeScan::open(&mut fs, 8).unwrap();
    let mut expected = 1;
    let mut dirs = Vec::new();
    for item in scan.iter(&mut fs) {
        let scanned = item.unwrap();
        assert_eq!(scanned.ino, expected);
        assert_eq!(scanned.status, ScanStatus::Ok);
        if scanned.inode.is_dir() && scanned.inode.i_links_count > 0 {
            dirs.push(scanned.ino);
        }
        expected += 1;
    }
    assert_eq!(expected - 1, 64 * 32);
    assert_eq!(dirs, vec![EXT4_ROOT_INO, 11]);
    assert!(scan.next_inode(&mut fs).unwrap().is_end());
}

#[test]
fn test_backup_superblocks_on_sparse_groups() {
    init_logging();
    let params = many_groups();
    let channel = image(&params);
    let data = channel.snapshot();
    let backups = [1u32, 3, 5, 7, 9, 25, 27, 49];

    for group in 1..64u32 {
        let block = 1 + group as usize * 256;
        let raw = &data[block * 1024..block * 1024 + SUPERBLOCK_SIZE];
        let sb = Superblock::decode(raw, Endian::Little);
        if backups.contains(&group) {
            assert_eq!(sb.s_magic, EXT4_SUPER_MAGIC, "group {}", group);
            assert_eq!(sb.s_block_group_nr as u32, group);
            // Backups are stamped not clean
            assert_eq!(sb.s_state & EXT4_VALID_FS, 0);
        } else {
            assert_ne!(sb.s_magic, EXT4_SUPER_MAGIC, "group {}", group);
        }
    }

    // The primary stays clean and any backup opens
    let fs = open(&channel, &OpenOptions::default());
    assert_ne!(fs.sb.s_state & EXT4_VALID_FS, 0);
    let options = OpenOptions {
        superblock: Some(1 + 25 * 256),
        block_size: Some(1024),
        ..Default::default()
    };
    let backup = open(&channel, &options);
    assert_eq!(backup.sb.s_inodes_count, fs.sb.s_inodes_count);
    assert_eq!(backup.group_desc[63].inode_table, fs.group_desc[63].inode_table);
}

#[test]
fn test_flush_rewrites_only_changed_superblock_words() {
    init_logging();
    let channel = image(&FsParams::default());
    let options = OpenOptions {
        master_sb_only: true,
        super_only: true,
        ..OpenOptions::read_write()
    };
    let mut fs = open(&channel, &options);
    let wtime = fs.sb.s_wtime;
    fs.set_now(Some(wtime));
    fs.sb.s_mnt_count += 1;
    fs.mark_super_dirty();

    channel.clear_writes();
    fs.flush().unwrap();
    let writes = channel.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Bytes);
    assert_eq!(writes[0].offset, SUPERBLOCK_OFFSET + 0x34);
    assert_eq!(writes[0].len, 2);

    // Nothing left to write on a second flush
    channel.clear_writes();
    fs.flush().unwrap();
    assert!(channel.writes().is_empty());

    let fs = open(&channel, &OpenOptions::default());
    assert_eq!(fs.sb.s_wtime, wtime);
}

#[test]
fn test_flush_rewrites_whole_changed_u32_field() {
    init_logging();
    let channel = image(&FsParams::default());
    let options = OpenOptions {
        master_sb_only: true,
        super_only: true,
        ..OpenOptions::read_write()
    };
    let mut fs = open(&channel, &options);
    let wtime = fs.sb.s_wtime;
    fs.set_now(Some(wtime));
    // Both 16-bit halves change
    let mtime = fs.sb.s_mtime ^ 0x0001_0001;
    fs.sb.s_mtime = mtime;
    fs.mark_super_dirty();

    channel.clear_writes();
    fs.flush().unwrap();
    let writes = channel.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Bytes);
    assert_eq!(writes[0].offset, SUPERBLOCK_OFFSET + 0x2C);
    assert_eq!(writes[0].len, 4);

    let fs = open(&channel, &OpenOptions::default());
    assert_eq!(fs.sb.s_mtime, mtime);
}

#[test]
fn test_interrupted_flush_leaves_backups_ahead_of_primary() {
    init_logging();
    let channel = image(&many_groups());
    let mut fs = open(&channel, &OpenOptions::read_write());
    let mnt_count = fs.sb.s_mnt_count;
    fs.sb.s_mnt_count += 1;
    fs.mark_super_dirty();

    // Group 0 descriptors, then group 1's superblock and descriptors land;
    // group 3's superblock is where the device gives out
    channel.set_write_budget(Some(3));
    assert!(matches!(fs.flush(), Err(ExtError::Io(_))));
    drop(fs);
    channel.set_write_budget(None);

    let primary = open(&channel, &OpenOptions::default());
    assert_eq!(primary.sb.s_mnt_count, mnt_count);
    assert_ne!(primary.sb.s_state & EXT4_VALID_FS, 0);

    let backup_at = |group: u64| OpenOptions {
        superblock: Some(1 + group * 256),
        block_size: Some(1024),
        ..Default::default()
    };
    let ahead = open(&channel, &backup_at(1));
    assert_eq!(ahead.sb.s_mnt_count, mnt_count + 1);
    assert_eq!(ahead.sb.s_state & EXT4_VALID_FS, 0);

    let behind = open(&channel, &backup_at(3));
    assert_eq!(behind.sb.s_mnt_count, mnt_count);
}

#[test]
fn test_flush_falls_back_to_whole_superblock() {
    init_logging();
    let channel = image(&FsParams::default());
    channel.set_write_byte_enabled(false);
    let options = OpenOptions {
        master_sb_only: true,
        super_only: true,
        ..OpenOptions::read_write()
    };
    let mut fs = open(&channel, &options);
    fs.sb.s_mnt_count += 1;
    channel.clear_writes();
    fs.flush().unwrap();
    let writes = channel.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Blocks);
    assert_eq!(writes[0].len, SUPERBLOCK_SIZE);
}

#[test]
fn test_meta_bg_descriptor_copies() {
    init_logging();
    let params = FsParams {
        blocks_per_group: 1024,
        feature_incompat: FsParams::default().feature_incompat | EXT4_FEATURE_INCOMPAT_META_BG,
        ..Default::default()
    };
    let channel = image(&params);
    let mut fs = open(&channel, &OpenOptions::read_write());
    assert_eq!(fs.group_desc_count(), 8);
    fs.group_desc[6].free_inodes_count -= 1;
    fs.sb.s_free_inodes_count -= 1;
    fs.mark_super_dirty();
    fs.flush().unwrap();

    // One meta group of 32 descriptors; copies in its first, second and
    // last groups, of which only the first two exist
    let data = channel.snapshot();
    let primary = &data[2 * 1024..3 * 1024];
    let second = &data[1026 * 1024..1027 * 1024];
    assert_eq!(primary, second);
    let gd = GroupDesc::decode(&primary[6 * 32..7 * 32], 32, Endian::Little);
    assert_eq!(gd.free_inodes_count, fs.group_desc[6].free_inodes_count);

    let reopened = open(&channel, &OpenOptions::default());
    assert_eq!(reopened.group_desc[6].free_inodes_count, gd.free_inodes_count);
}

#[test]
fn test_byte_swapped_image() {
    init_logging();
    let params = FsParams {
        swap_bytes: true,
        ..Default::default()
    };
    let channel = image(&params);
    // The magic gives the byte order away without being told
    let detected = open(&channel, &OpenOptions::default());
    assert_eq!(detected.endian(), Endian::Big);
    drop(detected);

    let options = OpenOptions {
        swap_bytes: true,
        ..OpenOptions::read_write()
    };
    let mut fs = open(&channel, &options);
    assert_eq!(fs.sb.s_magic, EXT4_SUPER_MAGIC);
    assert_eq!(fs.lookup(EXT4_ROOT_INO, b"lost+found").unwrap(), Some(11));

    let dir = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"swapped"), false).unwrap();
    fs.flush().unwrap();

    let mut fs = open(&channel, &options);
    assert_eq!(fs.lookup(EXT4_ROOT_INO, b"swapped").unwrap(), Some(dir));
    let mut scan = InodeScan::open(&mut fs, 4).unwrap();
    let mut found = false;
    for item in scan.iter(&mut fs) {
        let scanned = item.unwrap();
        if scanned.ino == dir {
            assert!(scanned.inode.is_dir());
            assert_eq!(scanned.inode.i_links_count, 2);
            found = true;
        }
    }
    assert!(found);
}

#[test]
fn test_directory_corruption_stops_the_walk() {
    init_logging();
    let channel = image(&FsParams::default());
    let mut fs = open(&channel, &OpenOptions::read_write());
    let root = fs.read_inode(EXT4_ROOT_INO).unwrap();
    let block = root.i_block[0] as u64;

    // lost+found follows ".."; give it an impossible record length
    let mut buf = fs.read_dir_block(block, EXT4_ROOT_INO).unwrap();
    let header = DirEntryHeader::read(&buf, 24, 1024);
    assert_eq!(header.name_len, 10);
    buf[24 + 4..24 + 6].copy_from_slice(&6u16.to_le_bytes());
    fs.write_block(block, &buf).unwrap();

    let mut seen = Vec::new();
    let result = fs.dir_iterate(EXT4_ROOT_INO, DirIterFlags::default(), |visit| {
        seen.push(visit.name().to_vec());
        DirentAction::CONTINUE
    });
    assert!(matches!(result, Err(ExtError::DirCorrupted { .. })));
    assert_eq!(seen, vec![b".".to_vec(), b"..".to_vec()]);
}

#[test]
fn test_deleted_entries_reachable_with_include_removed() {
    init_logging();
    let channel = image(&FsParams::default());
    let mut fs = open(&channel, &OpenOptions::read_write());
    fs.mkdir(EXT4_ROOT_INO, 0, Some(b"a"), false).unwrap();
    fs.mkdir(EXT4_ROOT_INO, 0, Some(b"b"), false).unwrap();

    // Unlink "a" the classic way: fold it into the record before it
    let mut prev: Option<usize> = None;
    fs.dir_iterate(EXT4_ROOT_INO, DirIterFlags::default(), |visit| {
        if visit.name() == b"a" {
            if let Some(prev) = prev {
                let mut before = visit.header_at(prev);
                before.rec_len += visit.header().rec_len;
                before.write(visit.buf, prev, 1024).unwrap();
                return DirentAction::CHANGED | DirentAction::ABORT;
            }
        }
        prev = Some(visit.offset);
        DirentAction::CONTINUE
    })
    .unwrap();
    assert_eq!(fs.lookup(EXT4_ROOT_INO, b"a").unwrap(), None);
    assert!(fs.lookup(EXT4_ROOT_INO, b"b").unwrap().is_some());

    let flags = DirIterFlags {
        include_removed: true,
        ..Default::default()
    };
    let mut removed = Vec::new();
    fs.dir_iterate(EXT4_ROOT_INO, flags, |visit| {
        if visit.kind == DirEntryKind::Deleted {
            removed.push(visit.name().to_vec());
        }
        DirentAction::CONTINUE
    })
    .unwrap();
    assert_eq!(removed, vec![b"a".to_vec()]);
}

#[test]
fn test_file_backed_image() {
    init_logging();
    let mut file = NamedTempFile::new().unwrap();
    file.as_file_mut().set_len(8192 * 1024).unwrap();
    file.flush().unwrap();

    let channel = FileChannel::open(file.path(), true).unwrap();
    let fs = initialize(Box::new(channel), &FsParams::default()).unwrap();
    let uuid = fs.sb.s_uuid;
    fs.close().unwrap();

    let channel = FileChannel::open(file.path(), true).unwrap();
    let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::read_write()).unwrap();
    assert_eq!(fs.sb.s_uuid, uuid);
    let dir = fs.mkdir(EXT4_ROOT_INO, 0, Some(b"on-disk"), false).unwrap();
    fs.close().unwrap();

    let channel = FileChannel::open(file.path(), false).unwrap();
    let mut fs = ExtFilesystem::open(Box::new(channel), &OpenOptions::default()).unwrap();
    assert_eq!(fs.lookup(EXT4_ROOT_INO, b"on-disk").unwrap(), Some(dir));
    assert!(matches!(
        fs.mkdir(EXT4_ROOT_INO, 0, Some(b"nope"), false),
        Err(ExtError::ReadOnly)
    ));
}

#[test]
fn test_blank_device_is_not_a_filesystem() {
    init_logging();
    let channel = MemoryChannel::new(64 * 1024);
    assert!(matches!(
        ExtFilesystem::open(Box::new(channel), &OpenOptions::default()),
        Err(ExtError::BadMagic(0))
    ));
}
