// Building a fresh filesystem image

use super::ExtFilesystem;
use crate::ext_native::core::*;
use crate::ext_native::writer::closefs::group_has_super;
use e2kit_core::IoChannel;
use log::{debug, info};

/// Minimum data blocks a trailing partial group must keep
const MIN_LAST_GROUP_DATA_BLOCKS: u64 = 50;

fn invalid(msg: String) -> ExtError {
    ExtError::InvalidArgument(msg)
}

fn check_params(params: &FsParams) -> ExtResult<()> {
    let bs = params.block_size;
    if !bs.is_power_of_two() || !(EXT4_MIN_BLOCK_SIZE..=EXT4_MAX_BLOCK_SIZE).contains(&bs) {
        return Err(invalid(format!("block size {}", bs)));
    }
    let inode_size = params.inode_size as u32;
    if !inode_size.is_power_of_two() || inode_size < EXT4_GOOD_OLD_INODE_SIZE as u32 || inode_size > bs {
        return Err(invalid(format!("inode size {}", inode_size)));
    }
    let bpg = params.effective_blocks_per_group();
    if bpg == 0 || bpg > 8 * bs || bpg % 8 != 0 {
        return Err(invalid(format!("{} blocks per group", bpg)));
    }
    if params.inodes_per_group == 0 {
        return Err(invalid("zero inodes per group".to_string()));
    }
    if params.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG) && params.reserved_gdt_blocks != 0 {
        return Err(invalid("meta_bg and reserved GDT blocks are exclusive".to_string()));
    }
    let unsupported = params.feature_incompat & !EXT4_LIB_FEATURE_INCOMPAT_SUPP;
    if unsupported != 0 {
        return Err(ExtError::UnsupportedFeature(format!("incompat 0x{:x}", unsupported)));
    }
    Ok(())
}

/// Reserved GDT blocks needed to grow to 1024 times the current size
/// (capped at 2^32 blocks)
fn default_reserved_gdt_blocks(sb: &Superblock, desc_blocks: u32) -> u16 {
    let bpg = sb.s_blocks_per_group as u64;
    let gdpb = (sb.block_size() / sb.desc_size() as u32) as u64;
    let max_blocks = (sb.blocks_count().saturating_mul(1024)).min(u32::MAX as u64);
    let rsv_groups = (max_blocks - sb.s_first_data_block as u64 + bpg - 1) / bpg;
    let rsv_gdb = ((rsv_groups + gdpb - 1) / gdpb).saturating_sub(desc_blocks as u64);
    rsv_gdb.min((sb.block_size() / 4) as u64) as u16
}

fn build_superblock(params: &FsParams, blocks_count: u64, now: u32) -> ExtResult<Superblock> {
    let bs = params.block_size;
    let bpg = params.effective_blocks_per_group();
    let inodes_per_block = bs / params.inode_size as u32;
    let ipg_align = inodes_per_block.max(8);
    let ipg = (params.inodes_per_group + ipg_align - 1) / ipg_align * ipg_align;
    if ipg > 8 * bs {
        return Err(invalid(format!("{} inodes per group", ipg)));
    }
    let first_data_block: u32 = if bs == EXT4_MIN_BLOCK_SIZE { 1 } else { 0 };
    if blocks_count <= first_data_block as u64 {
        return Err(invalid(format!("{} blocks", blocks_count)));
    }
    let groups = ((blocks_count - first_data_block as u64 + bpg as u64 - 1) / bpg as u64) as u32;

    let mut sb = Superblock::default();
    sb.s_magic = EXT4_SUPER_MAGIC;
    sb.s_rev_level = EXT4_DYNAMIC_REV;
    sb.s_state = EXT4_VALID_FS;
    sb.s_errors = 1;
    sb.s_log_block_size = bs.trailing_zeros() - EXT4_MIN_BLOCK_LOG_SIZE;
    sb.s_log_cluster_size = sb.s_log_block_size;
    sb.s_first_data_block = first_data_block;
    sb.s_blocks_per_group = bpg;
    sb.s_clusters_per_group = bpg;
    sb.s_inodes_per_group = ipg;
    sb.s_inodes_count = groups * ipg;
    sb.set_blocks_count(blocks_count);
    sb.set_r_blocks_count(blocks_count * 5 / 100);
    sb.s_first_ino = EXT4_GOOD_OLD_FIRST_INO;
    sb.s_inode_size = params.inode_size;
    if params.inode_size > EXT4_GOOD_OLD_INODE_SIZE {
        sb.s_min_extra_isize = EXT4_INODE_LARGE_EXTRA_ISIZE;
        sb.s_want_extra_isize = EXT4_INODE_LARGE_EXTRA_ISIZE;
    }
    sb.s_feature_compat = params.feature_compat;
    sb.s_feature_incompat = params.feature_incompat;
    sb.s_feature_ro_compat = params.feature_ro_compat;
    if sb.has_ro_compat(EXT4_FEATURE_RO_COMPAT_METADATA_CSUM) {
        sb.s_feature_ro_compat &= !EXT4_FEATURE_RO_COMPAT_GDT_CSUM;
        sb.s_checksum_type = EXT4_CRC32C_CHKSUM;
    }
    if sb.is_64bit() {
        sb.s_desc_size = EXT4_MIN_DESC_SIZE_64BIT;
    }
    if sb.has_incompat(EXT4_FEATURE_INCOMPAT_META_BG) {
        sb.s_first_meta_bg = params.first_meta_bg;
    }
    if sb.has_compat(EXT4_FEATURE_COMPAT_SPARSE_SUPER2) {
        sb.s_backup_bgs = if params.backup_bgs == [0, 0] {
            [1.min(groups - 1), groups - 1]
        } else {
            params.backup_bgs
        };
    }
    sb.s_uuid = params.uuid;
    if let Some(label) = &params.label {
        let bytes = label.as_bytes();
        let n = bytes.len().min(sb.s_volume_name.len());
        sb.s_volume_name[..n].copy_from_slice(&bytes[..n]);
    }
    sb.s_mkfs_time = now;
    sb.s_wtime = now;
    sb.s_lastcheck = now;
    sb.s_max_mnt_count = u16::MAX;

    let desc_blocks = (groups + (bs / sb.desc_size() as u32) - 1) / (bs / sb.desc_size() as u32);
    if sb.has_compat(EXT4_FEATURE_COMPAT_RESIZE_INODE) {
        sb.s_reserved_gdt_blocks = if params.reserved_gdt_blocks == 0 {
            default_reserved_gdt_blocks(&sb, desc_blocks)
        } else {
            params.reserved_gdt_blocks
        };
        if sb.s_reserved_gdt_blocks == 0 {
            sb.s_feature_compat &= !EXT4_FEATURE_COMPAT_RESIZE_INODE;
        }
    } else {
        sb.s_reserved_gdt_blocks = params.reserved_gdt_blocks;
    }
    if sb.s_reserved_gdt_blocks as u32 > bs / 4 {
        return Err(invalid(format!("{} reserved GDT blocks", sb.s_reserved_gdt_blocks)));
    }
    Ok(sb)
}

/// Write a new filesystem described by `params` to `io` and return the
/// open, read-write handle
pub fn initialize(io: Box<dyn IoChannel>, params: &FsParams) -> ExtResult<ExtFilesystem> {
    check_params(params)?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);

    let mut blocks_count = params.blocks_count;
    let mut sb = build_superblock(params, blocks_count, now)?;

    // Drop a trailing group too small to hold its own metadata
    let bpg = sb.s_blocks_per_group as u64;
    let rem = (blocks_count - sb.s_first_data_block as u64) % bpg;
    let groups = sb.s_inodes_count / sb.s_inodes_per_group;
    if groups > 1 && rem != 0 {
        let itb = (sb.s_inodes_per_group as u64 * sb.inode_size() as u64 + params.block_size as u64 - 1)
            / params.block_size as u64;
        let desc_blocks = (groups as u64 * sb.desc_size() as u64 + params.block_size as u64 - 1)
            / params.block_size as u64;
        let mut overhead = 2 + itb;
        if group_has_super(&sb, groups - 1) {
            overhead += 1 + desc_blocks + sb.s_reserved_gdt_blocks as u64;
        }
        if rem < overhead + MIN_LAST_GROUP_DATA_BLOCKS {
            debug!("Dropping {} block trailing group", rem);
            blocks_count -= rem;
            sb = build_superblock(params, blocks_count, now)?;
        }
    }

    let groups = (sb.s_inodes_count / sb.s_inodes_per_group) as usize;
    let endian = Endian::from_swap(params.swap_bytes);
    let mut fs = ExtFilesystem::assemble(io, sb, vec![GroupDesc::default(); groups], endian)?;
    fs.set_now(Some(now));
    lay_out_groups(&mut fs)?;

    let itb = fs.inode_blocks_per_group() as u64;
    for group in 0..fs.group_desc_count() {
        let table = fs.group_desc[group as usize].inode_table;
        fs.zero_blocks(table, itb)?;
    }
    if fs.sb.s_reserved_gdt_blocks > 0 {
        let start = fs.sb.s_first_data_block as u64 + 1 + fs.desc_blocks() as u64;
        fs.zero_blocks(start, fs.sb.s_reserved_gdt_blocks as u64)?;
    }

    // Reserved inodes, root excepted
    for ino in 1..fs.sb.first_ino() {
        if ino != EXT4_ROOT_INO {
            fs.inode_alloc_stats(ino, 1, false)?;
        }
    }
    let mut bad = Inode::new(fs.inode_size());
    bad.i_atime = now;
    bad.i_ctime = now;
    bad.i_mtime = now;
    fs.write_new_inode(EXT4_BAD_INO, &bad)?;

    fs.mkdir(EXT4_ROOT_INO, EXT4_ROOT_INO, None, false)?;
    if fs.sb.first_ino() <= fs.sb.s_inodes_count {
        fs.mkdir(EXT4_ROOT_INO, 0, Some(b"lost+found"), false)?;
    }
    if fs.sb.has_compat(EXT4_FEATURE_COMPAT_RESIZE_INODE) {
        fs.create_resize_inode()?;
    }

    fs.group_desc_csum_set_all();
    fs.mark_super_dirty();
    fs.flush()?;
    fs.set_now(None);
    info!(
        "Initialized {} block filesystem {} with {} groups",
        fs.sb.blocks_count(),
        fs.sb.uuid_hex(),
        fs.group_desc_count()
    );
    Ok(fs)
}

/// Place bitmaps and inode tables after each group's superblock and
/// descriptor copies, and derive the free counts
fn lay_out_groups(fs: &mut ExtFilesystem) -> ExtResult<()> {
    let (mut block_map, inode_map) = fs.allocate_bitmaps()?;
    let csum = fs.has_group_desc_csum();
    let ipg = fs.sb.s_inodes_per_group;
    let itb = fs.inode_blocks_per_group() as u64;

    for group in 0..fs.group_desc_count() {
        fs.reserve_super_and_bgd(group, &mut block_map)?;
        let first = fs.group_first_block(group);
        let last = fs.group_last_block(group);
        let loc = fs.super_and_bgd_loc(group);
        let meta_start = first + loc.used_blocks;
        if meta_start + 2 + itb - 1 > last {
            return Err(invalid(format!(
                "group {} too small for its bitmaps and inode table",
                group
            )));
        }
        let gd = &mut fs.group_desc[group as usize];
        gd.block_bitmap = meta_start;
        gd.inode_bitmap = meta_start + 1;
        gd.inode_table = meta_start + 2;
        block_map.mark_range(meta_start, 2 + itb)?;

        let used = block_map.count_set(first, last)?;
        let gd = &mut fs.group_desc[group as usize];
        gd.free_blocks_count = (last - first + 1 - used) as u32;
        gd.free_inodes_count = ipg;
        gd.used_dirs_count = 0;
        if csum {
            gd.itable_unused = ipg;
            gd.set_flag(EXT4_BG_INODE_ZEROED);
        }
    }

    let free_blocks: u64 = fs.group_desc.iter().map(|gd| gd.free_blocks_count as u64).sum();
    fs.sb.set_free_blocks_count(free_blocks);
    fs.sb.s_free_inodes_count = fs.sb.s_inodes_count;
    fs.set_bitmaps(block_map, inode_map);
    fs.group_desc_csum_set_all();
    Ok(())
}
