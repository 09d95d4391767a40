//! FAT32 volume formatter
//!
//! Writes a fresh FAT32 layout onto a block device: boot sector (plus
//! the backup copy), FSInfo, zeroed mirrored FATs with the reserved
//! head entries, and an empty root directory carrying the volume
//! label. The shell's `format` command and the filesystem tests both
//! come through here.

use alloc::vec;

use crate::block::BlockDevice;
use crate::fs::fat32::bpb::BOOT_SIGNATURE;
use crate::fs::fat32::dir::{DirEntryRaw, ATTR_VOLUME_ID};
use crate::fs::fat32::fat::ENTRY_EOC;
use crate::fs::vfs::FsError;

/// Sectors set aside before the first FAT.
const RESERVED_SECTORS: u16 = 32;
/// FAT copies written.
const NUM_FATS: u8 = 2;
/// Boot sector, FSInfo and their backup locations.
const FSINFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;

/// Formatting parameters.
pub struct FormatOptions {
    /// Sectors per cluster; must be a power of two, at most 128
    pub sectors_per_cluster: u8,
    /// Volume label, space-padded on disk
    pub volume_label: [u8; 11],
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            sectors_per_cluster: 8,
            volume_label: *b"AAAOS  DISK",
        }
    }
}

/// Compute the per-copy FAT size in sectors.
///
/// The FAT must cover every data cluster plus the two reserved head
/// entries; since the data area shrinks as the FAT grows, iterate
/// until the size is stable.
fn fat_size_sectors(total_sectors: u64, bytes_per_sector: usize, spc: usize) -> u64 {
    let usable = total_sectors.saturating_sub(RESERVED_SECTORS as u64);
    let mut fat_size = 1u64;
    loop {
        let data_sectors = usable.saturating_sub(NUM_FATS as u64 * fat_size);
        let clusters = data_sectors / spc as u64;
        let needed = ((clusters + 2) * 4).div_ceil(bytes_per_sector as u64);
        if needed <= fat_size {
            return fat_size;
        }
        fat_size = needed;
    }
}

fn build_boot_sector(
    bytes_per_sector: usize,
    total_sectors: u64,
    fat_size: u64,
    options: &FormatOptions,
) -> alloc::vec::Vec<u8> {
    let mut s = vec![0u8; bytes_per_sector];
    s[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    s[3..11].copy_from_slice(b"AAAOS   ");
    s[11..13].copy_from_slice(&(bytes_per_sector as u16).to_le_bytes());
    s[13] = options.sectors_per_cluster;
    s[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
    s[16] = NUM_FATS;
    s[21] = 0xF8; // media: fixed disk
    s[24..26].copy_from_slice(&63u16.to_le_bytes()); // sectors per track
    s[26..28].copy_from_slice(&255u16.to_le_bytes()); // heads
    s[32..36].copy_from_slice(&(total_sectors as u32).to_le_bytes());
    s[36..40].copy_from_slice(&(fat_size as u32).to_le_bytes());
    s[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    s[48..50].copy_from_slice(&FSINFO_SECTOR.to_le_bytes());
    s[50..52].copy_from_slice(&BACKUP_BOOT_SECTOR.to_le_bytes());
    s[64] = 0x80; // drive number
    s[66] = 0x29; // extended boot signature
    s[67..71].copy_from_slice(&0x1A2B_3C4Du32.to_le_bytes()); // volume id
    s[71..82].copy_from_slice(&options.volume_label);
    s[82..90].copy_from_slice(b"FAT32   ");
    s[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    s
}

fn build_fsinfo_sector(
    bytes_per_sector: usize,
    free_clusters: u32,
    next_free: u32,
) -> alloc::vec::Vec<u8> {
    let mut s = vec![0u8; bytes_per_sector];
    s[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    s[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    s[488..492].copy_from_slice(&free_clusters.to_le_bytes());
    s[492..496].copy_from_slice(&next_free.to_le_bytes());
    s[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    s
}

/// Format a device as one FAT32 volume.
///
/// Destroys everything on it. The device must use a sector size the
/// filesystem supports and be large enough to hold the reserved area,
/// both FATs and at least a handful of clusters.
pub fn format_volume(device: &dyn BlockDevice, options: &FormatOptions) -> Result<(), FsError> {
    let bytes_per_sector = device.sector_size();
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(FsError::Unsupported);
    }
    let spc = options.sectors_per_cluster;
    if spc == 0 || !spc.is_power_of_two() || spc > 128 {
        return Err(FsError::Unsupported);
    }

    let total_sectors = device.sector_count();
    if total_sectors > u32::MAX as u64 {
        return Err(FsError::Unsupported);
    }
    let fat_size = fat_size_sectors(total_sectors, bytes_per_sector, spc as usize);
    let data_start = RESERVED_SECTORS as u64 + NUM_FATS as u64 * fat_size;
    let total_clusters = (total_sectors.saturating_sub(data_start)) / spc as u64;
    // Room for the root directory and some data, or the volume is
    // pointless.
    if total_clusters < 8 {
        return Err(FsError::Unsupported);
    }

    // Boot sector and its backup.
    let boot = build_boot_sector(bytes_per_sector, total_sectors, fat_size, options);
    device.write_sectors(0, 1, &boot)?;
    device.write_sectors(BACKUP_BOOT_SECTOR as u64, 1, &boot)?;

    // FSInfo and its backup: every cluster but the root is free, and
    // the scan starts just past the root.
    let fsinfo = build_fsinfo_sector(bytes_per_sector, total_clusters as u32 - 1, 3);
    device.write_sectors(FSINFO_SECTOR as u64, 1, &fsinfo)?;
    device.write_sectors((BACKUP_BOOT_SECTOR + 1) as u64, 1, &fsinfo)?;

    // Zero both FATs, then seed the head entries of each copy: media
    // descriptor, reserved, and the root directory's end-of-chain.
    let zero = vec![0u8; bytes_per_sector];
    for copy in 0..NUM_FATS as u64 {
        let base = RESERVED_SECTORS as u64 + copy * fat_size;
        for sector in 0..fat_size {
            device.write_sectors(base + sector, 1, &zero)?;
        }
        let mut head = vec![0u8; bytes_per_sector];
        head[0..4].copy_from_slice(&(0x0FFF_FF00u32 | 0xF8).to_le_bytes());
        head[4..8].copy_from_slice(&ENTRY_EOC.to_le_bytes());
        head[8..12].copy_from_slice(&ENTRY_EOC.to_le_bytes());
        device.write_sectors(base, 1, &head)?;
    }

    // Root directory: zeroed cluster holding only the volume label.
    let mut root = vec![0u8; bytes_per_sector * spc as usize];
    let label = DirEntryRaw::new(options.volume_label, ATTR_VOLUME_ID);
    label.write_to(&mut root[0..]);
    for sector in 0..spc as u64 {
        let offset = sector as usize * bytes_per_sector;
        device.write_sectors(
            data_start + sector,
            1,
            &root[offset..offset + bytes_per_sector],
        )?;
    }

    device.flush()?;
    log::info!(
        "fat32: formatted {} sectors, {} clusters of {} bytes, FAT {} sectors x{}",
        total_sectors,
        total_clusters,
        bytes_per_sector * spc as usize,
        fat_size,
        NUM_FATS,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ramdisk::RamDisk;
    use crate::fs::fat32::Fat32Fs;
    use alloc::sync::Arc;

    #[test]
    fn formatted_volume_mounts() {
        let disk = Arc::new(RamDisk::new(8192));
        format_volume(disk.as_ref(), &FormatOptions::default()).unwrap();

        let mut fs = Fat32Fs::mount(disk, false).expect("mount after format");
        assert_eq!(fs.geometry.bytes_per_cluster, 4096);
        assert_eq!(fs.geometry.root_cluster, 2);

        // Root shows no entries; the volume label is skipped.
        let root = fs.geometry.root_cluster;
        assert!(fs.list_dir(root).unwrap().is_empty());

        // Every cluster except the root is free.
        let free = fs.free_clusters().unwrap();
        assert_eq!(free, fs.geometry.total_clusters - 1);
    }

    #[test]
    fn fat_head_entries_are_reserved() {
        let disk = Arc::new(RamDisk::new(8192));
        format_volume(disk.as_ref(), &FormatOptions::default()).unwrap();

        let mut fs = Fat32Fs::mount(disk, false).unwrap();
        // Root chain terminates immediately.
        assert!(crate::fs::fat32::fat::is_end_of_chain(
            fs.next_cluster(2).unwrap()
        ));
        // The first allocation lands right after the root.
        assert_eq!(fs.allocate_cluster().unwrap(), 3);
    }

    #[test]
    fn backup_boot_sector_matches_primary() {
        let disk = RamDisk::new(8192);
        format_volume(&disk, &FormatOptions::default()).unwrap();

        let mut primary = vec![0u8; 512];
        let mut backup = vec![0u8; 512];
        disk.read_sectors(0, 1, &mut primary).unwrap();
        disk.read_sectors(BACKUP_BOOT_SECTOR as u64, 1, &mut backup).unwrap();
        assert_eq!(primary, backup);
    }

    #[test]
    fn fat_size_converges() {
        // 8 GiB worth of 512-byte sectors at 8 per cluster needs a FAT
        // of about clusters*4/512 sectors; the fixed point must cover
        // every cluster.
        for &(total, spc) in &[(8192u64, 8usize), (1 << 21, 8), (1 << 24, 64)] {
            let fat = fat_size_sectors(total, 512, spc);
            let data = total - RESERVED_SECTORS as u64 - 2 * fat;
            let clusters = data / spc as u64;
            assert!(fat * 512 >= (clusters + 2) * 4, "FAT too small for {}", total);
        }
    }

    #[test]
    fn tiny_devices_are_refused() {
        let disk = RamDisk::new(64);
        assert_eq!(
            format_volume(&disk, &FormatOptions::default()),
            Err(FsError::Unsupported)
        );

        let disk = RamDisk::new(8192);
        let options = FormatOptions {
            sectors_per_cluster: 6, // not a power of two
            ..FormatOptions::default()
        };
        assert_eq!(format_volume(&disk, &options), Err(FsError::Unsupported));
    }
}
