//! MBR partition tables
//!
//! Parses the classic master boot record at sector 0 and exposes each
//! partition as a [`BlockDevice`] window over its parent disk, so a
//! filesystem can be mounted from a partition exactly like from a whole
//! disk.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::block::{check_request, BlockDevice, BlockError};

/// Offset of the partition table inside the MBR sector.
const TABLE_OFFSET: usize = 446;
/// Bytes per table slot.
const ENTRY_SIZE: usize = 16;
/// Slots in the table.
const TABLE_SLOTS: usize = 4;

/// Partition type byte, narrowed to the kinds this kernel mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// FAT32 with CHS addressing (type 0x0B)
    Fat32,
    /// FAT32 with LBA addressing (type 0x0C)
    Fat32Lba,
    /// GPT protective entry (type 0xEE)
    Protective,
    /// Anything else, carrying the raw type byte
    Other(u8),
}

impl PartitionKind {
    fn from_type_byte(value: u8) -> Self {
        match value {
            0x0B => PartitionKind::Fat32,
            0x0C => PartitionKind::Fat32Lba,
            0xEE => PartitionKind::Protective,
            other => PartitionKind::Other(other),
        }
    }

    /// Whether a FAT32 mount may be attempted here.
    pub fn is_fat32(&self) -> bool {
        matches!(self, PartitionKind::Fat32 | PartitionKind::Fat32Lba)
    }
}

/// One live slot of the partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Table slot (0-3)
    pub index: usize,
    pub kind: PartitionKind,
    /// Whether the boot-indicator byte is set
    pub bootable: bool,
    /// First sector, absolute on the parent device
    pub start_lba: u64,
    /// Length in sectors
    pub sector_count: u64,
}

/// Read sector 0 of a device and decode its partition table.
///
/// Returns only live slots (nonzero type and length). A disk without
/// the 0xAA55 trailer has no table; that is not an error, just an empty
/// list, since plenty of volumes are formatted bare.
pub fn read_partition_table(device: &dyn BlockDevice) -> Result<Vec<PartitionEntry>, BlockError> {
    let sector_size = device.sector_size();
    let mut sector = vec![0u8; sector_size];
    device.read_sectors(0, 1, &mut sector)?;

    if sector_size < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for slot in 0..TABLE_SLOTS {
        let base = TABLE_OFFSET + slot * ENTRY_SIZE;
        let type_byte = sector[base + 4];
        let start_lba = u32::from_le_bytes(sector[base + 8..base + 12].try_into().unwrap());
        let sector_count = u32::from_le_bytes(sector[base + 12..base + 16].try_into().unwrap());
        if type_byte == 0 || sector_count == 0 {
            continue;
        }
        entries.push(PartitionEntry {
            index: slot,
            kind: PartitionKind::from_type_byte(type_byte),
            bootable: sector[base] & 0x80 != 0,
            start_lba: start_lba as u64,
            sector_count: sector_count as u64,
        });
    }
    Ok(entries)
}

/// A sector window over a slice of a parent device.
///
/// All addresses are rebased against the partition start; requests are
/// bounds-checked against the partition, not the disk, so a filesystem
/// cannot wander off its partition.
pub struct PartitionDevice {
    parent: Arc<dyn BlockDevice>,
    start_lba: u64,
    sector_count: u64,
}

impl PartitionDevice {
    pub fn new(parent: Arc<dyn BlockDevice>, entry: &PartitionEntry) -> Result<Self, BlockError> {
        let end = entry
            .start_lba
            .checked_add(entry.sector_count)
            .ok_or(BlockError::InvalidArgument)?;
        if end > parent.sector_count() {
            return Err(BlockError::OutOfBounds);
        }
        Ok(PartitionDevice {
            parent,
            start_lba: entry.start_lba,
            sector_count: entry.sector_count,
        })
    }
}

impl BlockDevice for PartitionDevice {
    fn read_sectors(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        check_request(lba, count, buf.len(), self.sector_size(), self.sector_count)?;
        self.parent.read_sectors(self.start_lba + lba, count, buf)
    }

    fn write_sectors(&self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        check_request(lba, count, buf.len(), self.sector_size(), self.sector_count)?;
        self.parent.write_sectors(self.start_lba + lba, count, buf)
    }

    fn flush(&self) -> Result<(), BlockError> {
        self.parent.flush()
    }

    fn sector_size(&self) -> usize {
        self.parent.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ramdisk::RamDisk;

    /// Write an MBR with one entry per given (type, start, count).
    fn write_mbr(disk: &RamDisk, parts: &[(u8, u32, u32)]) {
        let mut sector = vec![0u8; 512];
        for (slot, &(type_byte, start, count)) in parts.iter().enumerate() {
            let base = TABLE_OFFSET + slot * ENTRY_SIZE;
            sector[base] = if slot == 0 { 0x80 } else { 0 };
            sector[base + 4] = type_byte;
            sector[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
            sector[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        disk.write_sectors(0, 1, &sector).unwrap();
    }

    #[test]
    fn table_parses_live_slots_only() {
        let disk = RamDisk::new(4096);
        write_mbr(&disk, &[(0x0C, 64, 2048), (0x83, 2112, 1024)]);

        let parts = read_partition_table(&disk).unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].index, 0);
        assert_eq!(parts[0].kind, PartitionKind::Fat32Lba);
        assert!(parts[0].kind.is_fat32());
        assert!(parts[0].bootable);
        assert_eq!(parts[0].start_lba, 64);
        assert_eq!(parts[0].sector_count, 2048);

        assert_eq!(parts[1].kind, PartitionKind::Other(0x83));
        assert!(!parts[1].kind.is_fat32());
        assert!(!parts[1].bootable);
    }

    #[test]
    fn missing_signature_means_no_table() {
        let disk = RamDisk::new(64);
        assert!(read_partition_table(&disk).unwrap().is_empty());
    }

    #[test]
    fn partition_device_rebases_and_bounds() {
        let disk = Arc::new(RamDisk::new(4096));
        write_mbr(&disk, &[(0x0B, 64, 128)]);
        let entry = read_partition_table(disk.as_ref()).unwrap()[0];
        let part = PartitionDevice::new(disk.clone(), &entry).unwrap();

        assert_eq!(part.sector_count(), 128);

        // A write at partition LBA 3 lands at disk LBA 67.
        let pattern = vec![0x5Au8; 512];
        part.write_sectors(3, 1, &pattern).unwrap();
        let mut raw = vec![0u8; 512];
        disk.read_sectors(67, 1, &mut raw).unwrap();
        assert_eq!(raw, pattern);

        // The window ends at the partition, not the disk.
        let mut buf = vec![0u8; 512];
        assert_eq!(
            part.read_sectors(128, 1, &mut buf),
            Err(BlockError::OutOfBounds)
        );

        // A table entry reaching past the disk is refused outright.
        let bogus = PartitionEntry {
            index: 1,
            kind: PartitionKind::Fat32,
            bootable: false,
            start_lba: 4000,
            sector_count: 1000,
        };
        assert!(PartitionDevice::new(disk, &bogus).is_err());
    }
}
