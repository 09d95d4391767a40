//! RAM-backed block device
//!
//! A sector store over a heap buffer. Used as the mount target for
//! filesystem tests and as the backing device for an initrd image; any
//! code written against the block-device port runs against it unchanged.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::{check_request, BlockDevice, BlockError};

/// Default sector size, matching SATA.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// A volatile block device over heap memory.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sector_size: usize,
    sector_count: u64,
}

impl RamDisk {
    /// Create a zero-filled RAM disk with 512-byte sectors.
    pub fn new(sector_count: u64) -> Self {
        Self::with_sector_size(sector_count, DEFAULT_SECTOR_SIZE)
    }

    /// Create a zero-filled RAM disk with the given sector size.
    pub fn with_sector_size(sector_count: u64, sector_size: usize) -> Self {
        RamDisk {
            data: Mutex::new(vec![0u8; sector_count as usize * sector_size]),
            sector_size,
            sector_count,
        }
    }

    /// Wrap an existing image. The image length must be sector-granular.
    pub fn from_image(image: Vec<u8>, sector_size: usize) -> Result<Self, BlockError> {
        if sector_size == 0 || image.len() % sector_size != 0 {
            return Err(BlockError::InvalidArgument);
        }
        let sector_count = (image.len() / sector_size) as u64;
        Ok(RamDisk {
            data: Mutex::new(image),
            sector_size,
            sector_count,
        })
    }
}

impl BlockDevice for RamDisk {
    fn read_sectors(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        check_request(lba, count, buf.len(), self.sector_size, self.sector_count)?;
        let data = self.data.lock();
        let start = lba as usize * self.sector_size;
        let len = count * self.sector_size;
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        check_request(lba, count, buf.len(), self.sector_size, self.sector_count)?;
        let mut data = self.data.lock();
        let start = lba as usize * self.sector_size;
        let len = count * self.sector_size;
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn flush(&self) -> Result<(), BlockError> {
        // Nothing is cached; memory writes are already visible.
        Ok(())
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let disk = RamDisk::new(64);
        let pattern: Vec<u8> = (0..512 * 2).map(|i| (i % 256) as u8).collect();

        disk.write_sectors(10, 2, &pattern).unwrap();

        let mut out = vec![0u8; 512 * 2];
        disk.read_sectors(10, 2, &mut out).unwrap();
        assert_eq!(out, pattern);

        // Neighboring sectors stay zero.
        let mut neighbor = vec![0u8; 512];
        disk.read_sectors(9, 1, &mut neighbor).unwrap();
        assert!(neighbor.iter().all(|&b| b == 0));
        disk.read_sectors(12, 1, &mut neighbor).unwrap();
        assert!(neighbor.iter().all(|&b| b == 0));
    }

    #[test]
    fn bounds_are_enforced() {
        let disk = RamDisk::new(8);
        let mut buf = vec![0u8; 512];
        assert_eq!(
            disk.read_sectors(8, 1, &mut buf),
            Err(BlockError::OutOfBounds)
        );
        assert_eq!(
            disk.read_sectors(0, 0, &mut buf),
            Err(BlockError::InvalidArgument)
        );
        assert_eq!(
            disk.write_sectors(7, 2, &vec![0u8; 1024]),
            Err(BlockError::OutOfBounds)
        );
    }

    #[test]
    fn image_wrapping() {
        let image = vec![0xEEu8; 4 * 512];
        let disk = RamDisk::from_image(image, 512).unwrap();
        assert_eq!(disk.sector_count(), 4);

        let mut buf = vec![0u8; 512];
        disk.read_sectors(3, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xEE));

        assert!(RamDisk::from_image(vec![0u8; 100], 512).is_err());
    }
}
