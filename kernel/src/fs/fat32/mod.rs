//! FAT32 filesystem
//!
//! A FAT32 driver over the block-device port. The mount holds the BPB
//! copy, the geometry computed from it, FSInfo free-cluster hints, a
//! write-back cache of FAT sectors, and a reusable cluster-sized
//! scratch buffer.
//!
//! Layered like the rest of the filesystem code: `bpb` parses the boot
//! and FSInfo sectors, `fat` owns FAT access, `dir` the directory
//! operations, `file` the data path, and `vfs` adapts everything to the
//! VFS port.

pub mod bpb;
pub mod dir;
pub mod fat;
pub mod file;
pub mod format;
pub mod vfs;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::BlockDevice;
use crate::fs::vfs::FsError;
use bpb::{BiosParameterBlock, FsInfo, Geometry};
use dir::{DirEntry, ATTR_DIRECTORY};
use fat::{is_end_of_chain, FatCache, ENTRY_EOC, ENTRY_FREE};

/// A mounted FAT32 volume.
pub struct Fat32Fs {
    device: Arc<dyn BlockDevice>,
    pub(crate) geometry: Geometry,
    fsinfo: FsInfo,
    fat_cache: FatCache,
    /// Reusable cluster-sized scratch buffer for data staging
    scratch: Vec<u8>,
    read_only: bool,
}

impl Fat32Fs {
    /// Mount a volume from a block device.
    ///
    /// Reads and validates the boot sector, computes the geometry,
    /// loads FSInfo hints (degrading to unknown on bad signatures) and
    /// prepares the FAT cache.
    pub fn mount(device: Arc<dyn BlockDevice>, read_only: bool) -> Result<Self, FsError> {
        let sector_size = device.sector_size();
        let mut sector = vec![0u8; sector_size];
        device.read_sectors(0, 1, &mut sector)?;

        let bpb = BiosParameterBlock::parse_and_validate(&sector)?;
        let geometry = Geometry::from_bpb(&bpb);
        if geometry.bytes_per_sector != sector_size {
            return Err(FsError::CorruptVolume);
        }
        if geometry.total_sectors > device.sector_count() {
            return Err(FsError::CorruptVolume);
        }
        if !geometry.is_valid_cluster(geometry.root_cluster) {
            return Err(FsError::CorruptVolume);
        }

        let fsinfo = if geometry.fsinfo_sector != 0 && geometry.fsinfo_sector != 0xFFFF {
            device.read_sectors(geometry.fsinfo_sector as u64, 1, &mut sector)?;
            FsInfo::parse(&sector)
        } else {
            FsInfo::unknown()
        };

        log::info!(
            "fat32: mounted{} - {} sectors, {} clusters of {} bytes, {} FATs, free hint {:?}",
            if read_only { " read-only" } else { "" },
            geometry.total_sectors,
            geometry.total_clusters,
            geometry.bytes_per_cluster,
            geometry.num_fats,
            fsinfo.free_clusters,
        );

        let fat_cache = FatCache::new(geometry.bytes_per_sector);
        let scratch = vec![0u8; geometry.bytes_per_cluster];
        Ok(Fat32Fs {
            device,
            geometry,
            fsinfo,
            fat_cache,
            scratch,
            read_only,
        })
    }

    /// Flush everything and consume the mount.
    pub fn unmount(mut self) -> Result<(), FsError> {
        self.sync()
    }

    /// Whether mutations are allowed.
    pub(crate) fn check_writable(&self) -> Result<(), FsError> {
        if self.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------
    // Cluster data access
    // -------------------------------------------------------------

    /// Borrow the scratch buffer. Must be returned with
    /// [`Fat32Fs::put_cluster_buf`]; nested borrowers allocate a fresh
    /// buffer transparently.
    pub(crate) fn take_cluster_buf(&mut self) -> Vec<u8> {
        let buf = core::mem::take(&mut self.scratch);
        if buf.len() == self.geometry.bytes_per_cluster {
            buf
        } else {
            vec![0u8; self.geometry.bytes_per_cluster]
        }
    }

    pub(crate) fn put_cluster_buf(&mut self, buf: Vec<u8>) {
        if self.scratch.is_empty() {
            self.scratch = buf;
        }
    }

    /// Read one cluster of data.
    pub(crate) fn read_cluster(&mut self, cluster: u32, buf: &mut [u8]) -> Result<(), FsError> {
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FsError::CorruptVolume);
        }
        let sector = self.geometry.cluster_to_sector(cluster);
        self.device
            .read_sectors(sector, self.geometry.sectors_per_cluster, buf)?;
        Ok(())
    }

    /// Write one cluster of data.
    pub(crate) fn write_cluster(&mut self, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FsError::CorruptVolume);
        }
        let sector = self.geometry.cluster_to_sector(cluster);
        self.device
            .write_sectors(sector, self.geometry.sectors_per_cluster, buf)?;
        Ok(())
    }

    /// Zero-fill one cluster on disk.
    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<(), FsError> {
        let mut buf = self.take_cluster_buf();
        buf.fill(0);
        let result = self.write_cluster(cluster, &buf);
        self.put_cluster_buf(buf);
        result
    }

    // -------------------------------------------------------------
    // FAT access and cluster allocation
    // -------------------------------------------------------------

    /// The FAT entry for `cluster`: either the next cluster of its
    /// chain or an end-of-chain / free / bad marker.
    pub fn next_cluster(&mut self, cluster: u32) -> Result<u32, FsError> {
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FsError::CorruptVolume);
        }
        self.fat_cache
            .read_entry(self.device.as_ref(), &self.geometry, cluster)
    }

    pub(crate) fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        self.fat_cache
            .write_entry(self.device.as_ref(), &self.geometry, cluster, value)
    }

    /// Allocate one free cluster and stamp it end-of-chain.
    ///
    /// The scan starts at the FSInfo hint (clamped to the data region)
    /// and wraps around once. Updates the free count and the hint and
    /// marks FSInfo dirty.
    pub fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        self.check_writable()?;
        let total = self.geometry.total_clusters;
        if total == 0 {
            return Err(FsError::NoSpace);
        }
        let first = 2u32;
        let last = 2 + total; // exclusive

        let mut start = self.fsinfo.next_free;
        if start < first || start >= last {
            start = first;
        }

        let mut candidate = start;
        loop {
            let entry = self
                .fat_cache
                .read_entry(self.device.as_ref(), &self.geometry, candidate)?;
            if entry == ENTRY_FREE {
                self.fat_cache.write_entry(
                    self.device.as_ref(),
                    &self.geometry,
                    candidate,
                    ENTRY_EOC,
                )?;
                if let Some(free) = self.fsinfo.free_clusters.as_mut() {
                    *free = free.saturating_sub(1);
                }
                self.fsinfo.next_free = if candidate + 1 >= last {
                    first
                } else {
                    candidate + 1
                };
                self.fsinfo.dirty = true;
                return Ok(candidate);
            }
            candidate = if candidate + 1 >= last {
                first
            } else {
                candidate + 1
            };
            if candidate == start {
                return Err(FsError::NoSpace);
            }
        }
    }

    /// Free a whole cluster chain, zeroing each FAT entry.
    ///
    /// Stops at the end-of-chain marker or the first invalid link.
    pub fn free_chain(&mut self, start: u32) -> Result<(), FsError> {
        self.check_writable()?;
        let mut cluster = start;
        while self.geometry.is_valid_cluster(cluster) {
            let next = self
                .fat_cache
                .read_entry(self.device.as_ref(), &self.geometry, cluster)?;
            self.fat_cache
                .write_entry(self.device.as_ref(), &self.geometry, cluster, ENTRY_FREE)?;
            if let Some(free) = self.fsinfo.free_clusters.as_mut() {
                *free += 1;
            }
            self.fsinfo.dirty = true;
            if is_end_of_chain(next) {
                break;
            }
            cluster = next;
        }
        Ok(())
    }

    /// Free-cluster count, scanning the FAT once when the FSInfo hint
    /// was unknown.
    pub fn free_clusters(&mut self) -> Result<u32, FsError> {
        if let Some(free) = self.fsinfo.free_clusters {
            return Ok(free);
        }
        let mut free = 0u32;
        for cluster in 2..2 + self.geometry.total_clusters {
            let entry = self
                .fat_cache
                .read_entry(self.device.as_ref(), &self.geometry, cluster)?;
            if entry == ENTRY_FREE {
                free += 1;
            }
        }
        self.fsinfo.free_clusters = Some(free);
        Ok(free)
    }

    // -------------------------------------------------------------
    // Path resolution
    // -------------------------------------------------------------

    /// Split a path on `/` and `\`, dropping empty components.
    fn components(path: &str) -> impl Iterator<Item = &str> {
        path.split(['/', '\\']).filter(|c| !c.is_empty())
    }

    /// The pseudo-entry for the root directory, which has no entry of
    /// its own on disk.
    fn root_entry(&self) -> DirEntry {
        DirEntry {
            name: alloc::string::String::from("/"),
            attr: ATTR_DIRECTORY,
            first_cluster: self.geometry.root_cluster,
            size: 0,
            location: dir::EntryLocation {
                cluster: self.geometry.root_cluster,
                index: 0,
            },
        }
    }

    /// Resolve a path to its entry and the first cluster of the
    /// directory containing it.
    ///
    /// Every non-terminal component must be a directory.
    pub fn resolve(&mut self, path: &str) -> Result<(DirEntry, u32), FsError> {
        let mut parent = self.geometry.root_cluster;
        let mut current = self.root_entry();

        for component in Self::components(path) {
            if !current.is_directory() {
                return Err(FsError::NotDirectory);
            }
            parent = current.first_cluster;
            current = self
                .find_in_dir(parent, component)?
                .ok_or(FsError::NotFound)?;
        }
        Ok((current, parent))
    }

    /// Resolve the directory part of a path, returning its first
    /// cluster and the leaf name.
    pub fn resolve_parent<'p>(&mut self, path: &'p str) -> Result<(u32, &'p str), FsError> {
        let mut components: Vec<&str> = Self::components(path).collect();
        let leaf = components.pop().ok_or(FsError::InvalidPath)?;

        let mut dir_cluster = self.geometry.root_cluster;
        for component in components {
            let entry = self
                .find_in_dir(dir_cluster, component)?
                .ok_or(FsError::NotFound)?;
            if !entry.is_directory() {
                return Err(FsError::NotDirectory);
            }
            dir_cluster = entry.first_cluster;
        }
        Ok((dir_cluster, leaf))
    }

    // -------------------------------------------------------------
    // Sync
    // -------------------------------------------------------------

    /// Flush dirty FAT sectors (to every copy), write FSInfo back if
    /// its hints changed, then flush the device itself.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.fat_cache.flush(self.device.as_ref(), &self.geometry)?;

        if self.fsinfo.dirty
            && self.geometry.fsinfo_sector != 0
            && self.geometry.fsinfo_sector != 0xFFFF
        {
            let sector_num = self.geometry.fsinfo_sector as u64;
            let mut sector = vec![0u8; self.geometry.bytes_per_sector];
            self.device.read_sectors(sector_num, 1, &mut sector)?;
            self.fsinfo.encode_into(&mut sector);
            self.device.write_sectors(sector_num, 1, &sector)?;
            self.fsinfo.dirty = false;
        }

        self.device.flush()?;
        Ok(())
    }
}

// =============================================================================
// Root filesystem bring-up
// =============================================================================

/// The root FAT32 mount, created once storage is up.
static ROOT_FAT: Mutex<Option<()>> = Mutex::new(None);

/// Mount the first SATA disk as the root filesystem and register it
/// with the VFS.
///
/// If the disk carries an MBR with a FAT32 partition, that partition
/// backs the mount; a bare disk is mounted whole.
pub fn init_root_fs() -> Result<(), FsError> {
    let device: Arc<dyn BlockDevice> =
        Arc::new(crate::drivers::ahci::get_block_device().ok_or(FsError::NotMounted)?);

    let device = match crate::block::partition::read_partition_table(device.as_ref()) {
        Ok(parts) => match parts.iter().find(|p| p.kind.is_fat32()) {
            Some(part) => {
                log::info!(
                    "fat32: using partition {} at LBA {} ({} sectors)",
                    part.index,
                    part.start_lba,
                    part.sector_count
                );
                Arc::new(crate::block::partition::PartitionDevice::new(
                    device, part,
                )?) as Arc<dyn BlockDevice>
            }
            None => device,
        },
        Err(err) => return Err(FsError::Io(err)),
    };

    let fs = Fat32Fs::mount(device, false)?;
    crate::fs::vfs::mount("/", alloc::boxed::Box::new(fs))?;
    *ROOT_FAT.lock() = Some(());
    Ok(())
}

/// Whether the root filesystem is mounted.
pub fn is_mounted() -> bool {
    ROOT_FAT.lock().is_some()
}

#[cfg(test)]
pub(crate) mod testfs {
    //! RAM-disk volumes for the FAT32 tests, produced by the real
    //! formatter.

    use super::*;
    use crate::block::ramdisk::RamDisk;
    use crate::fs::fat32::format::{format_volume, FormatOptions};

    /// Format a RAM disk of `total_sectors` 512-byte sectors with
    /// `sectors_per_cluster`-sector clusters.
    pub fn format(total_sectors: u32, sectors_per_cluster: u8) -> Arc<RamDisk> {
        let disk = RamDisk::new(total_sectors as u64);
        let options = FormatOptions {
            sectors_per_cluster,
            ..FormatOptions::default()
        };
        format_volume(&disk, &options).expect("format failed");
        Arc::new(disk)
    }

    /// Format and mount a standard 4 MiB test volume with 4 KiB
    /// clusters.
    pub fn mount_fresh() -> Fat32Fs {
        let disk = format(8192, 8);
        Fat32Fs::mount(disk, false).expect("mount failed")
    }
}

#[cfg(test)]
mod tests {
    use super::dir::{ATTR_ARCHIVE, ATTR_DIRECTORY};
    use super::testfs::{format, mount_fresh};
    use super::*;

    #[test]
    fn mount_validates_and_computes_geometry() {
        let fs = mount_fresh();
        assert_eq!(fs.geometry.bytes_per_cluster, 4096);
        assert_eq!(fs.geometry.root_cluster, 2);
        assert!(!fs.read_only);
        assert!(fs.fsinfo.free_clusters.is_some());
    }

    #[test]
    fn mount_refuses_garbage() {
        let disk = Arc::new(crate::block::ramdisk::RamDisk::new(128));
        assert_eq!(
            Fat32Fs::mount(disk, false).err(),
            Some(FsError::CorruptVolume)
        );
    }

    #[test]
    fn allocate_then_free_restores_free_count() {
        let mut fs = mount_fresh();
        let before = fs.free_clusters().unwrap();

        let a = fs.allocate_cluster().unwrap();
        let b = fs.allocate_cluster().unwrap();
        fs.set_fat_entry(a, b).unwrap();
        assert_eq!(fs.free_clusters().unwrap(), before - 2);

        // The chain a -> b -> EOC frees as a unit.
        fs.free_chain(a).unwrap();
        assert_eq!(fs.free_clusters().unwrap(), before);

        // Both entries really are zero again.
        assert_eq!(fs.next_cluster(a).unwrap(), ENTRY_FREE);
        assert_eq!(fs.next_cluster(b).unwrap(), ENTRY_FREE);
    }

    #[test]
    fn allocation_advances_the_hint() {
        let mut fs = mount_fresh();
        let a = fs.allocate_cluster().unwrap();
        let b = fs.allocate_cluster().unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(fs.fsinfo.next_free, b + 1);
        assert!(fs.fsinfo.dirty);
    }

    #[test]
    fn exhaustion_returns_nospace() {
        // Tiny volume: few clusters, allocate them all.
        let disk = format(256, 1);
        let mut fs = Fat32Fs::mount(disk, false).unwrap();
        let free = fs.free_clusters().unwrap();
        for _ in 0..free {
            fs.allocate_cluster().unwrap();
        }
        assert_eq!(fs.allocate_cluster(), Err(FsError::NoSpace));
    }

    #[test]
    fn create_list_delete_cycle() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;

        fs.create_entry(root, "hello.txt", ATTR_ARCHIVE).unwrap();
        fs.create_entry(root, "world.txt", ATTR_ARCHIVE).unwrap();

        let entries = fs.list_dir(root).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["HELLO.TXT", "WORLD.TXT"]);

        assert_eq!(
            fs.create_entry(root, "hello.txt", ATTR_ARCHIVE),
            Err(FsError::AlreadyExists)
        );

        fs.delete_entry(root, "hello.txt").unwrap();
        let names: Vec<_> = fs
            .list_dir(root)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["WORLD.TXT"]);

        assert_eq!(
            fs.delete_entry(root, "hello.txt"),
            Err(FsError::NotFound)
        );
    }

    #[test]
    fn mkdir_seeds_dot_entries() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;

        let dir = fs.create_entry(root, "sub", ATTR_DIRECTORY).unwrap();
        assert!(dir.is_directory());
        assert!(dir.first_cluster >= 2);

        let entries = fs.list_dir(dir.first_cluster).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[0].first_cluster, dir.first_cluster);
        // Parent is the root, stored as zero on disk.
        assert_eq!(entries[1].first_cluster, 0);

        // A fresh directory is empty apart from the dot entries.
        assert!(fs.dir_is_empty(dir.first_cluster).unwrap());
    }

    #[test]
    fn path_resolution_walks_directories() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;

        let dir = fs.create_entry(root, "dir", ATTR_DIRECTORY).unwrap();
        fs.create_entry(dir.first_cluster, "f.txt", ATTR_ARCHIVE)
            .unwrap();

        let (entry, parent) = fs.resolve("/dir/f.txt").unwrap();
        assert_eq!(entry.name, "F.TXT");
        assert_eq!(parent, dir.first_cluster);

        // Backslashes separate too, and matching ignores case.
        let (entry2, _) = fs.resolve("\\DIR\\F.TXT").unwrap();
        assert_eq!(entry2, entry);

        assert_eq!(fs.resolve("/dir/missing").err(), Some(FsError::NotFound));
        // A file used as a directory fails cleanly.
        assert_eq!(
            fs.resolve("/dir/f.txt/deeper").err(),
            Some(FsError::NotDirectory)
        );

        let (root_entry, _) = fs.resolve("/").unwrap();
        assert_eq!(root_entry.first_cluster, root);
    }

    #[test]
    fn file_write_read_round_trip() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;
        let entry = fs.create_entry(root, "data.bin", ATTR_ARCHIVE).unwrap();

        let payload = b"Hello, World!\n";
        let mut first = entry.first_cluster;
        let mut size = entry.size;
        let written = fs.write_at(&mut first, &mut size, 0, payload).unwrap();
        assert_eq!(written, payload.len());
        assert_eq!(size as usize, payload.len());
        assert_ne!(first, 0);

        let mut out = vec![0u8; payload.len()];
        let read = fs.read_at(first, size, 0, &mut out).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(&out, payload);

        // Reads at and past end of file return zero bytes.
        assert_eq!(fs.read_at(first, size, size as u64, &mut out).unwrap(), 0);
        assert_eq!(
            fs.read_at(first, size, size as u64 + 10, &mut out).unwrap(),
            0
        );
    }

    #[test]
    fn multi_cluster_file_uses_a_chain() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;
        let entry = fs.create_entry(root, "big", ATTR_ARCHIVE).unwrap();

        // 10000 bytes over 4096-byte clusters: exactly three clusters.
        let pattern: Vec<u8> = (0..10000).map(|i| (i % 251) as u8).collect();
        let mut first = entry.first_cluster;
        let mut size = entry.size;
        fs.write_at(&mut first, &mut size, 0, &pattern).unwrap();
        assert_eq!(size, 10000);

        let mut chain = vec![first];
        loop {
            let next = fs.next_cluster(*chain.last().unwrap()).unwrap();
            if is_end_of_chain(next) {
                break;
            }
            chain.push(next);
        }
        assert_eq!(chain.len(), 3);

        let mut out = vec![0u8; 10000];
        assert_eq!(fs.read_at(first, size, 0, &mut out).unwrap(), 10000);
        assert_eq!(out, pattern);

        // Unaligned interior read.
        let mut mid = vec![0u8; 5000];
        assert_eq!(fs.read_at(first, size, 3000, &mut mid).unwrap(), 5000);
        assert_eq!(&mid[..], &pattern[3000..8000]);
    }

    #[test]
    fn sparse_write_extends_and_zero_fills() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;
        let entry = fs.create_entry(root, "sparse", ATTR_ARCHIVE).unwrap();

        let mut first = entry.first_cluster;
        let mut size = entry.size;
        // Write beyond the first cluster without touching it first.
        fs.write_at(&mut first, &mut size, 6000, b"tail").unwrap();
        assert_eq!(size, 6004);

        let mut out = vec![0u8; 6004];
        assert_eq!(fs.read_at(first, size, 0, &mut out).unwrap(), 6004);
        assert!(out[..6000].iter().all(|&b| b == 0));
        assert_eq!(&out[6000..], b"tail");
    }

    #[test]
    fn overwrite_keeps_size() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;
        let entry = fs.create_entry(root, "o.txt", ATTR_ARCHIVE).unwrap();

        let mut first = entry.first_cluster;
        let mut size = entry.size;
        fs.write_at(&mut first, &mut size, 0, b"AAAABBBB").unwrap();
        fs.write_at(&mut first, &mut size, 2, b"xx").unwrap();
        assert_eq!(size, 8);

        let mut out = vec![0u8; 8];
        fs.read_at(first, size, 0, &mut out).unwrap();
        assert_eq!(&out, b"AAxxBBBB");
    }

    #[test]
    fn truncate_shrinks_and_frees() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;
        let entry = fs.create_entry(root, "t", ATTR_ARCHIVE).unwrap();

        let pattern: Vec<u8> = (0..12000).map(|i| (i % 13) as u8).collect();
        let mut first = entry.first_cluster;
        let mut size = entry.size;
        fs.write_at(&mut first, &mut size, 0, &pattern).unwrap();
        let free_after_write = fs.free_clusters().unwrap();

        // Shrink to one cluster: two clusters come back.
        fs.truncate(&mut first, &mut size, 1000).unwrap();
        assert_eq!(size, 1000);
        assert_eq!(fs.free_clusters().unwrap(), free_after_write + 2);
        assert!(is_end_of_chain(fs.next_cluster(first).unwrap()));

        // Grow lazily: size moves, no clusters allocated.
        fs.truncate(&mut first, &mut size, 50000).unwrap();
        assert_eq!(size, 50000);
        assert_eq!(fs.free_clusters().unwrap(), free_after_write + 2);

        // Zero releases everything.
        fs.truncate(&mut first, &mut size, 0).unwrap();
        assert_eq!((first, size), (0, 0));
    }

    #[test]
    fn read_only_mount_refuses_mutation() {
        let disk = format(8192, 8);
        let mut fs = Fat32Fs::mount(disk, true).unwrap();
        let root = fs.geometry.root_cluster;

        assert_eq!(
            fs.create_entry(root, "x", ATTR_ARCHIVE),
            Err(FsError::ReadOnly)
        );
        assert_eq!(fs.allocate_cluster(), Err(FsError::ReadOnly));
        assert_eq!(fs.delete_entry(root, "x"), Err(FsError::ReadOnly));

        // Reading still works.
        assert!(fs.list_dir(root).unwrap().is_empty());
    }

    #[test]
    fn sync_persists_fat_and_fsinfo_across_remount() {
        let disk = format(8192, 8);
        let free_before;
        let first;
        {
            let mut fs = Fat32Fs::mount(disk.clone(), false).unwrap();
            free_before = fs.free_clusters().unwrap();
            let root = fs.geometry.root_cluster;
            let entry = fs.create_entry(root, "keep.txt", ATTR_ARCHIVE).unwrap();
            let mut fc = entry.first_cluster;
            let mut size = entry.size;
            fs.write_at(&mut fc, &mut size, 0, b"persistent").unwrap();
            fs.update_entry(root, "keep.txt", fc, size).unwrap();
            first = fc;
            fs.sync().unwrap();
        }

        let mut fs = Fat32Fs::mount(disk, false).unwrap();
        // FSInfo hints survived the remount.
        assert_eq!(fs.free_clusters().unwrap(), free_before - 1);

        let root = fs.geometry.root_cluster;
        let entry = fs.find_in_dir(root, "keep.txt").unwrap().unwrap();
        assert_eq!(entry.first_cluster, first);
        assert_eq!(entry.size, 10);

        let mut out = vec![0u8; 10];
        fs.read_at(entry.first_cluster, entry.size, 0, &mut out)
            .unwrap();
        assert_eq!(&out, b"persistent");
    }

    #[test]
    fn directory_grows_past_one_cluster() {
        let mut fs = mount_fresh();
        let root = fs.geometry.root_cluster;
        // 4096-byte clusters hold 128 entries; force a second cluster.
        for i in 0..150 {
            let name = alloc::format!("F{}.BIN", i);
            fs.create_entry(root, &name, ATTR_ARCHIVE).unwrap();
        }
        let entries = fs.list_dir(root).unwrap();
        assert_eq!(entries.len(), 150);
        // The root chain now spans two clusters.
        let next = fs.next_cluster(root).unwrap();
        assert!(!is_end_of_chain(next));

        // Everything is still findable.
        assert!(fs.find_in_dir(root, "F149.BIN").unwrap().is_some());
    }
}
