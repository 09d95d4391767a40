//! FAT32 boot sector and FSInfo structures
//!
//! The BIOS Parameter Block sits at the start of sector 0 and describes
//! the on-disk geometry; the FSInfo sector carries free-cluster hints.
//! Both are validated before a mount is accepted.

use core::mem;

use crate::fs::vfs::FsError;

/// Boot sector trailer signature at offset 510.
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// FSInfo signatures.
const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUC_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG: u32 = 0xAA55_0000;

/// Value of an unknown FSInfo hint.
const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// BIOS Parameter Block with the FAT32 extension, as laid out in
/// sector 0.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiosParameterBlock {
    pub jmp_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries_16: u16, // zero on FAT32
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16, // zero on FAT32; identifies the variant
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    // FAT32 extended fields
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
    pub _reserved: [u8; 12],
    pub drive_number: u8,
    pub _reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

impl BiosParameterBlock {
    /// Parse the BPB out of a boot sector image.
    ///
    /// Returns `None` if the slice cannot hold the structure.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < mem::size_of::<BiosParameterBlock>() {
            return None;
        }
        // SAFETY: length checked; the struct is packed, so alignment
        // does not matter for an unaligned read.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const BiosParameterBlock) })
    }

    /// Validate a full boot sector and return the parsed BPB.
    ///
    /// Checks the 0xAA55 trailer, the sector size, the power-of-two
    /// cluster size, and that the 16-bit FAT size is zero (anything
    /// else is FAT12/16, which is not supported here).
    pub fn parse_and_validate(sector: &[u8]) -> Result<Self, FsError> {
        if sector.len() < 512 {
            return Err(FsError::CorruptVolume);
        }
        let trailer = u16::from_le_bytes([sector[510], sector[511]]);
        if trailer != BOOT_SIGNATURE {
            return Err(FsError::CorruptVolume);
        }

        let bpb = Self::from_bytes(sector).ok_or(FsError::CorruptVolume)?;

        let bps = bpb.bytes_per_sector;
        if !matches!(bps, 512 | 1024 | 2048 | 4096) {
            return Err(FsError::CorruptVolume);
        }
        let spc = bpb.sectors_per_cluster;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(FsError::CorruptVolume);
        }
        if bpb.fat_size_16 != 0 || bpb.fat_size_32 == 0 {
            return Err(FsError::CorruptVolume);
        }
        if bpb.num_fats == 0 {
            return Err(FsError::CorruptVolume);
        }
        if bpb.total_sectors() == 0 || bpb.root_cluster < 2 {
            return Err(FsError::CorruptVolume);
        }
        Ok(bpb)
    }

    /// Total sector count, preferring the 16-bit field when set.
    pub fn total_sectors(&self) -> u64 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u64
        } else {
            self.total_sectors_32 as u64
        }
    }
}

/// Geometry computed from the BPB once at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub bytes_per_sector: usize,
    pub sectors_per_cluster: usize,
    pub bytes_per_cluster: usize,
    pub num_fats: usize,
    /// Sectors per FAT copy
    pub fat_sectors: u64,
    /// First sector of the first FAT copy
    pub fat_start_sector: u64,
    /// First sector of the data region (cluster 2)
    pub data_start_sector: u64,
    pub total_sectors: u64,
    /// Clusters in the data region
    pub total_clusters: u32,
    pub root_cluster: u32,
    /// FSInfo sector number; zero or 0xFFFF when absent
    pub fsinfo_sector: u16,
}

impl Geometry {
    pub fn from_bpb(bpb: &BiosParameterBlock) -> Self {
        let bytes_per_sector = bpb.bytes_per_sector as usize;
        let sectors_per_cluster = bpb.sectors_per_cluster as usize;
        let fat_start_sector = bpb.reserved_sectors as u64;
        let fat_sectors = bpb.fat_size_32 as u64;
        let data_start_sector = fat_start_sector + bpb.num_fats as u64 * fat_sectors;
        let total_sectors = bpb.total_sectors();
        let total_clusters =
            ((total_sectors.saturating_sub(data_start_sector)) / sectors_per_cluster as u64) as u32;

        Geometry {
            bytes_per_sector,
            sectors_per_cluster,
            bytes_per_cluster: bytes_per_sector * sectors_per_cluster,
            num_fats: bpb.num_fats as usize,
            fat_sectors,
            fat_start_sector,
            data_start_sector,
            total_sectors,
            total_clusters,
            root_cluster: bpb.root_cluster,
            fsinfo_sector: bpb.fsinfo_sector,
        }
    }

    /// First sector of a cluster's data.
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.data_start_sector + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Whether `cluster` addresses the data region.
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < 2 + self.total_clusters
    }
}

/// Free-cluster hints loaded from (and written back to) FSInfo.
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    /// Free cluster count; `None` when the on-disk value is unknown
    pub free_clusters: Option<u32>,
    /// Cluster number to start the next allocation scan at
    pub next_free: u32,
    /// Whether the in-memory hints differ from the on-disk sector
    pub dirty: bool,
}

impl FsInfo {
    /// Hints to use when no FSInfo sector is available.
    pub fn unknown() -> Self {
        FsInfo {
            free_clusters: None,
            next_free: 2,
            dirty: false,
        }
    }

    /// Parse an FSInfo sector. Invalid signatures degrade to unknown
    /// hints; they do not fail the mount.
    pub fn parse(sector: &[u8]) -> Self {
        if sector.len() < 512 {
            return Self::unknown();
        }
        let lead = u32::from_le_bytes(sector[0..4].try_into().unwrap());
        let struc = u32::from_le_bytes(sector[484..488].try_into().unwrap());
        let trail = u32::from_le_bytes(sector[508..512].try_into().unwrap());
        if lead != FSINFO_LEAD_SIG || struc != FSINFO_STRUC_SIG || trail != FSINFO_TRAIL_SIG {
            return Self::unknown();
        }

        let free = u32::from_le_bytes(sector[488..492].try_into().unwrap());
        let next = u32::from_le_bytes(sector[492..496].try_into().unwrap());
        FsInfo {
            free_clusters: (free != FSINFO_UNKNOWN).then_some(free),
            next_free: if next == FSINFO_UNKNOWN { 2 } else { next },
            dirty: false,
        }
    }

    /// Rewrite the hint fields of an FSInfo sector image, regenerating
    /// the three signatures.
    pub fn encode_into(&self, sector: &mut [u8]) {
        sector[0..4].copy_from_slice(&FSINFO_LEAD_SIG.to_le_bytes());
        sector[484..488].copy_from_slice(&FSINFO_STRUC_SIG.to_le_bytes());
        let free = self.free_clusters.unwrap_or(FSINFO_UNKNOWN);
        sector[488..492].copy_from_slice(&free.to_le_bytes());
        sector[492..496].copy_from_slice(&self.next_free.to_le_bytes());
        sector[508..512].copy_from_slice(&FSINFO_TRAIL_SIG.to_le_bytes());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Byte-level builders for boot and FSInfo sectors, shared by the
    //! FAT32 unit and integration tests.

    use alloc::vec;
    use alloc::vec::Vec;

    /// Parameters for a synthetic FAT32 boot sector.
    pub struct BootSectorParams {
        pub bytes_per_sector: u16,
        pub sectors_per_cluster: u8,
        pub reserved_sectors: u16,
        pub num_fats: u8,
        pub fat_size_32: u32,
        pub total_sectors_32: u32,
        pub root_cluster: u32,
        pub fsinfo_sector: u16,
    }

    impl Default for BootSectorParams {
        fn default() -> Self {
            BootSectorParams {
                bytes_per_sector: 512,
                sectors_per_cluster: 8,
                reserved_sectors: 32,
                num_fats: 2,
                fat_size_32: 8,
                total_sectors_32: 8192,
                root_cluster: 2,
                fsinfo_sector: 1,
            }
        }
    }

    /// Build a boot sector image.
    pub fn build_boot_sector(params: &BootSectorParams) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]); // jmp short
        s[3..11].copy_from_slice(b"AAAOS   ");
        s[11..13].copy_from_slice(&params.bytes_per_sector.to_le_bytes());
        s[13] = params.sectors_per_cluster;
        s[14..16].copy_from_slice(&params.reserved_sectors.to_le_bytes());
        s[16] = params.num_fats;
        // root_entries_16, total_sectors_16 stay zero on FAT32
        s[21] = 0xF8; // media: fixed disk
        // fat_size_16 stays zero
        s[32..36].copy_from_slice(&params.total_sectors_32.to_le_bytes());
        s[36..40].copy_from_slice(&params.fat_size_32.to_le_bytes());
        s[44..48].copy_from_slice(&params.root_cluster.to_le_bytes());
        s[48..50].copy_from_slice(&params.fsinfo_sector.to_le_bytes());
        s[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot sector
        s[66] = 0x29; // extended boot signature
        s[71..82].copy_from_slice(b"AAAOS  DISK");
        s[82..90].copy_from_slice(b"FAT32   ");
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    /// Build an FSInfo sector with valid signatures and given hints.
    pub fn build_fsinfo_sector(free_clusters: u32, next_free: u32) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        s[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        s[488..492].copy_from_slice(&free_clusters.to_le_bytes());
        s[492..496].copy_from_slice(&next_free.to_le_bytes());
        s[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn boot_sector_parses() {
        let sector = build_boot_sector(&BootSectorParams::default());
        let bpb = BiosParameterBlock::parse_and_validate(&sector).expect("valid boot sector");
        assert_eq!({ bpb.bytes_per_sector }, 512);
        assert_eq!(bpb.sectors_per_cluster, 8);
        assert_eq!({ bpb.reserved_sectors }, 32);
        assert_eq!(bpb.num_fats, 2);
        assert_eq!({ bpb.fat_size_32 }, 8);
        assert_eq!({ bpb.root_cluster }, 2);
        assert_eq!(bpb.total_sectors(), 8192);
    }

    #[test]
    fn bad_trailer_refused() {
        let mut sector = build_boot_sector(&BootSectorParams::default());
        sector[510] = 0;
        assert_eq!(
            BiosParameterBlock::parse_and_validate(&sector),
            Err(FsError::CorruptVolume)
        );
    }

    #[test]
    fn bad_sector_size_refused() {
        let mut sector = build_boot_sector(&BootSectorParams::default());
        sector[11..13].copy_from_slice(&777u16.to_le_bytes());
        assert_eq!(
            BiosParameterBlock::parse_and_validate(&sector),
            Err(FsError::CorruptVolume)
        );
    }

    #[test]
    fn non_power_of_two_cluster_refused() {
        let mut sector = build_boot_sector(&BootSectorParams::default());
        sector[13] = 6;
        assert_eq!(
            BiosParameterBlock::parse_and_validate(&sector),
            Err(FsError::CorruptVolume)
        );
    }

    #[test]
    fn fat16_size_field_refused() {
        // A nonzero 16-bit FAT size identifies FAT12/16.
        let mut sector = build_boot_sector(&BootSectorParams::default());
        sector[22..24].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(
            BiosParameterBlock::parse_and_validate(&sector),
            Err(FsError::CorruptVolume)
        );
    }

    #[test]
    fn geometry_arithmetic() {
        let sector = build_boot_sector(&BootSectorParams::default());
        let bpb = BiosParameterBlock::parse_and_validate(&sector).unwrap();
        let geo = Geometry::from_bpb(&bpb);

        assert_eq!(geo.fat_start_sector, 32);
        assert_eq!(geo.data_start_sector, 32 + 2 * 8);
        assert_eq!(geo.bytes_per_cluster, 4096);
        assert_eq!(geo.total_clusters, (8192 - 48) / 8);

        assert_eq!(geo.cluster_to_sector(2), geo.data_start_sector);
        assert_eq!(geo.cluster_to_sector(5), geo.data_start_sector + 24);

        assert!(!geo.is_valid_cluster(0));
        assert!(!geo.is_valid_cluster(1));
        assert!(geo.is_valid_cluster(2));
        assert!(geo.is_valid_cluster(1 + geo.total_clusters));
        assert!(!geo.is_valid_cluster(2 + geo.total_clusters));
    }

    #[test]
    fn fsinfo_round_trip() {
        let sector = build_fsinfo_sector(1000, 7);
        let info = FsInfo::parse(&sector);
        assert_eq!(info.free_clusters, Some(1000));
        assert_eq!(info.next_free, 7);

        let mut out = alloc::vec![0u8; 512];
        let state = FsInfo {
            free_clusters: Some(321),
            next_free: 9,
            dirty: true,
        };
        state.encode_into(&mut out);
        let back = FsInfo::parse(&out);
        assert_eq!(back.free_clusters, Some(321));
        assert_eq!(back.next_free, 9);
    }

    #[test]
    fn fsinfo_bad_signatures_degrade_to_unknown() {
        let mut sector = build_fsinfo_sector(1000, 7);
        sector[0] = 0;
        let info = FsInfo::parse(&sector);
        assert_eq!(info.free_clusters, None);
        assert_eq!(info.next_free, 2);

        // Unknown hint markers parse as unknown too.
        let sector = build_fsinfo_sector(0xFFFF_FFFF, 0xFFFF_FFFF);
        let info = FsInfo::parse(&sector);
        assert_eq!(info.free_clusters, None);
        assert_eq!(info.next_free, 2);
    }
}
