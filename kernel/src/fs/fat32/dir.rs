//! FAT32 directory entries and directory operations
//!
//! Directories are cluster chains of 32-byte entries. A first name byte
//! of 0x00 ends the directory; 0xE5 marks a free slot. Long-filename
//! and volume-label entries are recognized and skipped; this driver
//! reads and writes short (8.3) names only.

use alloc::string::String;
use alloc::vec::Vec;

use crate::fs::fat32::fat::is_end_of_chain;
use crate::fs::fat32::Fat32Fs;
use crate::fs::vfs::FsError;

/// Attribute bits
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;

/// The four low attribute bits together signal a long-filename entry.
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// First name byte of a free slot.
pub const ENTRY_FREE: u8 = 0xE5;
/// First name byte terminating the directory.
pub const ENTRY_END: u8 = 0x00;

/// One on-disk directory entry, 32 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DirEntryRaw {
    pub name: [u8; 11],
    pub attr: u8,
    nt_reserved: u8,
    create_time_tenths: u8,
    create_time: u16,
    create_date: u16,
    access_date: u16,
    first_cluster_high: u16,
    write_time: u16,
    write_date: u16,
    first_cluster_low: u16,
    pub file_size: u32,
}

impl DirEntryRaw {
    pub const SIZE: usize = 32;

    /// A zeroed entry with the given short name and attributes.
    pub fn new(short_name: [u8; 11], attr: u8) -> Self {
        let mut entry: DirEntryRaw = unsafe { core::mem::zeroed() };
        entry.name = short_name;
        entry.attr = attr;
        entry
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::SIZE);
        // SAFETY: packed struct, unaligned read from a checked slice.
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const DirEntryRaw) }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        debug_assert!(bytes.len() >= Self::SIZE);
        // SAFETY: packed struct, unaligned write into a checked slice.
        unsafe { core::ptr::write_unaligned(bytes.as_mut_ptr() as *mut DirEntryRaw, *self) }
    }

    /// The two on-disk cluster halves joined.
    pub fn first_cluster(&self) -> u32 {
        ((self.first_cluster_high as u32) << 16) | self.first_cluster_low as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_high = (cluster >> 16) as u16;
        self.first_cluster_low = cluster as u16;
    }

    pub fn is_end(&self) -> bool {
        self.name[0] == ENTRY_END
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == ENTRY_FREE
    }

    pub fn is_long_name(&self) -> bool {
        self.attr & ATTR_LONG_NAME == ATTR_LONG_NAME
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attr & ATTR_VOLUME_ID != 0
    }

    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// Entries the scanners skip: long-name runs and the volume label.
    pub fn is_skipped(&self) -> bool {
        self.is_long_name() || self.is_volume_label()
    }
}

/// Where an entry lives: the directory cluster holding it and its
/// 32-byte slot index inside that cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub cluster: u32,
    pub index: usize,
}

/// A parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attr: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub location: EntryLocation,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & ATTR_READ_ONLY != 0
    }
}

/// Characters allowed in a short name besides letters and digits.
const SHORT_NAME_PUNCT: &[u8] = b"!#$%&'()-@^_`{}~";

fn short_name_byte(b: u8) -> u8 {
    let up = b.to_ascii_uppercase();
    if up.is_ascii_uppercase() || up.is_ascii_digit() || SHORT_NAME_PUNCT.contains(&up) {
        up
    } else {
        b'_'
    }
}

/// Convert a file name to the on-disk 8.3 form: uppercase, filtered to
/// the permitted character set, name and extension padded with spaces.
/// Overlong parts are truncated.
pub fn short_name_from_str(name: &str) -> Result<[u8; 11], FsError> {
    if name.is_empty() {
        return Err(FsError::InvalidPath);
    }
    let mut out = [b' '; 11];

    // The dot entries are stored literally.
    if name == "." {
        out[0] = b'.';
        return Ok(out);
    }
    if name == ".." {
        out[0] = b'.';
        out[1] = b'.';
        return Ok(out);
    }

    let (stem, ext) = match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => (&name[..pos], &name[pos + 1..]),
    };
    if stem.is_empty() {
        return Err(FsError::InvalidPath);
    }

    for (i, &b) in stem.as_bytes().iter().take(8).enumerate() {
        out[i] = short_name_byte(b);
    }
    for (i, &b) in ext.as_bytes().iter().take(3).enumerate() {
        out[8 + i] = short_name_byte(b);
    }
    Ok(out)
}

/// Render an on-disk short name: trailing spaces trimmed from name and
/// extension, a dot inserted when an extension exists.
pub fn format_short_name(raw: &[u8; 11]) -> String {
    let stem_len = raw[..8].iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    let ext_len = raw[8..].iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);

    let mut out = String::with_capacity(12);
    for &b in &raw[..stem_len] {
        out.push(b as char);
    }
    if ext_len > 0 {
        out.push('.');
        for &b in &raw[8..8 + ext_len] {
            out.push(b as char);
        }
    }
    out
}

/// Case-insensitive comparison of a query name against an on-disk short
/// name, done by converting the query to 8.3 form.
pub fn short_name_matches(raw: &[u8; 11], name: &str) -> bool {
    match short_name_from_str(name) {
        Ok(converted) => converted == *raw,
        Err(_) => false,
    }
}

impl Fat32Fs {
    /// Walk every entry slot of a directory chain until the visitor
    /// returns `Some` or the end-of-directory sentinel is reached.
    ///
    /// The visitor sees every slot, including free ones, so scanners
    /// looking for free slots and scanners looking for names share the
    /// same walk.
    pub(crate) fn scan_dir<R>(
        &mut self,
        dir_cluster: u32,
        mut visit: impl FnMut(&DirEntryRaw, EntryLocation) -> Option<R>,
    ) -> Result<Option<R>, FsError> {
        let entries_per_cluster = self.geometry.bytes_per_cluster / DirEntryRaw::SIZE;
        let mut cluster = dir_cluster;

        loop {
            let mut buf = self.take_cluster_buf();
            let read = self.read_cluster(cluster, &mut buf);
            if let Err(err) = read {
                self.put_cluster_buf(buf);
                return Err(err);
            }

            for index in 0..entries_per_cluster {
                let raw = DirEntryRaw::from_bytes(&buf[index * DirEntryRaw::SIZE..]);
                if raw.is_end() {
                    self.put_cluster_buf(buf);
                    return Ok(None);
                }
                let location = EntryLocation { cluster, index };
                if let Some(result) = visit(&raw, location) {
                    self.put_cluster_buf(buf);
                    return Ok(Some(result));
                }
            }
            self.put_cluster_buf(buf);

            let next = self.next_cluster(cluster)?;
            if is_end_of_chain(next) {
                return Ok(None);
            }
            if !self.geometry.is_valid_cluster(next) {
                return Err(FsError::CorruptVolume);
            }
            cluster = next;
        }
    }

    /// List a directory.
    ///
    /// A first counting pass sizes the result array, then a fill pass
    /// collects every live, non-skipped entry.
    pub fn list_dir(&mut self, dir_cluster: u32) -> Result<Vec<DirEntry>, FsError> {
        let mut count = 0usize;
        self.scan_dir(dir_cluster, |raw, _| {
            if !raw.is_free() && !raw.is_skipped() {
                count += 1;
            }
            None::<()>
        })?;

        let mut entries = Vec::with_capacity(count);
        self.scan_dir(dir_cluster, |raw, location| {
            if !raw.is_free() && !raw.is_skipped() {
                entries.push(DirEntry {
                    name: format_short_name(&raw.name),
                    attr: raw.attr,
                    first_cluster: raw.first_cluster(),
                    size: raw.file_size,
                    location,
                });
            }
            None::<()>
        })?;
        Ok(entries)
    }

    /// Look up one name in a directory. Case-insensitive 8.3 match.
    pub fn find_in_dir(
        &mut self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<DirEntry>, FsError> {
        self.scan_dir(dir_cluster, |raw, location| {
            if raw.is_free() || raw.is_skipped() {
                return None;
            }
            if short_name_matches(&raw.name, name) {
                Some(DirEntry {
                    name: format_short_name(&raw.name),
                    attr: raw.attr,
                    first_cluster: raw.first_cluster(),
                    size: raw.file_size,
                    location,
                })
            } else {
                None
            }
        })
    }

    /// Overwrite the 32-byte slot at `location`.
    pub(crate) fn write_entry_at(
        &mut self,
        location: EntryLocation,
        raw: &DirEntryRaw,
    ) -> Result<(), FsError> {
        let mut buf = self.take_cluster_buf();
        let result = (|| {
            self.read_cluster(location.cluster, &mut buf)?;
            raw.write_to(&mut buf[location.index * DirEntryRaw::SIZE..]);
            self.write_cluster(location.cluster, &buf)
        })();
        self.put_cluster_buf(buf);
        result
    }

    /// Find a free or end slot in a directory, appending a fresh
    /// cluster to the chain when every slot is taken.
    fn find_free_slot(&mut self, dir_cluster: u32) -> Result<EntryLocation, FsError> {
        let found = self.scan_dir(dir_cluster, |raw, location| {
            if raw.is_free() {
                Some(location)
            } else {
                None
            }
        })?;
        if let Some(location) = found {
            return Ok(location);
        }

        // scan_dir stops at the end sentinel without telling us where it
        // was; find it by walking slots again, tracking the last slot.
        let entries_per_cluster = self.geometry.bytes_per_cluster / DirEntryRaw::SIZE;
        let mut cluster = dir_cluster;
        loop {
            let mut buf = self.take_cluster_buf();
            let read = self.read_cluster(cluster, &mut buf);
            if let Err(err) = read {
                self.put_cluster_buf(buf);
                return Err(err);
            }
            for index in 0..entries_per_cluster {
                if buf[index * DirEntryRaw::SIZE] == ENTRY_END {
                    self.put_cluster_buf(buf);
                    return Ok(EntryLocation { cluster, index });
                }
            }
            self.put_cluster_buf(buf);

            let next = self.next_cluster(cluster)?;
            if is_end_of_chain(next) {
                // Directory completely full: grow the chain.
                let fresh = self.allocate_cluster()?;
                self.set_fat_entry(cluster, fresh)?;
                self.zero_cluster(fresh)?;
                return Ok(EntryLocation {
                    cluster: fresh,
                    index: 0,
                });
            }
            if !self.geometry.is_valid_cluster(next) {
                return Err(FsError::CorruptVolume);
            }
            cluster = next;
        }
    }

    /// Create an entry in a directory.
    ///
    /// For a directory entry, a first data cluster is allocated, zeroed
    /// and seeded with `.` and `..`.
    pub fn create_entry(
        &mut self,
        dir_cluster: u32,
        name: &str,
        attr: u8,
    ) -> Result<DirEntry, FsError> {
        self.check_writable()?;
        if self.find_in_dir(dir_cluster, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let short_name = short_name_from_str(name)?;
        let location = self.find_free_slot(dir_cluster)?;

        let mut raw = DirEntryRaw::new(short_name, attr);

        if attr & ATTR_DIRECTORY != 0 {
            let first = self.allocate_cluster()?;
            self.zero_cluster(first)?;
            raw.set_first_cluster(first);

            // Seed the two dot entries: `.` points at the new directory,
            // `..` at its parent (zero when the parent is the root).
            let mut buf = self.take_cluster_buf();
            buf.fill(0);
            let mut dot = DirEntryRaw::new(short_name_from_str(".").unwrap(), ATTR_DIRECTORY);
            dot.set_first_cluster(first);
            dot.write_to(&mut buf[0..]);
            let mut dotdot = DirEntryRaw::new(short_name_from_str("..").unwrap(), ATTR_DIRECTORY);
            let parent_on_disk = if dir_cluster == self.geometry.root_cluster {
                0
            } else {
                dir_cluster
            };
            dotdot.set_first_cluster(parent_on_disk);
            dotdot.write_to(&mut buf[DirEntryRaw::SIZE..]);
            let write = self.write_cluster(first, &buf);
            self.put_cluster_buf(buf);
            write?;
        }

        self.write_entry_at(location, &raw)?;

        Ok(DirEntry {
            name: format_short_name(&short_name),
            attr,
            first_cluster: raw.first_cluster(),
            size: 0,
            location,
        })
    }

    /// Whether a directory holds nothing but dot entries and free slots.
    pub fn dir_is_empty(&mut self, dir_cluster: u32) -> Result<bool, FsError> {
        let occupied = self.scan_dir(dir_cluster, |raw, _| {
            if raw.is_free() || raw.is_skipped() {
                return None;
            }
            if raw.name[0] == b'.' {
                return None; // "." and ".."
            }
            Some(())
        })?;
        Ok(occupied.is_none())
    }

    /// Delete an entry by name: free its cluster chain and stamp the
    /// first name byte. A directory must be empty first.
    pub fn delete_entry(&mut self, dir_cluster: u32, name: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let entry = self
            .find_in_dir(dir_cluster, name)?
            .ok_or(FsError::NotFound)?;

        if entry.is_directory() && !self.dir_is_empty(entry.first_cluster)? {
            return Err(FsError::NotEmpty);
        }

        if entry.first_cluster != 0 {
            self.free_chain(entry.first_cluster)?;
        }

        let mut buf = self.take_cluster_buf();
        let result = (|| {
            self.read_cluster(entry.location.cluster, &mut buf)?;
            buf[entry.location.index * DirEntryRaw::SIZE] = ENTRY_FREE;
            self.write_cluster(entry.location.cluster, &buf)
        })();
        self.put_cluster_buf(buf);
        result
    }

    /// Flush updated size and first-cluster fields into an existing
    /// entry, found by name in its parent directory.
    pub(crate) fn update_entry(
        &mut self,
        dir_cluster: u32,
        name: &str,
        first_cluster: u32,
        size: u32,
    ) -> Result<(), FsError> {
        let entry = self
            .find_in_dir(dir_cluster, name)?
            .ok_or(FsError::NotFound)?;

        let mut buf = self.take_cluster_buf();
        let result = (|| {
            self.read_cluster(entry.location.cluster, &mut buf)?;
            let offset = entry.location.index * DirEntryRaw::SIZE;
            let mut raw = DirEntryRaw::from_bytes(&buf[offset..]);
            raw.set_first_cluster(first_cluster);
            raw.file_size = size;
            raw.write_to(&mut buf[offset..]);
            self.write_cluster(entry.location.cluster, &buf)
        })();
        self.put_cluster_buf(buf);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_conversion() {
        assert_eq!(short_name_from_str("hello.txt").unwrap(), *b"HELLO   TXT");
        assert_eq!(short_name_from_str("A").unwrap(), *b"A          ");
        assert_eq!(short_name_from_str("noext").unwrap(), *b"NOEXT      ");
        assert_eq!(short_name_from_str("f.c").unwrap(), *b"F       C  ");
        // Overlong parts truncate.
        assert_eq!(
            short_name_from_str("longfilename.text").unwrap(),
            *b"LONGFILETEX"
        );
        // Disallowed characters become underscores.
        assert_eq!(short_name_from_str("a+b.t?t").unwrap(), *b"A_B     T_T");
        // Leading-dot names keep the dot as part of the stem rules.
        assert_eq!(short_name_from_str(".hidden").unwrap(), *b"_HIDDEN    ");

        assert_eq!(short_name_from_str(""), Err(FsError::InvalidPath));
    }

    #[test]
    fn dot_entries_are_literal() {
        assert_eq!(short_name_from_str(".").unwrap(), *b".          ");
        assert_eq!(short_name_from_str("..").unwrap(), *b"..         ");
    }

    #[test]
    fn short_name_formatting() {
        assert_eq!(format_short_name(b"HELLO   TXT"), "HELLO.TXT");
        assert_eq!(format_short_name(b"NOEXT      "), "NOEXT");
        assert_eq!(format_short_name(b"A       B  "), "A.B");
        assert_eq!(format_short_name(b".          "), ".");
        assert_eq!(format_short_name(b"..         "), "..");
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(short_name_matches(b"HELLO   TXT", "hello.txt"));
        assert!(short_name_matches(b"HELLO   TXT", "HELLO.TXT"));
        assert!(short_name_matches(b"HELLO   TXT", "Hello.Txt"));
        assert!(!short_name_matches(b"HELLO   TXT", "hello.txd"));
        assert!(!short_name_matches(b"HELLO   TXT", "hello"));
    }

    #[test]
    fn raw_entry_round_trip() {
        let mut raw = DirEntryRaw::new(*b"FILE    BIN", ATTR_ARCHIVE);
        raw.set_first_cluster(0x0012_3456);
        raw.file_size = 1234;

        let mut bytes = [0u8; 32];
        raw.write_to(&mut bytes);

        // Cluster halves land in their on-disk slots.
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]), 0x0012);
        assert_eq!(u16::from_le_bytes([bytes[26], bytes[27]]), 0x3456);
        assert_eq!(
            u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
            1234
        );

        let back = DirEntryRaw::from_bytes(&bytes);
        assert_eq!(back.name, *b"FILE    BIN");
        assert_eq!(back.first_cluster(), 0x0012_3456);
        assert_eq!({ back.file_size }, 1234);
        assert!(!back.is_directory());
        assert!(!back.is_skipped());
    }

    #[test]
    fn long_name_and_label_entries_are_skipped() {
        let lfn = DirEntryRaw::new([0x41; 11], ATTR_LONG_NAME);
        assert!(lfn.is_long_name());
        assert!(lfn.is_skipped());

        let label = DirEntryRaw::new(*b"AAAOS  DISK", ATTR_VOLUME_ID);
        assert!(!label.is_long_name());
        assert!(label.is_volume_label());
        assert!(label.is_skipped());

        let dir = DirEntryRaw::new(*b"SUBDIR     ", ATTR_DIRECTORY);
        assert!(!dir.is_skipped());
        assert!(dir.is_directory());
    }

    #[test]
    fn sentinel_bytes() {
        let mut raw = DirEntryRaw::new(*b"DELETED TXT", ATTR_ARCHIVE);
        raw.name[0] = ENTRY_FREE;
        assert!(raw.is_free());

        let end = DirEntryRaw::new([0; 11], 0);
        assert!(end.is_end());
    }
}
