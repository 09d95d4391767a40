//! FAT32 file content access
//!
//! Reads and writes walk the file's cluster chain, staging partial
//! clusters through the mount's scratch buffer. Writes extend the chain
//! on demand and report the new size back to the caller, who owns
//! flushing the directory entry.

use crate::fs::fat32::fat::{is_end_of_chain, ENTRY_EOC};
use crate::fs::fat32::Fat32Fs;
use crate::fs::vfs::FsError;

impl Fat32Fs {
    /// Advance `cluster` by `count` links, allocating and linking fresh
    /// zeroed clusters past the end of the chain when `extend` is set.
    fn skip_clusters(
        &mut self,
        mut cluster: u32,
        count: u64,
        extend: bool,
    ) -> Result<u32, FsError> {
        for _ in 0..count {
            let next = self.next_cluster(cluster)?;
            if is_end_of_chain(next) {
                if !extend {
                    return Ok(ENTRY_EOC);
                }
                let fresh = self.allocate_cluster()?;
                self.set_fat_entry(cluster, fresh)?;
                self.zero_cluster(fresh)?;
                cluster = fresh;
            } else {
                if !self.geometry.is_valid_cluster(next) {
                    return Err(FsError::CorruptVolume);
                }
                cluster = next;
            }
        }
        Ok(cluster)
    }

    /// Read from a file at a byte offset.
    ///
    /// The read is clamped to `file_size`; reads at or past the end
    /// return 0 bytes. An early end-of-chain simply stops the read.
    pub fn read_at(
        &mut self,
        first_cluster: u32,
        file_size: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        if offset >= file_size as u64 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((file_size as u64 - offset) as usize);
        if first_cluster == 0 {
            return Ok(0);
        }

        let bpc = self.geometry.bytes_per_cluster as u64;
        let mut cluster = self.skip_clusters(first_cluster, offset / bpc, false)?;
        if is_end_of_chain(cluster) {
            return Ok(0);
        }

        let mut done = 0usize;
        let mut within = (offset % bpc) as usize;
        while done < len {
            let mut scratch = self.take_cluster_buf();
            let read = self.read_cluster(cluster, &mut scratch);
            if let Err(err) = read {
                self.put_cluster_buf(scratch);
                return Err(err);
            }

            let chunk = (len - done).min(self.geometry.bytes_per_cluster - within);
            buf[done..done + chunk].copy_from_slice(&scratch[within..within + chunk]);
            self.put_cluster_buf(scratch);
            done += chunk;
            within = 0;

            if done >= len {
                break;
            }
            let next = self.next_cluster(cluster)?;
            if is_end_of_chain(next) {
                break; // size said more, the chain disagrees: stop
            }
            if !self.geometry.is_valid_cluster(next) {
                return Err(FsError::CorruptVolume);
            }
            cluster = next;
        }
        Ok(done)
    }

    /// Write to a file at a byte offset, read-modify-writing each
    /// touched cluster and extending the chain as needed.
    ///
    /// `first_cluster` and `file_size` are updated in place; the caller
    /// flushes them back into the directory entry.
    pub fn write_at(
        &mut self,
        first_cluster: &mut u32,
        file_size: &mut u32,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }

        // A file with no data yet gets its first cluster here.
        if *first_cluster == 0 {
            let fresh = self.allocate_cluster()?;
            self.zero_cluster(fresh)?;
            *first_cluster = fresh;
        }

        let bpc = self.geometry.bytes_per_cluster as u64;
        let mut cluster = self.skip_clusters(*first_cluster, offset / bpc, true)?;

        let mut done = 0usize;
        let mut within = (offset % bpc) as usize;
        while done < data.len() {
            let chunk = (data.len() - done).min(self.geometry.bytes_per_cluster - within);

            let mut scratch = self.take_cluster_buf();
            let result = (|| -> Result<(), FsError> {
                self.read_cluster(cluster, &mut scratch)?;
                scratch[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
                self.write_cluster(cluster, &scratch)
            })();
            self.put_cluster_buf(scratch);
            result?;

            done += chunk;
            within = 0;

            if done >= data.len() {
                break;
            }
            // More bytes to go: follow the chain, linking a fresh
            // cluster when it ends early.
            let next = self.next_cluster(cluster)?;
            if is_end_of_chain(next) {
                let fresh = self.allocate_cluster()?;
                self.set_fat_entry(cluster, fresh)?;
                self.zero_cluster(fresh)?;
                cluster = fresh;
            } else {
                if !self.geometry.is_valid_cluster(next) {
                    return Err(FsError::CorruptVolume);
                }
                cluster = next;
            }
        }

        let end = offset + done as u64;
        if end > *file_size as u64 {
            *file_size = end as u32;
        }
        Ok(done)
    }

    /// Truncate a file to `new_size`.
    ///
    /// Growing is lazy (the next write allocates); shrinking stamps the
    /// end-of-chain at the new tail cluster and frees the rest. Size
    /// zero releases the whole chain.
    pub fn truncate(
        &mut self,
        first_cluster: &mut u32,
        file_size: &mut u32,
        new_size: u32,
    ) -> Result<(), FsError> {
        self.check_writable()?;

        if new_size == 0 {
            if *first_cluster != 0 {
                self.free_chain(*first_cluster)?;
            }
            *first_cluster = 0;
            *file_size = 0;
            return Ok(());
        }

        if new_size >= *file_size {
            *file_size = new_size;
            return Ok(());
        }

        let bpc = self.geometry.bytes_per_cluster as u64;
        let keep = (new_size as u64).div_ceil(bpc);
        let tail = self.skip_clusters(*first_cluster, keep - 1, false)?;
        if !is_end_of_chain(tail) {
            let rest = self.next_cluster(tail)?;
            self.set_fat_entry(tail, ENTRY_EOC)?;
            if !is_end_of_chain(rest) && rest != 0 {
                self.free_chain(rest)?;
            }
        }
        *file_size = new_size;
        Ok(())
    }
}
