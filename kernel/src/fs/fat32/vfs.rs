//! VFS port implementation for FAT32
//!
//! Adapts `Fat32Fs` to the `FileSystem` trait. Nodes carry the entry's
//! first cluster as their inode and the first cluster of the containing
//! directory as their parent; size updates after a write are flushed
//! back into the entry by walking the parent directory, so files nested
//! below the root update the right entry.

use alloc::string::String;
use alloc::vec::Vec;

use crate::fs::fat32::dir::{DirEntry, ATTR_ARCHIVE, ATTR_DIRECTORY};
use crate::fs::fat32::Fat32Fs;
use crate::fs::vfs::{FileSystem, FileType, FsError, FsStats, VfsNode};

fn node_from_entry(entry: &DirEntry, parent: u32) -> VfsNode {
    VfsNode {
        name: entry.name.clone(),
        file_type: if entry.is_directory() {
            FileType::Directory
        } else {
            FileType::Regular
        },
        size: entry.size as u64,
        read_only: entry.is_read_only(),
        inode: entry.first_cluster as u64,
        parent: parent as u64,
    }
}

impl Fat32Fs {
    fn root_node(&self) -> VfsNode {
        VfsNode {
            name: String::from("/"),
            file_type: FileType::Directory,
            size: 0,
            read_only: false,
            inode: self.geometry.root_cluster as u64,
            parent: self.geometry.root_cluster as u64,
        }
    }
}

impl FileSystem for Fat32Fs {
    fn open(&mut self, path: &str) -> Result<VfsNode, FsError> {
        let (entry, parent) = self.resolve(path)?;
        if entry.first_cluster == self.geometry.root_cluster && entry.is_directory() {
            return Ok(self.root_node());
        }
        Ok(node_from_entry(&entry, parent))
    }

    fn close(&mut self, _node: &VfsNode) -> Result<(), FsError> {
        Ok(())
    }

    fn read(&mut self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.read_at(node.inode as u32, node.size as u32, offset, buf)
    }

    fn write(&mut self, node: &mut VfsNode, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.check_writable()?;

        let mut first_cluster = node.inode as u32;
        let mut size = node.size as u32;
        let written = self.write_at(&mut first_cluster, &mut size, offset, data)?;

        // Flush the entry in the node's own parent directory. The root
        // cluster is only correct for files that actually live there.
        if first_cluster != node.inode as u32 || size as u64 != node.size {
            self.update_entry(node.parent as u32, &node.name, first_cluster, size)?;
            node.inode = first_cluster as u64;
            node.size = size as u64;
        }
        Ok(written)
    }

    fn readdir(&mut self, node: &VfsNode) -> Result<Vec<VfsNode>, FsError> {
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let dir_cluster = node.inode as u32;
        let entries = self.list_dir(dir_cluster)?;
        Ok(entries
            .iter()
            .map(|e| node_from_entry(e, dir_cluster))
            .collect())
    }

    fn finddir(&mut self, node: &VfsNode, name: &str) -> Result<VfsNode, FsError> {
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let dir_cluster = node.inode as u32;
        let entry = self
            .find_in_dir(dir_cluster, name)?
            .ok_or(FsError::NotFound)?;
        Ok(node_from_entry(&entry, dir_cluster))
    }

    fn stat(&mut self, path: &str) -> Result<VfsNode, FsError> {
        self.open(path)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let (dir_cluster, leaf) = self.resolve_parent(path)?;
        self.create_entry(dir_cluster, leaf, ATTR_DIRECTORY)?;
        Ok(())
    }

    fn create(&mut self, path: &str) -> Result<VfsNode, FsError> {
        self.check_writable()?;
        let (dir_cluster, leaf) = self.resolve_parent(path)?;
        let entry = self.create_entry(dir_cluster, leaf, ATTR_ARCHIVE)?;
        Ok(node_from_entry(&entry, dir_cluster))
    }

    fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let (dir_cluster, leaf) = self.resolve_parent(path)?;
        self.delete_entry(dir_cluster, leaf)
    }

    fn truncate(&mut self, node: &mut VfsNode, size: u64) -> Result<(), FsError> {
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.check_writable()?;

        let mut first_cluster = node.inode as u32;
        let mut file_size = node.size as u32;
        Fat32Fs::truncate(self, &mut first_cluster, &mut file_size, size as u32)?;

        if first_cluster != node.inode as u32 || file_size as u64 != node.size {
            self.update_entry(node.parent as u32, &node.name, first_cluster, file_size)?;
            node.inode = first_cluster as u64;
            node.size = file_size as u64;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FsError> {
        Fat32Fs::sync(self)
    }

    fn statfs(&mut self) -> Result<FsStats, FsError> {
        let free = self.free_clusters()?;
        let bpc = self.geometry.bytes_per_cluster as u64;
        Ok(FsStats {
            total_bytes: self.geometry.total_clusters as u64 * bpc,
            free_bytes: free as u64 * bpc,
        })
    }
}
