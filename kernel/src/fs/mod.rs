//! Filesystems
//!
//! The VFS layer defines the node and error types plus the mount
//! registry; concrete filesystems (FAT32) implement its `FileSystem`
//! trait over an injected block device.

pub mod fat32;
pub mod vfs;
