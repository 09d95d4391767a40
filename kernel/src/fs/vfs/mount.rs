//! Mount point management
//!
//! A small table mapping path prefixes to mounted filesystems. Lookup
//! picks the longest matching prefix and hands the remainder of the
//! path to the filesystem.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;

use super::{FileSystem, FsError};

struct Mount {
    path: String,
    fs: Box<dyn FileSystem>,
}

static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// Normalize a mount path: leading slash, no trailing slash (except root).
fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        alloc::format!("/{}", trimmed)
    }
}

/// Mount a filesystem at a path. Refuses an already-occupied path.
pub fn mount(path: &str, fs: Box<dyn FileSystem>) -> Result<(), FsError> {
    let path = normalize(path);
    let mut mounts = MOUNTS.lock();
    if mounts.iter().any(|m| m.path == path) {
        return Err(FsError::AlreadyExists);
    }
    log::info!("vfs: mounted filesystem at {}", path);
    mounts.push(Mount { path, fs });
    Ok(())
}

/// Unmount the filesystem at a path, flushing it first.
pub fn unmount(path: &str) -> Result<(), FsError> {
    let path = normalize(path);
    let mut mounts = MOUNTS.lock();
    let index = mounts
        .iter()
        .position(|m| m.path == path)
        .ok_or(FsError::NotMounted)?;
    mounts[index].fs.sync()?;
    mounts.remove(index);
    log::info!("vfs: unmounted {}", path);
    Ok(())
}

/// Find the mount owning `path` and run `f` against it with the
/// mount-relative remainder of the path.
pub fn with_fs<R>(
    path: &str,
    f: impl FnOnce(&mut dyn FileSystem, &str) -> Result<R, FsError>,
) -> Result<R, FsError> {
    let mut mounts = MOUNTS.lock();

    // Longest matching prefix wins, so "/data" beats "/".
    let mut best: Option<usize> = None;
    for (i, m) in mounts.iter().enumerate() {
        let matches = if m.path == "/" {
            path.starts_with('/')
        } else {
            path == m.path || path.starts_with(&alloc::format!("{}/", m.path))
        };
        if matches {
            match best {
                Some(b) if mounts[b].path.len() >= m.path.len() => {}
                _ => best = Some(i),
            }
        }
    }

    let index = best.ok_or(FsError::NotMounted)?;
    let prefix_len = if mounts[index].path == "/" {
        0
    } else {
        mounts[index].path.len()
    };
    let rest = &path[prefix_len..];
    let rest = if rest.is_empty() { "/" } else { rest };
    f(mounts[index].fs.as_mut(), rest)
}
