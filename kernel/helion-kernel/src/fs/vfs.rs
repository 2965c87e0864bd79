//! Virtual filesystem: a mount table over [`FileSystem`] instances.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::SpinLock;

use super::path;
use super::ramfs::RamFs;
use super::{FileSystem, FsError, Inode, InodeType};

/// The mount table: mount point path -> filesystem.
pub struct Vfs {
    mounts: Vec<(String, Arc<dyn FileSystem>)>,
}

impl Vfs {
    /// Creates an empty VFS.
    #[must_use]
    pub fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Mounts a filesystem at `mount_point`. A later mount at the same
    /// point shadows the earlier one.
    pub fn mount(&mut self, mount_point: &str, fs: Arc<dyn FileSystem>) {
        self.mounts.push((mount_point.to_string(), fs));
    }

    /// Resolves an absolute path to an inode.
    pub fn lookup(&self, path: &str) -> Result<Arc<dyn Inode>, FsError> {
        if !path::is_absolute(path) {
            return Err(FsError::NotFound);
        }

        let mount = path::longest_prefix_match(path, self.mounts.iter().map(|(p, _)| p.as_str()))
            .ok_or(FsError::NotFound)?;
        // Prefer the most recent mount at this point.
        let fs = self
            .mounts
            .iter()
            .rev()
            .find(|(p, _)| p == mount)
            .map(|(_, fs)| fs.clone())
            .ok_or(FsError::NotFound)?;

        let mut node = fs.root();
        for component in path::components(path::strip_mount_prefix(path, mount)) {
            node = node.lookup(component)?;
        }
        Ok(node)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Global VFS instance.
static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Initializes the global VFS with a ramfs root.
pub fn init() {
    let mut vfs = Vfs::new();
    vfs.mount("/", Arc::new(RamFs::new()));

    let mut guard = VFS.lock();
    assert!(guard.is_none(), "VFS: double init");
    *guard = Some(vfs);
}

/// Runs a closure with the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut guard = VFS.lock();
    f(guard.as_mut().expect("VFS not initialized"))
}

/// Resolves an absolute path through the global VFS.
pub fn lookup(path: &str) -> Result<Arc<dyn Inode>, FsError> {
    with_vfs(|vfs| vfs.lookup(path))
}

/// Reads a whole file through the global VFS.
pub fn read_file(path: &str) -> Result<Vec<u8>, FsError> {
    let node = lookup(path)?;
    if node.inode_type() != InodeType::File {
        return Err(FsError::IsADirectory);
    }
    let mut buf = alloc::vec![0u8; node.size()];
    let n = node.read(0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs_with_root() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.mount("/", Arc::new(RamFs::new()));
        vfs
    }

    #[test]
    fn lookup_nested_path() {
        let vfs = vfs_with_root();
        let root = vfs.lookup("/").unwrap();
        let dir = root.create("etc", InodeType::Directory).unwrap();
        dir.create("motd", InodeType::File).unwrap();

        assert!(vfs.lookup("/etc/motd").is_ok());
        assert_eq!(vfs.lookup("/etc/none").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn relative_path_rejected() {
        let vfs = vfs_with_root();
        assert_eq!(vfs.lookup("etc").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn nested_mount_shadows_parent() {
        let mut vfs = vfs_with_root();
        let devfs = Arc::new(RamFs::new());
        devfs
            .root()
            .create("console", InodeType::File)
            .unwrap();
        vfs.mount("/dev", devfs);

        assert!(vfs.lookup("/dev/console").is_ok());
        // The root fs has no "dev" entry: the path resolves through the
        // mount, not the parent.
        assert!(vfs.lookup("/dev").is_ok());
    }
}
