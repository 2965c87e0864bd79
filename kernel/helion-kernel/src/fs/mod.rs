//! Filesystem layer: VFS trait objects, the in-memory root filesystem,
//! and the initrd unpacker.
//!
//! All I/O is synchronous; the kernel is single-threaded and every backing
//! store is memory.

extern crate alloc;

pub mod initramfs;
pub mod path;
pub mod ramfs;
pub mod vfs;

use alloc::sync::Arc;

/// Filesystem error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The named entry does not exist.
    NotFound,
    /// A non-directory was used as a directory.
    NotADirectory,
    /// A directory was used where a file was expected.
    IsADirectory,
    /// An entry with that name already exists.
    AlreadyExists,
    /// The operation is not supported by this inode.
    NotSupported,
    /// An archive or on-disk structure failed to parse.
    Malformed,
    /// A name exceeded the supported length.
    NameTooLong,
}

/// The type of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// A filesystem node.
pub trait Inode: Send + Sync + core::fmt::Debug {
    /// Returns the node type.
    fn inode_type(&self) -> InodeType;

    /// Returns the file size in bytes (0 for directories).
    fn size(&self) -> usize;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at `offset`, extending the file as needed.
    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError>;

    /// Looks up a direct child by name.
    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>, FsError>;

    /// Creates a direct child.
    fn create(&self, name: &str, itype: InodeType) -> Result<Arc<dyn Inode>, FsError>;

    /// Visits each direct child with its name and type.
    fn list(&self, visit: &mut dyn FnMut(&str, InodeType)) -> Result<(), FsError>;
}

/// A mountable filesystem.
pub trait FileSystem: Send + Sync {
    /// Short name, for diagnostics.
    fn name(&self) -> &'static str;

    /// The filesystem's root directory.
    fn root(&self) -> Arc<dyn Inode>;
}
