//! In-memory filesystem backed by heap allocations.
//!
//! `RamFs` is the root filesystem: the initrd is unpacked into it at boot.
//! All data lives in `Vec`s on the kernel heap.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::SpinLock;

use super::{FileSystem, FsError, Inode, InodeType};

/// A ramfs filesystem instance.
pub struct RamFs {
    root: Arc<RamInode>,
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    /// Creates a ramfs with an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamInode::directory()),
        }
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn root(&self) -> Arc<dyn Inode> {
        self.root.clone()
    }
}

/// A ramfs inode: file bytes or directory children.
pub struct RamInode {
    itype: InodeType,
    /// File contents; unused for directories.
    data: SpinLock<Vec<u8>>,
    /// Directory entries; unused for files.
    children: SpinLock<BTreeMap<String, Arc<RamInode>>>,
}

impl core::fmt::Debug for RamInode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamInode").field("itype", &self.itype).finish()
    }
}

impl RamInode {
    fn directory() -> Self {
        Self {
            itype: InodeType::Directory,
            data: SpinLock::new(Vec::new()),
            children: SpinLock::new(BTreeMap::new()),
        }
    }

    fn file() -> Self {
        Self {
            itype: InodeType::File,
            data: SpinLock::new(Vec::new()),
            children: SpinLock::new(BTreeMap::new()),
        }
    }
}

impl Inode for RamInode {
    fn inode_type(&self) -> InodeType {
        self.itype
    }

    fn size(&self) -> usize {
        match self.itype {
            InodeType::File => self.data.lock().len(),
            InodeType::Directory => 0,
        }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.itype == InodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let available = &data[offset..];
        let count = buf.len().min(available.len());
        buf[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if self.itype == InodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        self.children
            .lock()
            .get(name)
            .cloned()
            .map(|node| node as Arc<dyn Inode>)
            .ok_or(FsError::NotFound)
    }

    fn create(&self, name: &str, itype: InodeType) -> Result<Arc<dyn Inode>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        let node = Arc::new(match itype {
            InodeType::File => RamInode::file(),
            InodeType::Directory => RamInode::directory(),
        });
        children.insert(name.to_string(), node.clone());
        Ok(node)
    }

    fn list(&self, visit: &mut dyn FnMut(&str, InodeType)) -> Result<(), FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        for (name, node) in self.children.lock().iter() {
            visit(name, node.itype);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_roundtrip() {
        let fs = RamFs::new();
        let root = fs.root();
        let file = root.create("hello", InodeType::File).unwrap();
        assert_eq!(file.write(0, b"world").unwrap(), 5);
        assert_eq!(file.size(), 5);

        let mut buf = [0u8; 8];
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let fs = RamFs::new();
        let file = fs.root().create("f", InodeType::File).unwrap();
        file.write(0, b"abc").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let fs = RamFs::new();
        let file = fs.root().create("f", InodeType::File).unwrap();
        file.write(4, b"x").unwrap();
        let mut buf = [0xFFu8; 5];
        assert_eq!(file.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn duplicate_create_rejected() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("x", InodeType::File).unwrap();
        assert_eq!(
            root.create("x", InodeType::File).unwrap_err(),
            FsError::AlreadyExists
        );
    }

    #[test]
    fn lookup_on_file_fails() {
        let fs = RamFs::new();
        let file = fs.root().create("f", InodeType::File).unwrap();
        assert_eq!(file.lookup("x").unwrap_err(), FsError::NotADirectory);
    }

    #[test]
    fn list_visits_children_sorted() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("b", InodeType::File).unwrap();
        root.create("a", InodeType::Directory).unwrap();

        let mut seen = Vec::new();
        root.list(&mut |name, itype| seen.push((name.to_string(), itype)))
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), InodeType::Directory),
                ("b".to_string(), InodeType::File)
            ]
        );
    }
}
