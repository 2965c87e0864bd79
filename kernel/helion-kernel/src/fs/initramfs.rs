//! CPIO initrd unpacker.
//!
//! The boot loader hands the kernel one module: a CPIO `newc` archive.
//! Its directories are created in the root filesystem on demand and its
//! regular files are copied into heap-backed ramfs files. Entry names
//! longer than 256 bytes are skipped; a truncated or bad-magic archive
//! surfaces [`FsError::Malformed`].

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;

use hadris_cpio::CpioReader;
use hadris_cpio::mode::FileType;
use hadris_io::Cursor;

use super::{FsError, Inode, InodeType};

/// Longest entry name accepted.
const MAX_NAME: usize = 256;

/// Unpacks a CPIO `newc` archive into the given root directory.
///
/// Returns the number of regular files created.
///
/// # Errors
///
/// Returns [`FsError::Malformed`] when the archive cannot be parsed.
pub fn unpack_cpio_into(archive: &[u8], root: &Arc<dyn Inode>) -> Result<usize, FsError> {
    let mut reader = CpioReader::new(Cursor::new(archive));
    let mut name_buf = [0u8; 512];
    let mut file_count = 0;

    loop {
        let entry = reader
            .next_entry_with_buf(&mut name_buf)
            .map_err(|_| FsError::Malformed)?;
        let Some(entry) = entry else {
            break;
        };

        let name = entry.name_str().unwrap_or("");
        let name = name.strip_prefix('/').unwrap_or(name);

        // The archive root and empty names carry no content.
        if name.is_empty() || name == "." {
            reader
                .skip_entry_data(&entry)
                .map_err(|_| FsError::Malformed)?;
            continue;
        }

        if name.len() > MAX_NAME {
            crate::kwarn!("initrd: skipping over-long name ({} bytes)", name.len());
            reader
                .skip_entry_data(&entry)
                .map_err(|_| FsError::Malformed)?;
            continue;
        }

        match entry.file_type() {
            FileType::Directory => {
                ensure_directory(root, name)?;
                reader
                    .skip_entry_data(&entry)
                    .map_err(|_| FsError::Malformed)?;
            }
            FileType::Regular => {
                let file_size = entry.file_size() as usize;

                let (parent, file_name) = match name.rsplit_once('/') {
                    Some((dir, file)) => (ensure_directory(root, dir)?, file),
                    None => (root.clone(), name),
                };

                let file = parent.create(file_name, InodeType::File)?;

                if file_size > 0 {
                    let mut buf = vec![0u8; file_size];
                    reader
                        .read_entry_data(&entry, &mut buf)
                        .map_err(|_| FsError::Malformed)?;
                    let written = file.write(0, &buf)?;
                    if written != file_size {
                        return Err(FsError::Malformed);
                    }
                } else {
                    reader
                        .skip_entry_data(&entry)
                        .map_err(|_| FsError::Malformed)?;
                }

                file_count += 1;
            }
            _ => {
                // Symlinks, device nodes, FIFOs: not represented in ramfs.
                reader
                    .skip_entry_data(&entry)
                    .map_err(|_| FsError::Malformed)?;
            }
        }
    }

    Ok(file_count)
}

/// Unpacks the initrd into the global VFS root.
///
/// # Errors
///
/// As [`unpack_cpio_into`]; additionally fails if the VFS has no root.
pub fn unpack_cpio(archive: &[u8]) -> Result<usize, FsError> {
    let root = super::vfs::lookup("/")?;
    unpack_cpio_into(archive, &root)
}

/// Walks (creating as needed) a `/`-separated directory path under `root`.
fn ensure_directory(root: &Arc<dyn Inode>, dir_path: &str) -> Result<Arc<dyn Inode>, FsError> {
    let mut current = root.clone();
    for component in super::path::components(dir_path) {
        current = match current.lookup(component) {
            Ok(node) => node,
            Err(FsError::NotFound) => current.create(component, InodeType::Directory)?,
            Err(e) => return Err(e),
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystem;
    use crate::fs::ramfs::RamFs;

    /// Mode bits for a regular file in a CPIO header.
    const MODE_FILE: u32 = 0o100644;
    /// Mode bits for a directory.
    const MODE_DIR: u32 = 0o040755;

    fn pad4(buf: &mut Vec<u8>) {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    /// Appends one `newc` entry: 110-byte header with 8-digit hex fields,
    /// NUL-terminated name padded to 4, data padded to 4.
    fn push_entry(buf: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
        let mut header = String::from("070701");
        let fields = [
            1,                      // ino
            mode,                   // mode
            0,                      // uid
            0,                      // gid
            1,                      // nlink
            0,                      // mtime
            data.len() as u32,      // filesize
            0,                      // devmajor
            0,                      // devminor
            0,                      // rdevmajor
            0,                      // rdevminor
            (name.len() + 1) as u32, // namesize incl. NUL
            0,                      // check
        ];
        for field in fields {
            header.push_str(&format!("{field:08X}"));
        }
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        pad4(buf);
        buf.extend_from_slice(data);
        pad4(buf);
    }

    fn archive(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (name, mode, data) in entries {
            push_entry(&mut buf, name, *mode, data);
        }
        push_entry(&mut buf, "TRAILER!!!", 0, &[]);
        buf
    }

    #[test]
    fn unpacks_single_file_with_exact_bytes() {
        let payload: Vec<u8> = (0..42u8).collect();
        let data = archive(&[("assets/cursor.png", MODE_FILE, &payload)]);

        let fs = RamFs::new();
        let root = fs.root();
        let count = unpack_cpio_into(&data, &root).unwrap();
        assert_eq!(count, 1);

        let node = root
            .lookup("assets")
            .unwrap()
            .lookup("cursor.png")
            .unwrap();
        assert_eq!(node.size(), 42);
        let mut buf = [0u8; 42];
        assert_eq!(node.read(0, &mut buf).unwrap(), 42);
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn creates_listed_directories() {
        let data = archive(&[
            ("boot", MODE_DIR, &[]),
            ("boot/config", MODE_FILE, b"x=1\n"),
        ]);

        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(unpack_cpio_into(&data, &root).unwrap(), 1);
        let dir = root.lookup("boot").unwrap();
        assert_eq!(dir.inode_type(), InodeType::Directory);
        assert!(dir.lookup("config").is_ok());
    }

    #[test]
    fn over_long_names_are_skipped() {
        let long_name = "a/".repeat(140) + "f";
        let data = archive(&[
            (long_name.as_str(), MODE_FILE, b"skipped"),
            ("kept", MODE_FILE, b"ok"),
        ]);

        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(unpack_cpio_into(&data, &root).unwrap(), 1);
        assert!(root.lookup("kept").is_ok());
    }

    #[test]
    fn truncated_archive_is_malformed() {
        let payload = b"0123456789";
        let mut data = archive(&[("f", MODE_FILE, payload)]);
        data.truncate(110 + 8); // cut inside the first entry's name/data
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(
            unpack_cpio_into(&data, &root).unwrap_err(),
            FsError::Malformed
        );
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut data = archive(&[("f", MODE_FILE, b"abc")]);
        data[0] = b'9';
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(
            unpack_cpio_into(&data, &root).unwrap_err(),
            FsError::Malformed
        );
    }

    #[test]
    fn empty_archive_unpacks_nothing() {
        let data = archive(&[]);
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(unpack_cpio_into(&data, &root).unwrap(), 0);
    }
}
