//! Read-only memory maps held under a shared file lock
//!
//! Signature generation and block matching read the whole file by offset.
//! Mapping it under a shared lock keeps cooperating writers from truncating
//! the file underneath the map.

use crate::error::{Error, Result};
use fs2::FileExt;
use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;

/// A memory-mapped file with an associated shared (read) lock.
///
/// Empty files are not mapped; they deref to an empty slice.
pub struct LockedMmap {
    mmap: Option<Mmap>,
    /// Keeps the lock alive; released on drop
    #[allow(dead_code)]
    file: File,
}

impl LockedMmap {
    /// Open and map a file under a shared lock
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io("opening file for mmap", e))?;
        Self::from_file(file)
    }

    /// Map an already-opened file under a shared lock
    pub fn from_file(file: File) -> Result<Self> {
        FileExt::lock_shared(&file).map_err(|e| Error::io("acquiring shared file lock", e))?;

        let len = file
            .metadata()
            .map_err(|e| Error::io("reading metadata for mmap", e))?
            .len();

        let mmap = if len == 0 {
            None
        } else {
            // Safety: the shared lock keeps cooperating processes from
            // truncating the file while the map is alive.
            Some(unsafe { Mmap::map(&file) }.map_err(|e| Error::io("memory mapping file", e))?)
        };

        Ok(Self { mmap, file })
    }

    /// Length of the mapped region
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    /// Check if the mapped region is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for LockedMmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.mmap {
            Some(m) => &m[..],
            None => &[],
        }
    }
}

impl AsRef<[u8]> for LockedMmap {
    fn as_ref(&self) -> &[u8] {
        &self[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_locked_mmap_basic() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"hello world").unwrap();
        temp.flush().unwrap();

        let mmap = LockedMmap::open(temp.path()).unwrap();
        assert_eq!(&mmap[..], b"hello world");
        assert_eq!(mmap.len(), 11);
    }

    #[test]
    fn test_locked_mmap_empty_file() {
        let temp = NamedTempFile::new().unwrap();

        let mmap = LockedMmap::open(temp.path()).unwrap();
        assert!(mmap.is_empty());
        assert_eq!(&mmap[..], b"");
    }

    #[test]
    fn test_missing_file() {
        let result = LockedMmap::open(Path::new("/nonexistent/deltablob/file"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
