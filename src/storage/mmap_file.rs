use std::fs::File;
use std::path::Path;
use memmap2::{Mmap, MmapOptions};
use crate::core::error::{Error, Result};

/// Read-only memory map of an immutable file.
pub struct MmapFile {
    mmap: Mmap,
}

impl MmapFile {
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;

        // Mapped files are renamed into place complete and never written again
        let mmap = unsafe { MmapOptions::new().len(len).map(&file)? };

        Ok(MmapFile { mmap })
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// `len` bytes at `offset`, or a corruption error when that runs past the end.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let start = usize::try_from(offset).map_err(|_| out_of_bounds(offset, len))?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= self.mmap.len())
            .ok_or_else(|| out_of_bounds(offset, len))?;
        Ok(&self.mmap[start..end])
    }
}

fn out_of_bounds(offset: u64, len: u64) -> Error {
    Error::corruption(format!("range {}+{} lies outside the mapped file", offset, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn slices_are_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let file = MmapFile::open_read_only(&path).unwrap();
        assert_eq!(file.len(), 10);
        assert_eq!(file.slice(2, 3).unwrap(), b"234");
        assert_eq!(file.slice(10, 0).unwrap(), b"");
        assert_eq!(file.slice(8, 3).err().unwrap().kind, ErrorKind::Corruption);
        assert_eq!(file.slice(u64::MAX, 2).err().unwrap().kind, ErrorKind::Corruption);
    }
}
