//! Shared file mapping
//!
//! Read-only handles map the file read-only so that a stray write faults
//! instead of corrupting another process's view.

use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapMut, MmapOptions};

/// A `MAP_SHARED` view of the first `len` bytes of the database file
pub(crate) enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    /// Map `len` bytes of `file`
    pub(crate) fn map(file: &File, len: usize, read_only: bool) -> io::Result<Self> {
        let mut options = MmapOptions::new();
        options.len(len);
        // SAFETY: the file is shared with other processes by design; every
        // access goes through bounds-checked slices of this mapping and the
        // byte-range lock protocol serializes writers.
        if read_only {
            let map = unsafe { options.map(file)? };
            Ok(Mapping::ReadOnly(map))
        } else {
            let map = unsafe { options.map_mut(file)? };
            Ok(Mapping::ReadWrite(map))
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(map) => map,
            Mapping::ReadWrite(map) => map,
        }
    }

    /// Writable view, `None` for read-only mappings
    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Mapping::ReadOnly(_) => None,
            Mapping::ReadWrite(map) => Some(map),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }
}
