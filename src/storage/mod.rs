//! Storage Module
//!
//! Raw byte access to the database, whatever backs it.
//!
//! ## Responsibilities
//! - Own the file descriptor and its shared mapping
//! - Fall back to positioned I/O when mapping is disabled or fails
//! - Serve memory-only ("internal") databases from a heap buffer
//! - Notice when another process grew the file and remap
//!
//! The rest of the engine only sees offsets and byte slices; whether they
//! come from the mapping, `pread`/`pwrite`, or a `Vec` makes no difference.

mod mapping;

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::{Result, TdbError};

use mapping::Mapping;

/// Byte written into newly grown file space so the file is never sparse
const FILL_BYTE: u8 = 0x42;

/// Chunk size used when filling grown space
const FILL_CHUNK: usize = 1024;

/// Device and inode of an open database file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub device: u64,
    pub inode: u64,
}

impl FileId {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }
}

enum Backing {
    File {
        file: File,
        path: PathBuf,
        mapping: Option<Mapping>,
    },
    Internal {
        buf: Vec<u8>,
    },
}

/// The database's bytes: a mapped or plain file, or an in-process buffer
pub struct Storage {
    backing: Backing,
    /// Length of the region this handle currently knows about
    map_size: u32,
    read_only: bool,
    use_mmap: bool,
}

impl Storage {
    /// Wrap an open database file
    pub fn open_file(file: File, path: &Path, read_only: bool, use_mmap: bool) -> Result<Self> {
        let mut storage = Self {
            backing: Backing::File {
                file,
                path: path.to_path_buf(),
                mapping: None,
            },
            map_size: 0,
            read_only,
            use_mmap,
        };
        storage.map_size = storage.file_len()?;
        storage.remap();
        Ok(storage)
    }

    /// A memory-only database seeded with `initial` bytes
    pub fn internal(initial: Vec<u8>) -> Result<Self> {
        let map_size = u32::try_from(initial.len())
            .map_err(|_| TdbError::OutOfMemory(initial.len()))?;
        Ok(Self {
            backing: Backing::Internal { buf: initial },
            map_size,
            read_only: false,
            use_mmap: false,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Length of the region currently known to this handle
    pub fn len(&self) -> u32 {
        self.map_size
    }

    pub fn is_empty(&self) -> bool {
        self.map_size == 0
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.backing, Backing::Internal { .. })
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::File { mapping: Some(_), .. })
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.backing {
            Backing::File { file, .. } => Some(file.as_raw_fd()),
            Backing::Internal { .. } => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Internal { .. } => None,
        }
    }

    pub fn file_id(&self) -> Result<Option<FileId>> {
        match &self.backing {
            Backing::File { file, .. } => Ok(Some(FileId::of(&file.metadata()?))),
            Backing::Internal { .. } => Ok(None),
        }
    }

    // =========================================================================
    // Bounds
    // =========================================================================

    /// Make sure `len` bytes are addressable, remapping if another process
    /// has grown the file. With `probe` set, failures are not logged.
    pub fn ensure_capacity(&mut self, len: u64, probe: bool) -> Result<()> {
        if len <= self.map_size as u64 {
            return Ok(());
        }

        let file_len = match &self.backing {
            Backing::Internal { .. } => {
                if !probe {
                    error!(len, size = self.map_size, "access beyond internal buffer");
                }
                return Err(out_of_bounds(len, self.map_size as u64));
            }
            Backing::File { file, .. } => file.metadata()?.len(),
        };

        if file_len < len {
            if !probe {
                error!(len, eof = file_len, "access beyond end of file");
            }
            return Err(out_of_bounds(len, file_len));
        }

        self.map_size = u32::try_from(file_len)
            .map_err(|_| TdbError::BadFormat(format!("file too large: {} bytes", file_len)))?;
        self.remap();
        Ok(())
    }

    // =========================================================================
    // Reads & Writes
    // =========================================================================

    /// Fill `buf` from `offset`
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.ensure_capacity(offset as u64 + buf.len() as u64, false)?;
        let start = offset as usize;

        match &self.backing {
            Backing::Internal { buf: data } => {
                buf.copy_from_slice(&data[start..start + buf.len()]);
            }
            Backing::File {
                mapping: Some(map), ..
            } => {
                buf.copy_from_slice(&map.as_slice()[start..start + buf.len()]);
            }
            Backing::File { file, .. } => {
                let len = buf.len();
                file.read_exact_at(buf, offset as u64).map_err(|e| {
                    error!(offset, len, error = %e, "read failed");
                    TdbError::Io(e)
                })?;
            }
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` into a fresh buffer
    pub fn read_vec(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        // a corrupt length must fail here, not after committing the buffer
        self.ensure_capacity(offset as u64 + len as u64, false)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len as usize)
            .map_err(|_| TdbError::OutOfMemory(len as usize))?;
        buf.resize(len as usize, 0);
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(TdbError::ReadOnly);
        }
        self.ensure_capacity(offset as u64 + data.len() as u64, false)?;
        let start = offset as usize;

        match &mut self.backing {
            Backing::Internal { buf } => {
                buf[start..start + data.len()].copy_from_slice(data);
            }
            Backing::File {
                file,
                mapping: Some(map),
                ..
            } => match map.as_mut_slice() {
                Some(slice) => slice[start..start + data.len()].copy_from_slice(data),
                None => file.write_all_at(data, offset as u64)?,
            },
            Backing::File { file, .. } => {
                file.write_all_at(data, offset as u64).map_err(|e| {
                    error!(offset, len = data.len(), error = %e, "write failed");
                    TdbError::Io(e)
                })?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Growth & Reinitialization
    // =========================================================================

    /// Grow the region by `addition` bytes past the current known length
    pub fn expand(&mut self, addition: u32) -> Result<()> {
        let new_size = self
            .map_size
            .checked_add(addition)
            .ok_or_else(|| TdbError::OutOfMemory(addition as usize))?;

        let start = self.map_size as u64;
        let filled = match &mut self.backing {
            Backing::Internal { buf } => {
                buf.try_reserve_exact(addition as usize)
                    .map_err(|_| TdbError::OutOfMemory(addition as usize))?;
                buf.resize(new_size as usize, 0);
                Ok(())
            }
            Backing::File { file, mapping, .. } => {
                // unmap before growing; some systems keep writes and maps incoherent
                *mapping = None;
                fill_range(file, start, new_size as u64)
            }
        };

        if let Err(e) = filled {
            error!(size = new_size, error = %e, "expand failed");
            self.remap();
            return Err(TdbError::Io(e));
        }

        self.map_size = new_size;
        self.remap();
        Ok(())
    }

    /// Replace the whole contents with `bytes` (used to initialize a database)
    pub fn reset(&mut self, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(TdbError::ReadOnly);
        }
        let size = u32::try_from(bytes.len()).map_err(|_| TdbError::OutOfMemory(bytes.len()))?;
        match &mut self.backing {
            Backing::Internal { buf } => {
                buf.clear();
                buf.extend_from_slice(bytes);
            }
            Backing::File { file, mapping, .. } => {
                *mapping = None;
                file.set_len(0)?;
                file.write_all_at(bytes, 0)?;
            }
        }
        self.map_size = size;
        self.remap();
        Ok(())
    }

    /// Swap in a freshly opened descriptor for the same file
    pub fn replace_file(&mut self, new_file: File) -> Result<()> {
        if let Backing::File { file, mapping, .. } = &mut self.backing {
            *mapping = None;
            *file = new_file;
        }
        self.remap();
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn file_len(&self) -> Result<u32> {
        match &self.backing {
            Backing::File { file, .. } => {
                let len = file.metadata()?.len();
                u32::try_from(len)
                    .map_err(|_| TdbError::BadFormat(format!("file too large: {} bytes", len)))
            }
            Backing::Internal { buf } => Ok(buf.len() as u32),
        }
    }

    /// (Re)establish the mapping at the current size. Failure is not fatal:
    /// the handle falls back to positioned I/O.
    fn remap(&mut self) {
        let size = self.map_size as usize;
        let (use_mmap, read_only) = (self.use_mmap, self.read_only);
        if let Backing::File { file, mapping, .. } = &mut self.backing {
            *mapping = None;
            if !use_mmap || size == 0 {
                return;
            }
            match Mapping::map(file, size, read_only) {
                Ok(map) => {
                    debug_assert_eq!(map.len(), size);
                    *mapping = Some(map);
                }
                Err(e) => {
                    debug!(size, error = %e, "mmap failed, using file I/O");
                }
            }
        }
    }
}

/// Write the fill pattern over `[start, end)` with positioned writes
fn fill_range(file: &File, start: u64, end: u64) -> io::Result<()> {
    let fill = [FILL_BYTE; FILL_CHUNK];
    let mut pos = start;
    while pos < end {
        let n = ((end - pos) as usize).min(FILL_CHUNK);
        file.write_all_at(&fill[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

fn out_of_bounds(len: u64, limit: u64) -> TdbError {
    TdbError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access to {} beyond end at {}", len, limit),
    ))
}
