use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// A file mapped read-write, growable in place.
///
/// Backs the value store: the store opens the file once, reads and writes
/// through the mapping, and remaps when it needs more room.
pub struct MmapFileMut {
    /// File handle kept alive to maintain the memory map validity
    file: File,
    /// Memory-mapped region providing mutable access to file contents
    mmap: MmapMut,
    len: u64,
}

impl MmapFileMut {
    /// Open `path`, creating it if absent, and map it read-write. An
    /// existing file keeps its contents; a new or shorter file is extended
    /// to at least `min_len` bytes.
    pub fn open_or_create<P: AsRef<Path>>(path: P, min_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let mut len = file.metadata()?.len();
        if len < min_len {
            file.set_len(min_len)?;
            len = min_len;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap, len })
    }

    /// Grow the file to `new_len` bytes and remap.
    ///
    /// All raw pointers previously obtained from the mapping are invalid
    /// after this call; callers re-derive them from `as_mut_ptr`.
    pub fn grow(&mut self, new_len: u64) -> io::Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        self.file.set_len(new_len)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.len = new_len;
        Ok(())
    }

    /// Schedule dirty pages for writeback without waiting for completion.
    pub fn flush_async(&self) -> io::Result<()> {
        self.mmap.flush_async()
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }
}
