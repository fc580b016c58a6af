//! The byte-addressable file stream this crate reads from.
//!
//! `ByteSource` is the only capability this crate consumes from its host:
//! a bounded, random-access `read(offset, length)`. The host framework that
//! owns the real dump/snapshot file is out of scope here; this module only
//! declares the contract, plus one convenience adapter
//! ([`MmapByteSource`]) for callers who have nothing of their own.

use std::{fs::File, path::Path};

use memmap2::Mmap;

use crate::Error;

/// Random-access read of the underlying dump/snapshot file.
///
/// Implementations must return exactly `length` bytes or fail; they must
/// not return a short read.
pub trait ByteSource {
    /// Reads `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error>;
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        (**self).read(offset, length)
    }
}

/// A [`ByteSource`] backed by a memory-mapped file.
///
/// Maps the whole file once at construction and serves every subsequent
/// read as a bounds-checked copy out of that mapping, the way this family's
/// Xen core-dump driver maps its dump file once and serves all reads from
/// it.
pub struct MmapByteSource {
    mmap: Mmap,
}

impl MmapByteSource {
    /// Opens `path` and memory-maps it for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path)?;

        // SAFETY: we treat the mapping as read-only for the lifetime of
        // this object and never observe concurrent external mutation of
        // the backing file as a soundness issue here (same assumption the
        // core-dump driver in this family makes).
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self { mmap })
    }

    /// The length in bytes of the mapped file.
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// True if the mapped file is empty.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl ByteSource for MmapByteSource {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let start = usize::try_from(offset).map_err(|_| Error::MalformedHeader("offset"))?;
        let len = usize::try_from(length).map_err(|_| Error::MalformedHeader("length"))?;
        let end = start
            .checked_add(len)
            .ok_or(Error::MalformedHeader("offset + length overflow"))?;

        self.mmap
            .get(start..end)
            .map(Vec::from)
            .ok_or(Error::OutOfRange)
    }
}

/// A [`ByteSource`] backed by an in-memory buffer.
///
/// Used by this crate's own tests to build synthetic dump/snapshot
/// fixtures without touching the filesystem; also handy for callers
/// assembling a small buffer by hand.
pub struct SliceByteSource {
    data: Vec<u8>,
}

impl SliceByteSource {
    /// Wraps `data` as a [`ByteSource`].
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ByteSource for SliceByteSource {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let start = usize::try_from(offset).map_err(|_| Error::MalformedHeader("offset"))?;
        let len = usize::try_from(length).map_err(|_| Error::MalformedHeader("length"))?;
        let end = start
            .checked_add(len)
            .ok_or(Error::MalformedHeader("offset + length overflow"))?;

        self.data
            .get(start..end)
            .map(Vec::from)
            .ok_or(Error::OutOfRange)
    }
}
