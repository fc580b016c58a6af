//! Sparse, page-granular physical address space over Xen core dumps and
//! save/migrate snapshots.
//!
//! This crate indexes two on-disk forms produced by the Xen hypervisor —
//! an ELF64 `ET_CORE` dump (`xen-dumpcore`-style) and a saved/migrated
//! guest image wrapped by either `libvirt` or the `xl` toolstack — into a
//! page-frame-number (PFN) → file-offset [`Index`], then serves
//! arbitrary-length reads against it with zero-fill for pages that were
//! never persisted.
//!
//! It does not own or read the underlying file itself: callers supply a
//! [`ByteSource`], a bounded random-access `read(offset, length)`
//! capability. [`source::MmapByteSource`] is provided as a ready-made
//! implementation for callers with a plain file and no framework of their
//! own.

mod elf_core;
mod error;
mod format;
mod index;
mod pfn;
mod snapshot;
mod source;

pub use crate::{
    error::Error,
    format::Format,
    index::Index,
    pfn::{Pfn, PfnDescriptor, BROKEN, LTAB_MASK, XALLOC, XTAB},
    snapshot::Wrapper as SnapshotWrapper,
    source::{ByteSource, MmapByteSource},
};

#[cfg(any(test, feature = "test-support"))]
pub use crate::source::SliceByteSource;

/// A read-only physical address space backed by a Xen core dump or
/// snapshot.
///
/// Constructed once via [`AddressSpace::open`]; all parsing happens inside
/// the constructor, and everything afterwards — [`AddressSpace::read`],
/// [`AddressSpace::is_valid_address`], [`AddressSpace::get_address`] — is a
/// read-only query against the [`Index`] built at open time.
pub struct AddressSpace<'a, B: ByteSource> {
    source: &'a B,
    index: Index,
    format: Format,
}

impl<'a, B: ByteSource> AddressSpace<'a, B> {
    /// Probes `source`'s container format and builds its [`Index`].
    ///
    /// All parsing failures abort construction with an error, except a
    /// broken ELF-core note walk: that case is tolerated by constructing
    /// with [`Index::degraded`], so that every subsequent read reports
    /// [`Error::OutOfRange`] instead of the open itself failing. See the
    /// crate's error-handling notes on why this one case is special-cased.
    pub fn open(source: &'a B) -> Result<Self, Error> {
        let format = format::probe(source)?;

        let index = match format {
            Format::ElfCore => elf_core::parse(source)?,
            Format::LibvirtSnapshot => snapshot::parse(source, SnapshotWrapper::Libvirt)?,
            Format::XlSnapshot => snapshot::parse(source, SnapshotWrapper::Xl)?,
        };

        tracing::debug!(
            ?format,
            present_pages = index.len(),
            max_pfn = %index.max_pfn(),
            "opened Xen address space"
        );

        Ok(Self {
            source,
            index,
            format,
        })
    }

    /// As [`AddressSpace::open`], but fails with [`Error::NoByteSource`]
    /// if `source` is `None`.
    ///
    /// Kept for parity with the reference implementation's null-source
    /// check; `open` itself can't observe a null `&B`, so this is the only
    /// path that can produce `NoByteSource`.
    pub fn open_optional(source: Option<&'a B>) -> Result<Self, Error> {
        Self::open(source.ok_or(Error::NoByteSource)?)
    }

    /// True iff `gpa`'s page frame is within the declared `max_pfn`.
    ///
    /// Absence of a concrete page mapping is not itself invalidity — it's
    /// a hole, and reads through it return zero bytes. A container that
    /// never actually declares a `max_pfn` (a snapshot whose tag stream
    /// names no present PFN at all) has no valid GPA, not even zero —
    /// see [`Index::has_max_pfn`].
    pub fn is_valid_address(&self, gpa: u64) -> bool {
        self.index.has_range()
            && self.index.has_max_pfn()
            && self.pfn_of(gpa) <= self.index.max_pfn()
    }

    /// The absolute file offset backing `gpa`'s byte, if that page was
    /// persisted.
    pub fn get_address(&self, gpa: u64) -> Option<u64> {
        if !self.index.has_range() {
            return None;
        }

        let page_off = gpa & (self.index.page_size() - 1);
        self.index
            .translate_pfn(self.pfn_of(gpa))
            .map(|offset| offset + page_off)
    }

    /// Reads `len` bytes starting at `gpa`, zero-filling any page within
    /// range that was never persisted.
    ///
    /// Fails with [`Error::OutOfRange`] if `gpa`'s page frame exceeds
    /// `max_pfn`; a hole inside the valid range is not an error. A
    /// zero-length read always succeeds with an empty result, regardless
    /// of whether `gpa` itself is in range.
    pub fn read(&self, gpa: u64, len: u64) -> Result<Vec<u8>, Error> {
        if len == 0 {
            return Ok(Vec::new());
        }

        if !self.is_valid_address(gpa) {
            return Err(Error::OutOfRange);
        }

        let page_size = self.index.page_size();
        let page_off = gpa & (page_size - 1);
        let first = (page_size - page_off).min(len);

        let mut out = Vec::with_capacity(len as usize);
        out.extend(self.read_segment(gpa, first)?);

        let remaining = len - first;
        let full_pages = remaining / page_size;
        let tail = remaining % page_size;

        let mut addr = gpa + first;
        for _ in 0..full_pages {
            out.extend(self.read_segment(addr, page_size)?);
            addr += page_size;
        }
        if tail > 0 {
            out.extend(self.read_segment(addr, tail)?);
        }

        Ok(out)
    }

    /// Alias of [`AddressSpace::read`], kept for parity with the reference
    /// implementation's `zread`/`read` split; the two are identical here.
    pub fn zread(&self, gpa: u64, len: u64) -> Result<Vec<u8>, Error> {
        self.read(gpa, len)
    }

    /// The contiguous physical-memory runs this address space advertises.
    ///
    /// ELF-core and libvirt-snapshot forms advertise a single run covering
    /// `[0, (max_pfn + 1) << page_shift)`. The xl-snapshot form advertises
    /// none.
    pub fn runs(&self) -> Vec<(u64, u64, u64)> {
        match self.format {
            Format::XlSnapshot => Vec::new(),
            Format::ElfCore | Format::LibvirtSnapshot => {
                let length = (self.index.max_pfn().0 + 1) << self.index.page_shift();
                vec![(0, 0, length)]
            }
        }
    }

    fn pfn_of(&self, gpa: u64) -> Pfn {
        Pfn::from_gpa(gpa, self.index.page_shift())
    }

    fn read_segment(&self, gpa: u64, len: u64) -> Result<Vec<u8>, Error> {
        if len == 0 {
            return Ok(Vec::new());
        }

        match self.get_address(gpa) {
            Some(offset) => self.source.read(offset, len),
            None => Ok(vec![0u8; len as usize]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XEN_ELFNOTE_DUMPCORE_HEADER: u32 = 0x2000001;
    const ELF64_SHDR_SIZE: u64 = 64;
    const ET_CORE: u16 = 4;

    fn write_shdr(shdrs: &mut [u8], index: usize, offset: u64, size: u64) {
        let start = index * ELF64_SHDR_SIZE as usize;
        shdrs[start + 24..start + 32].copy_from_slice(&offset.to_le_bytes());
        shdrs[start + 32..start + 40].copy_from_slice(&size.to_le_bytes());
    }

    /// Builds a minimal ELF64 `ET_CORE` Xen dump, section headers laid out
    /// exactly as `xen-dumpcore` emits them: ordinal 2 is `.note.Xen`,
    /// ordinal 5 is `.xen_pages`, ordinal 6 is `.xen_pfn`.
    fn elf_core_dump(pfns: &[u64], pages: &[&[u8]]) -> Vec<u8> {
        let page_size = 4096u64;
        let nr_pages = pfns.len() as u64;

        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[4] = 2;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&ET_CORE.to_le_bytes());

        let shnum = 7u16;
        let shoff = buf.len() as u64;
        buf[40..48].copy_from_slice(&shoff.to_le_bytes());
        buf[58..60].copy_from_slice(&(ELF64_SHDR_SIZE as u16).to_le_bytes());
        buf[60..62].copy_from_slice(&shnum.to_le_bytes());

        let mut shdrs = vec![0u8; ELF64_SHDR_SIZE as usize * shnum as usize];

        let note_payload_offset = shoff + shdrs.len() as u64;
        let pad = vec![0u8; 16];
        let mut nhdr = vec![0u8; 16];
        nhdr[8..12].copy_from_slice(&XEN_ELFNOTE_DUMPCORE_HEADER.to_le_bytes());
        let mut desc = vec![0u8; 32];
        desc[16..24].copy_from_slice(&nr_pages.to_le_bytes());
        desc[24..32].copy_from_slice(&page_size.to_le_bytes());

        let mut note_section = pad;
        note_section.extend_from_slice(&nhdr);
        note_section.extend_from_slice(&desc);
        write_shdr(&mut shdrs, 2, note_payload_offset, note_section.len() as u64);

        let pages_offset = note_payload_offset + note_section.len() as u64;
        let pages_size = page_size * nr_pages;
        write_shdr(&mut shdrs, 5, pages_offset, pages_size);

        let pfn_offset = pages_offset + pages_size;
        write_shdr(&mut shdrs, 6, pfn_offset, 8 * nr_pages);

        let mut pfn_section = Vec::new();
        for &pfn in pfns {
            pfn_section.extend_from_slice(&pfn.to_le_bytes());
        }

        let mut pages_section = Vec::new();
        for page in pages {
            assert_eq!(page.len(), page_size as usize);
            pages_section.extend_from_slice(page);
        }

        buf.extend_from_slice(&shdrs);
        buf.extend_from_slice(&note_section);
        buf.extend_from_slice(&pages_section);
        buf.extend_from_slice(&pfn_section);
        buf
    }

    /// S1: ELF core, single present page.
    #[test]
    fn elf_core_single_page_reads_back_identically() {
        let page = vec![0x5Au8; 4096];
        let dump = elf_core_dump(&[5], &[&page]);
        let source = SliceByteSource::new(dump);
        let address_space = AddressSpace::open(&source).unwrap();

        assert!(address_space.is_valid_address(0x5000));
        assert_eq!(address_space.read(0x5000, 4096).unwrap(), vec![0x5Au8; 4096]);
        assert_eq!(address_space.read(0x4000, 4096).unwrap(), vec![0u8; 4096]);
        assert!(matches!(
            address_space.read(0x6000, 1),
            Err(Error::OutOfRange)
        ));
    }

    /// S2: ELF core, a single read straddling a present page and a hole.
    #[test]
    fn elf_core_hole_straddle_zero_fills_absent_side() {
        let a = vec![0xAAu8; 4096];
        let b = vec![0xBBu8; 4096];
        let dump = elf_core_dump(&[0, 2], &[&a, &b]);
        let source = SliceByteSource::new(dump);
        let address_space = AddressSpace::open(&source).unwrap();

        assert_eq!(
            address_space.read(0x0FFE, 4).unwrap(),
            vec![0xAA, 0xAA, 0x00, 0x00]
        );
        assert_eq!(
            address_space.read(0x1FFE, 4).unwrap(),
            vec![0x00, 0x00, 0xBB, 0xBB]
        );
    }

    /// ELF core whose note walk fails falls through to a degraded, empty
    /// address space rather than aborting construction.
    #[test]
    fn elf_core_broken_note_walk_degrades_instead_of_failing() {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[4] = 2;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&ET_CORE.to_le_bytes());

        let shnum = 7u16;
        let shoff = buf.len() as u64;
        buf[40..48].copy_from_slice(&shoff.to_le_bytes());
        buf[58..60].copy_from_slice(&(ELF64_SHDR_SIZE as u16).to_le_bytes());
        buf[60..62].copy_from_slice(&shnum.to_le_bytes());

        let shdrs = vec![0u8; ELF64_SHDR_SIZE as usize * shnum as usize];
        buf.extend_from_slice(&shdrs);
        buf.extend_from_slice(&[0u8; 64]); // note section: all zero, no real note header.

        let source = SliceByteSource::new(buf);
        let address_space = AddressSpace::open(&source).unwrap();

        assert!(!address_space.is_valid_address(0));
        assert!(matches!(
            address_space.read(0, 1),
            Err(Error::OutOfRange)
        ));
    }

    fn libvirt_header(xml: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 64];
        header[0..16].copy_from_slice(b"libvirt-xml\n \0 \r");
        header[20..24].copy_from_slice(&(xml.len() as u32).to_le_bytes());
        let mut buf = header;
        buf.extend_from_slice(xml);
        buf
    }

    /// S3: libvirt snapshot, a batch with a filtered XTAB descriptor in the
    /// middle.
    #[test]
    fn libvirt_snapshot_batch_with_xtab_middle() {
        let mut buf = libvirt_header(b"<x/>\n\0\0\0");
        buf.extend_from_slice(&3u64.to_le_bytes()); // p2m_size
        buf.extend_from_slice(&3i32.to_le_bytes()); // count
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(0xF000_0002u32).to_le_bytes()); // XTAB
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&[0x11u8; 4096]);
        buf.extend_from_slice(&[0x44u8; 4096]);
        buf.extend_from_slice(&0i32.to_le_bytes());

        let source = SliceByteSource::new(buf);
        let address_space = AddressSpace::open(&source).unwrap();

        assert_eq!(address_space.read(0x4004, 2).unwrap(), vec![0x44, 0x44]);
        assert_eq!(address_space.runs(), vec![(0, 0, 5 << 12)]);
    }

    fn xl_header() -> Vec<u8> {
        let mut header = vec![0u8; 48];
        header[0..32].copy_from_slice(b"Xen saved domain, xl format\n \0 \r");
        header
    }

    /// S4: xl snapshot made only of control tags; empty index, `max_pfn ==
    /// 0`, and a zero-length in-range read still returns empty bytes.
    #[test]
    fn xl_snapshot_control_tags_only() {
        let mut buf = xl_header();
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&(-2i32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(&(-7i32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(&0i32.to_le_bytes());

        let source = SliceByteSource::new(buf);
        let address_space = AddressSpace::open(&source).unwrap();

        assert!(address_space.read(0, 0).unwrap().is_empty());
        assert!(matches!(
            address_space.read(0, 1),
            Err(Error::OutOfRange)
        ));
        assert!(address_space.runs().is_empty());
    }

    /// S5: a TMEM tag in a snapshot is a hard parse failure, not an
    /// in-range hole.
    #[test]
    fn xl_snapshot_tmem_tag_fails_open() {
        let mut buf = xl_header();
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&(-5i32).to_le_bytes());

        let source = SliceByteSource::new(buf);
        assert!(matches!(
            AddressSpace::open(&source),
            Err(Error::UnsupportedFeature(_))
        ));
    }

    /// S6: a byte source with none of the three recognised magics.
    #[test]
    fn unrecognised_format_fails_open() {
        let mut buf = b"hello".to_vec();
        buf.resize(32, 0);
        let source = SliceByteSource::new(buf);
        assert!(matches!(
            AddressSpace::open(&source),
            Err(Error::UnrecognisedFormat)
        ));
    }

    /// Boundary invariant: the last byte of `max_pfn` is valid, the first
    /// byte past it is not.
    #[test]
    fn boundary_is_valid_at_max_pfn_only() {
        let page = vec![0x7u8; 4096];
        let dump = elf_core_dump(&[3], &[&page]);
        let source = SliceByteSource::new(dump);
        let address_space = AddressSpace::open(&source).unwrap();

        assert!(address_space.is_valid_address((3 << 12) + 4095));
        assert!(!address_space.is_valid_address(4 << 12));
    }

    /// `zread` is a plain alias of `read`.
    #[test]
    fn zread_matches_read() {
        let page = vec![0x9u8; 4096];
        let dump = elf_core_dump(&[1], &[&page]);
        let source = SliceByteSource::new(dump);
        let address_space = AddressSpace::open(&source).unwrap();

        assert_eq!(
            address_space.zread(0x1000, 16).unwrap(),
            address_space.read(0x1000, 16).unwrap()
        );
    }

    /// `get_address` returns the translated file offset, with page offset
    /// applied, only for present pages.
    #[test]
    fn get_address_returns_offset_only_for_present_pages() {
        let page = vec![0u8; 4096];
        let dump = elf_core_dump(&[2], &[&page]);
        let source = SliceByteSource::new(dump);
        let address_space = AddressSpace::open(&source).unwrap();

        assert!(address_space.get_address(0x2010).is_some());
        assert_eq!(address_space.get_address(0x1010), None);
    }

    #[test]
    fn open_optional_rejects_none() {
        assert!(matches!(
            AddressSpace::<SliceByteSource>::open_optional(None),
            Err(Error::NoByteSource)
        ));
    }
}
