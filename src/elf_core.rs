//! Parses an ELF64 `ET_CORE` Xen dump (`xen-dumpcore`-style) into an
//! [`Index`].
//!
//! The ELF header and section-header table are read through [`ByteSource`]
//! in small, explicitly-bounded calls rather than by mapping the whole
//! file, so this parser composes with any `ByteSource` that only promises
//! bounded `read(offset, length)`.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{index::Index, source::ByteSource, Error, Pfn};

const XEN_ELFNOTE_DUMPCORE_HEADER: u32 = 0x2000001;
const ET_CORE: u16 = 4;
const ELF64_EHDR_SIZE: u64 = 64;
const ELF64_SHDR_SIZE: u64 = 64;

// Fixed section-header ordinals produced by xen-dumpcore.
const SHDR_NOTE: usize = 2;
const SHDR_PAGES: usize = 5;
const SHDR_P2M: usize = 6;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Elf64Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Elf64Nhdr {
    namesz: u32,
    descsz: u32,
    n_type: u32,
    _pad: u32,
}

/// Xen dumpcore ELF note header descriptor (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[allow(non_camel_case_types)]
struct xen_dumpcore_elfnote_header_desc {
    xch_magic: u64,
    xch_nr_cpu: u64,
    xch_nr_pages: u64,
    xch_page_size: u64,
}

/// Parses `source` as an ELF64 `ET_CORE` Xen dump and builds its [`Index`].
///
/// If the note walk can't locate `XEN_ELFNOTE_DUMPCORE_HEADER`, this
/// tolerates the failure and returns [`Index::degraded`] rather than
/// aborting construction (see the crate-level error-handling docs).
pub fn parse(source: &impl ByteSource) -> Result<Index, Error> {
    let ehdr_bytes = source.read(0, ELF64_EHDR_SIZE)?;
    let ehdr =
        Elf64Ehdr::read_from_bytes(&ehdr_bytes).map_err(|_| Error::MalformedHeader("ELF64 header"))?;

    if ehdr.e_type != ET_CORE {
        return Err(Error::NotACoreFile);
    }

    if (ehdr.e_shnum as usize) <= SHDR_P2M {
        return Err(Error::MalformedHeader("too few section headers"));
    }

    let shdr_table = source.read(ehdr.e_shoff, ehdr.e_shnum as u64 * ELF64_SHDR_SIZE)?;
    let note_shdr = shdr_at(&shdr_table, SHDR_NOTE)?;
    let pages_shdr = shdr_at(&shdr_table, SHDR_PAGES)?;
    let p2m_shdr = shdr_at(&shdr_table, SHDR_P2M)?;

    match note_walk(source, &note_shdr) {
        Ok(header) => build_index(source, &header, &pages_shdr, &p2m_shdr),
        Err(err) => {
            tracing::debug!(
                error = %err,
                "ELF core note walk failed; constructing degraded empty index"
            );
            Ok(Index::degraded())
        }
    }
}

fn shdr_at(table: &[u8], index: usize) -> Result<Elf64Shdr, Error> {
    let start = index * ELF64_SHDR_SIZE as usize;
    let end = start + ELF64_SHDR_SIZE as usize;
    let bytes = table
        .get(start..end)
        .ok_or(Error::MalformedHeader("section header table"))?;

    Elf64Shdr::read_from_bytes(bytes).map_err(|_| Error::MalformedHeader("section header"))
}

/// Reads the `XEN_ELFNOTE_DUMPCORE_HEADER` note starting at
/// `note_shdr.sh_offset + 16`.
///
/// The `+ 16` (`XEN_ELFNOTE_DESC_SIZE`) skip matches a preceding note's
/// descriptor padding as assumed by the reference parser; it is kept
/// literally rather than "fixed", since no real `xen-dumpcore` fixture was
/// available to verify an alternative reading.
fn note_walk(
    source: &impl ByteSource,
    note_shdr: &Elf64Shdr,
) -> Result<xen_dumpcore_elfnote_header_desc, Error> {
    let nhdr_offset = note_shdr.sh_offset + 16;
    let nhdr_bytes = source.read(nhdr_offset, 16)?;
    let nhdr =
        Elf64Nhdr::read_from_bytes(&nhdr_bytes).map_err(|_| Error::MalformedHeader("ELF note header"))?;

    if nhdr.n_type != XEN_ELFNOTE_DUMPCORE_HEADER {
        return Err(Error::MalformedHeader(
            "note is not XEN_ELFNOTE_DUMPCORE_HEADER",
        ));
    }

    let desc_bytes = source.read(nhdr_offset + 16, 32)?;
    xen_dumpcore_elfnote_header_desc::read_from_bytes(&desc_bytes)
        .map_err(|_| Error::MalformedHeader("Xen dumpcore header descriptor"))
}

fn build_index(
    source: &impl ByteSource,
    header: &xen_dumpcore_elfnote_header_desc,
    pages_shdr: &Elf64Shdr,
    p2m_shdr: &Elf64Shdr,
) -> Result<Index, Error> {
    let page_size = header.xch_page_size;
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(Error::MalformedHeader("page size is not a power of two"));
    }
    let page_shift = page_size.trailing_zeros();

    let mut index = Index::new(page_size, page_shift);
    index.set_max_pfn(Pfn(header.xch_nr_pages));

    tracing::debug!(
        page_size,
        nr_pages = header.xch_nr_pages,
        "parsed Xen dumpcore header"
    );

    let p2m_bytes = source.read(p2m_shdr.sh_offset, p2m_shdr.sh_size)?;
    let mut page_cursor = pages_shdr.sh_offset;

    // The header's declared `xch_nr_pages` is the baseline `max_pfn`, but a
    // P2M entry naming a PFN beyond it is still indexed and still must be
    // reachable through `is_valid`/`read` — so a present PFN beyond the
    // header's declared count also raises `max_pfn`.
    for chunk in p2m_bytes.chunks_exact(8) {
        let pfn = u64::from_le_bytes(chunk.try_into().expect("chunk is exactly 8 bytes"));
        index.insert(Pfn(pfn), page_cursor);
        index.set_max_pfn(Pfn(pfn));
        page_cursor += page_size;
    }

    tracing::debug!(present_pages = index.len(), "built ELF core P2M index");

    Ok(index)
}
