//! Parses a libvirt-wrapped or `xl`-native Xen save/migrate stream into an
//! [`Index`].

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{index::Index, source::ByteSource, Error, Pfn, PfnDescriptor};

/// Page size is fixed for the snapshot container formats.
const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u32 = 12;

const LIBVIRT_HEADER_SIZE: u64 = 64;
const XL_HEADER_SIZE: u64 = 48;

/// Which wrapper precedes the `p2m_size`/tag-stream body.
///
/// Selected by [`crate::format::probe`] from the leading magic; the parser
/// itself never re-checks the magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    /// `libvirt-xml\n \0 \r` followed by an XML blob of `xml_len` bytes.
    Libvirt,
    /// `Xen saved domain, xl format\n \0 \r` followed by `opt_data_len`
    /// bytes of tool-specific options.
    Xl,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct LibvirtHeader {
    magic: [u8; 16],
    version: u32,
    xml_len: u32,
    unused: [u32; 10],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XlHeader {
    magic: [u8; 32],
    byte_order: u32,
    mandatory_flag: u32,
    opt_flag: u32,
    opt_data_len: u32,
}

/// `XC_SAVE_ID_*` negative tags this parser needs to distinguish.
///
/// Any other negative tag is a recognised-but-uninteresting control record
/// with no payload.
enum NegativeTag {
    /// Fixed payload of `len` bytes (`VCPU_INFO`, `HVM_IDENT_PT`,
    /// `HVM_VM86_TSS`, `HVM_CONSOLE_PFN`, `HVM_ACPI_IOPORTS_LOCATION`,
    /// `HVM_VIRIDIAN`, or `TSC_INFO`).
    Skip(u64),
    /// `TMEM`/`TMEM_EXTRA` — not supported by this crate.
    Unsupported(&'static str),
    /// A recognised-but-uninteresting control record with no payload.
    NoPayload,
}

/// Classifies a negative `count` word. Only called once `count < 0` has
/// already been established; `count == 0` (end of stream) and `count > 0`
/// (PFN batch) are handled by the caller.
fn classify_negative_tag(count: i32) -> NegativeTag {
    match count {
        -2 | -3 | -4 | -8 | -10 | -11 => NegativeTag::Skip(12),
        -7 => NegativeTag::Skip(20),
        -5 => NegativeTag::Unsupported("XC_SAVE_ID_TMEM"),
        -6 => NegativeTag::Unsupported("XC_SAVE_ID_TMEM_EXTRA"),
        _ => NegativeTag::NoPayload,
    }
}

/// Parses `source` as a libvirt- or xl-wrapped Xen save/migrate stream and
/// builds its [`Index`].
pub fn parse(source: &impl ByteSource, wrapper: Wrapper) -> Result<Index, Error> {
    let mut cursor = match wrapper {
        Wrapper::Libvirt => {
            let bytes = source.read(0, LIBVIRT_HEADER_SIZE)?;
            let header = LibvirtHeader::read_from_bytes(&bytes)
                .map_err(|_| Error::MalformedHeader("libvirt header"))?;
            LIBVIRT_HEADER_SIZE + header.xml_len as u64
        }
        Wrapper::Xl => {
            let bytes = source.read(0, XL_HEADER_SIZE)?;
            let header = XlHeader::read_from_bytes(&bytes)
                .map_err(|_| Error::MalformedHeader("xl header"))?;
            XL_HEADER_SIZE + header.opt_data_len as u64
        }
    };

    // p2m_size is read but only used as a hint by the original tool; PFN
    // presence and max_pfn both come from the tag stream itself.
    let p2m_size_bytes = source.read(cursor, 8)?;
    let p2m_size = u64::from_le_bytes(
        p2m_size_bytes
            .try_into()
            .map_err(|_| Error::MalformedHeader("p2m_size"))?,
    );
    cursor += 8;
    tracing::debug!(p2m_size, "read p2m_size");

    let mut index = Index::new(PAGE_SIZE, PAGE_SHIFT);

    loop {
        let count_bytes = source.read(cursor, 4)?;
        let count = i32::from_le_bytes(
            count_bytes
                .try_into()
                .map_err(|_| Error::MalformedHeader("record count"))?,
        );
        cursor += 4;

        if count == 0 {
            break;
        }

        if count < 0 {
            match classify_negative_tag(count) {
                NegativeTag::Skip(len) => {
                    tracing::trace!(tag = count, skip = len, "control tag");
                    cursor += len;
                }
                NegativeTag::NoPayload => {
                    tracing::trace!(tag = count, "control tag with no payload");
                }
                NegativeTag::Unsupported(name) => {
                    tracing::debug!(tag = count, %name, "unsupported snapshot feature");
                    return Err(Error::UnsupportedFeature(name));
                }
            }
            continue;
        }

        let count = count as u64;
        let descriptor_bytes = source.read(cursor, 4 * count)?;
        cursor += 4 * count;

        let data_start = cursor;
        let mut present_count = 0u64;

        for chunk in descriptor_bytes.chunks_exact(4) {
            let raw = u32::from_le_bytes(chunk.try_into().expect("chunk is exactly 4 bytes"));
            let descriptor = PfnDescriptor(raw);

            if descriptor.is_absent() {
                continue;
            }

            let pfn = descriptor.pfn();
            let offset = data_start + present_count * PAGE_SIZE;
            index.insert(pfn, offset);
            index.bump_max_pfn_excluding_reserved(pfn);
            present_count += 1;
        }

        tracing::trace!(batch_count = count, present_count, "PFN batch");
        cursor += present_count * PAGE_SIZE;
    }

    tracing::debug!(
        present_pages = index.len(),
        max_pfn = %index.max_pfn(),
        "built snapshot tag-stream index"
    );

    Ok(index)
}
