//! Recognises which of the three supported container formats a byte
//! source holds.

use crate::{source::ByteSource, Error};

const ELF_IDENT_PREFIX: [u8; 6] = [0x7F, b'E', b'L', b'F', 2, 1];
const LIBVIRT_MAGIC: [u8; 16] = *b"libvirt-xml\n \0 \r";
const XL_MAGIC: [u8; 32] = *b"Xen saved domain, xl format\n \0 \r";

/// The container format a byte source was identified as holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// An ELF64 `ET_CORE` dump produced by `xen-dumpcore`.
    ElfCore,
    /// A libvirt-wrapped Xen save/migrate stream.
    LibvirtSnapshot,
    /// An `xl`-tool native save/migrate stream.
    XlSnapshot,
}

/// Probes the first 32 bytes of `source` and selects a [`Format`].
///
/// Returns `Error::UnrecognisedFormat` if none of the three supported
/// magics match, and `Error::UnsupportedFormat` if the bytes look like an
/// ELF ident but not the specific class/endianness this crate supports.
pub fn probe(source: &impl ByteSource) -> Result<Format, Error> {
    let head = source.read(0, 32)?;

    if head.starts_with(&[0x7F, b'E', b'L', b'F']) {
        if head.starts_with(&ELF_IDENT_PREFIX) {
            tracing::debug!("probed format: ELF64 core dump");
            return Ok(Format::ElfCore);
        }

        tracing::debug!(ident = ?&head[..6.min(head.len())], "unsupported ELF variant");
        return Err(Error::UnsupportedFormat);
    }

    if head.len() >= 16 && head[..16] == LIBVIRT_MAGIC {
        tracing::debug!("probed format: libvirt-wrapped snapshot");
        return Ok(Format::LibvirtSnapshot);
    }

    if head.len() >= 32 && head[..32] == XL_MAGIC {
        tracing::debug!("probed format: xl-native snapshot");
        return Ok(Format::XlSnapshot);
    }

    tracing::debug!("unrecognised container format");
    Err(Error::UnrecognisedFormat)
}
