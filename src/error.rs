/// Error type for the Xen dump/snapshot address space.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The constructor was given no byte source to read from.
    #[error("no byte source")]
    NoByteSource,

    /// The byte source does not start with a magic this crate recognises.
    #[error("unrecognised container format")]
    UnrecognisedFormat,

    /// The byte source is an ELF file, but not one this crate can index.
    #[error("unsupported ELF variant")]
    UnsupportedFormat,

    /// The byte source is ELF64, but `e_type` is not `ET_CORE`.
    #[error("not an ELF core file")]
    NotACoreFile,

    /// A required structural read failed: short file, bad section ordinals,
    /// or a descriptor that doesn't decode to the expected size.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// A `TMEM`/`TMEM_EXTRA` record was encountered in a snapshot tag stream.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    /// The requested GPA is beyond the address space's declared `max_pfn`.
    #[error("address out of range")]
    OutOfRange,

    /// An I/O error was propagated from the byte source.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
