use std::collections::HashMap;

use crate::Pfn;

/// An immutable PFN → file-offset mapping, built once at open time.
///
/// Absence of a key within `[0, max_pfn]` denotes a hole: the guest page
/// was never persisted and reads as zero. A key is never removed once
/// inserted; later insertions for the same PFN (duplicate P2M/tag-stream
/// entries) overwrite earlier ones, matching the source's last-write-wins
/// behaviour.
#[derive(Debug, Default)]
pub struct Index {
    offsets: HashMap<Pfn, u64>,
    max_pfn: Pfn,
    page_size: u64,
    page_shift: u32,
    has_range: bool,
    has_max_pfn: bool,
}

impl Index {
    /// Creates an empty index with the given page geometry and no declared
    /// `max_pfn` yet.
    ///
    /// `page_size` must be a power of two; `page_shift` must satisfy
    /// `1 << page_shift == page_size`. `max_pfn` starts undeclared — see
    /// [`Index::has_max_pfn`] — until [`Index::set_max_pfn`] or
    /// [`Index::bump_max_pfn_excluding_reserved`] is called at least once.
    pub fn new(page_size: u64, page_shift: u32) -> Self {
        debug_assert_eq!(1u64 << page_shift, page_size);

        Self {
            offsets: HashMap::new(),
            max_pfn: Pfn(0),
            page_size,
            page_shift,
            has_range: true,
            has_max_pfn: false,
        }
    }

    /// Creates the degraded index used when the ELF-core note walk fails.
    ///
    /// No GPA is ever valid against a degraded index, regardless of what
    /// `max_pfn` would otherwise compare to — see [`Index::has_range`].
    pub fn degraded() -> Self {
        Self {
            offsets: HashMap::new(),
            max_pfn: Pfn(0),
            page_size: 0,
            page_shift: 0,
            has_range: false,
            has_max_pfn: false,
        }
    }

    /// False only for [`Index::degraded`]. [`crate::AddressSpace::is_valid_address`]
    /// treats every GPA as out of range when this is false, even GPA zero.
    pub fn has_range(&self) -> bool {
        self.has_range
    }

    /// True once a `max_pfn` has actually been declared — by the ELF-core
    /// header, or by at least one present PFN in a snapshot tag stream.
    ///
    /// A snapshot whose tag stream never names a single present PFN (e.g.
    /// control tags only) never calls [`Index::set_max_pfn`] or
    /// [`Index::bump_max_pfn_excluding_reserved`], so `max_pfn()` would
    /// read as the default `Pfn(0)` without this having actually been
    /// established by the dump. [`crate::AddressSpace::is_valid_address`]
    /// treats every GPA as out of range while this is false, so a
    /// zero-content snapshot doesn't spuriously validate GPA zero.
    pub fn has_max_pfn(&self) -> bool {
        self.has_max_pfn
    }

    /// Records that `pfn` is backed by real page contents at `offset`.
    pub fn insert(&mut self, pfn: Pfn, offset: u64) {
        self.offsets.insert(pfn, offset);
    }

    /// Unconditionally raises `max_pfn` to `pfn` if it is larger, and marks
    /// `max_pfn` as declared.
    ///
    /// Used by the ELF-core parser, which takes `max_pfn` directly from the
    /// dump header rather than from the P2M table.
    pub fn set_max_pfn(&mut self, pfn: Pfn) {
        self.has_max_pfn = true;
        self.max_pfn = self.max_pfn.max(pfn);
    }

    /// Marks `max_pfn` as declared, then raises it to `pfn` unless `pfn`
    /// falls inside one of the reserved exclusion ranges carved out by the
    /// snapshot format (`[983040,984063] ∪ [1032192,1032206] ∪
    /// [1044475,1044479]`).
    ///
    /// The PFN is still recorded as present by a prior [`Index::insert`]
    /// call; only the `max_pfn` bookkeeping is affected. A PFN inside the
    /// exclusion range still marks `max_pfn` as declared — the snapshot did
    /// name a present page — it just doesn't raise the ceiling.
    pub fn bump_max_pfn_excluding_reserved(&mut self, pfn: Pfn) {
        const EXCLUDED: [(u64, u64); 3] = [
            (983_040, 984_063),
            (1_032_192, 1_032_206),
            (1_044_475, 1_044_479),
        ];

        self.has_max_pfn = true;

        if EXCLUDED.iter().any(|&(lo, hi)| pfn.0 >= lo && pfn.0 <= hi) {
            return;
        }

        self.max_pfn = self.max_pfn.max(pfn);
    }

    /// The file offset of the first byte of `pfn`, if it is present.
    pub fn translate_pfn(&self, pfn: Pfn) -> Option<u64> {
        self.offsets.get(&pfn).copied()
    }

    /// The largest PFN ever declared present during parsing.
    pub fn max_pfn(&self) -> Pfn {
        self.max_pfn
    }

    /// The page size in bytes, as declared by the container format.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// `log2(page_size)`.
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// The number of PFNs with a recorded file offset.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True if no PFN has a recorded file offset.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
