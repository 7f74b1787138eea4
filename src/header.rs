//! The fixed-layout prefix written before every user allocation, plus the
//! pool-wide constants that govern it.

use core::ptr::NonNull;

use crate::list::ListNode;
use crate::pool::PoolInstance;

/// Data-alignment constant: [`AllocHeader`]'s size must be (and, via
/// `#[repr(align(16))]` below, always is) a multiple of this, so the user
/// payload immediately following a header starts naturally aligned.
pub const POOL_DATA_ALIGN: usize = 16;

/// 16-bit sentinel stored in a live header's `magic` field. Bitwise
/// inverted on free to arm double-free detection (see
/// [`CorruptionKind::DoubleFree`](crate::error::CorruptionKind::DoubleFree)).
pub const POOL_DATA_MAGIC: u16 = 0xDEAD;

/// Single-byte fill value used for the dirty-init pattern and the
/// underflow guard byte.
pub const POOL_DATA_PATCH: u8 = 0xCC;

/// Reserved bitfield flags on [`AllocHeader::flags`]. Always zero for
/// pool-originated allocations; kept around because spec's allocation
/// header carries them and other pool kinds in the same family use them.
#[allow(dead_code)]
pub(crate) const FLAG_CSTR: u8 = 1 << 0;
#[allow(dead_code)]
pub(crate) const FLAG_FREE_MARKER: u8 = 1 << 1;

/// Caller-site capture for a `malloc`/`ralloc` call.
///
/// With the `diagnostics` feature disabled this is a zero-sized unit type,
/// so call sites still compile (and cost nothing) without it -- callers
/// always pass one, diagnostics decides whether it's kept.
#[cfg(feature = "diagnostics")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub func: &'static str,
    pub line: u32,
}

#[cfg(feature = "diagnostics")]
impl CallSite {
    pub const fn captured(file: &'static str, func: &'static str, line: u32) -> Self {
        Self { file, func, line }
    }
}

#[cfg(not(feature = "diagnostics"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite;

#[cfg(not(feature = "diagnostics"))]
impl CallSite {
    pub const fn captured(_file: &'static str, _func: &'static str, _line: u32) -> Self {
        Self
    }
}

/// How many lexical call sites [`CallChain`] keeps. A bounded lexical
/// chain of call sites rather than a true stack unwind, which would need
/// unsafe platform-specific frame-pointer walking this crate otherwise
/// has no reason to carry.
#[cfg(feature = "diagnostics")]
pub const CALL_CHAIN_DEPTH: usize = 4;

/// Bounded, most-recent-first ring of call sites leading to an
/// allocation. `malloc`/`ralloc` push their own site; a caller that
/// already has a chain (e.g. a wrapper allocator built on this pool) can
/// extend it via [`CallChain::push`] before passing it down.
#[cfg(feature = "diagnostics")]
#[derive(Debug, Clone, Copy)]
pub struct CallChain {
    frames: [Option<CallSite>; CALL_CHAIN_DEPTH],
}

#[cfg(feature = "diagnostics")]
impl CallChain {
    pub const EMPTY: CallChain = CallChain {
        frames: [None; CALL_CHAIN_DEPTH],
    };

    #[must_use]
    pub fn push(mut self, site: CallSite) -> Self {
        for i in (1..CALL_CHAIN_DEPTH).rev() {
            self.frames[i] = self.frames[i - 1];
        }
        self.frames[0] = Some(site);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallSite> {
        self.frames.iter().filter_map(|f| f.as_ref())
    }
}

#[cfg(feature = "diagnostics")]
impl Default for CallChain {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Fixed-layout prefix written immediately before every user allocation.
///
/// `node` is the intrusive list link and must stay the first field: the
/// list module casts `ListNode` pointers straight to `AllocHeader`
/// pointers at offset zero (see `list.rs`'s module docs).
#[repr(C, align(16))]
pub(crate) struct AllocHeader {
    pub(crate) node: ListNode,
    /// Back-reference to the owning pool, used only for the equality
    /// check in `free`/`ralloc` -- never dereferenced to reach back into
    /// the pool.
    pub(crate) pool: NonNull<PoolInstance>,
    pub(crate) size: u32,
    pub(crate) flags: u8,
    #[cfg(feature = "diagnostics")]
    pub(crate) magic: u16,
    #[cfg(feature = "diagnostics")]
    pub(crate) site: CallSite,
    #[cfg(feature = "diagnostics")]
    pub(crate) chain: CallChain,
}

impl AllocHeader {
    /// Byte offset from a header pointer to the user data pointer
    /// (i.e. `size_of::<AllocHeader>()`), named so call sites read as
    /// "the data starts `HEADER_SIZE` bytes past the header" rather than
    /// a bare `size_of` call.
    pub(crate) const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();

    #[cfg(feature = "diagnostics")]
    pub(crate) const FREED_MAGIC: u16 = !POOL_DATA_MAGIC;

    /// # Safety
    /// `header` must point at a live `AllocHeader`.
    pub(crate) unsafe fn data_ptr(header: NonNull<AllocHeader>) -> NonNull<u8> {
        unsafe { header.cast::<u8>().add(Self::HEADER_SIZE) }
    }

    /// # Safety
    /// `data` must be the user pointer returned for a header immediately
    /// preceding it (i.e. `data == Self::data_ptr(header)` for some live
    /// header).
    pub(crate) unsafe fn from_data_ptr(data: NonNull<u8>) -> NonNull<AllocHeader> {
        unsafe { data.cast::<u8>().sub(Self::HEADER_SIZE).cast::<AllocHeader>() }
    }
}

// `#[repr(align(16))]` already forces this to hold (Rust pads a type's
// size up to its alignment), so this is a tautology in Rust -- kept
// anyway so a future field addition that somehow broke it would fail to
// compile rather than silently misalign the user payload.
const _: () = assert!(
    core::mem::size_of::<AllocHeader>() % POOL_DATA_ALIGN == 0,
    "AllocHeader size must be a multiple of POOL_DATA_ALIGN"
);
const _: () = assert!(
    POOL_DATA_ALIGN == 16,
    "POOL_DATA_ALIGN must match the #[repr(align(16))] on AllocHeader"
);
