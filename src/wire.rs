//! Bit-exact wire structures for the patch header and entry records.
//!
//! All multi-byte integers are big-endian on the wire. The `seek` field of
//! an entry is additionally sign-folded (see [`fold_seek`]/[`unfold_seek`])
//! so that a single reserved bit pattern can be carved out for
//! [`FLUSH_SENTINEL`] without colliding with any seek a correct generator
//! would otherwise emit.

use zerocopy::byteorder::BigEndian;
use zerocopy::{FromBytes, IntoBytes, Unaligned, U64};

/// Exact 8-byte tag at the start of every patch file.
pub const DDELTA_MAGIC: &[u8; 8] = b"DDELTA40";

/// Reserved `seek` value that marks a flush record instead of a normal one.
///
/// `i32::MIN` is the natural choice: it is the one signed value whose
/// two's-complement bit pattern is its own negation, so folding and
/// unfolding it round-trips exactly like every other value, while still
/// being a value a real match's `seek` arithmetic essentially never lands
/// on (it would require the old cursor to jump by the entire addressable
/// range in one record).
pub const FLUSH_SENTINEL: i32 = i32::MIN;

/// `fold_seek(FLUSH_SENTINEL)`, precomputed for entry construction/checks.
pub const FLUSH_SENTINEL_FOLDED: u32 = fold_seek(FLUSH_SENTINEL);

/// Fold a signed 32-bit seek into its wire (unsigned) bit pattern.
///
/// On non-negative input this is the identity; on negative input it
/// reproduces the two's-complement bit pattern via `!(-v) + 1`, using
/// wrapping arithmetic throughout so `i32::MIN` (whose naive negation
/// overflows) folds the same way every other value does.
pub const fn fold_seek(v: i32) -> u32 {
    if v >= 0 {
        v as u32
    } else {
        let neg = (-(v as i64)) as u32;
        (!neg).wrapping_add(1)
    }
}

/// Inverse of [`fold_seek`].
pub const fn unfold_seek(u: u32) -> i32 {
    if u & 0x8000_0000 != 0 {
        (!(u.wrapping_sub(1)) as i32).wrapping_neg()
    } else {
        u as i32
    }
}

/// The 16-byte header at offset 0 of every patch file.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Unaligned)]
pub struct PatchHeader {
    pub magic: [u8; 8],
    pub new_file_size: U64<BigEndian>,
}

impl PatchHeader {
    pub fn new(new_file_size: u64) -> Self {
        PatchHeader {
            magic: *DDELTA_MAGIC,
            new_file_size: U64::new(new_file_size),
        }
    }

    pub fn magic_ok(&self) -> bool {
        &self.magic == DDELTA_MAGIC
    }
}

/// A 24-byte entry record. The `diff`/`extra` slots are reinterpreted as
/// `oldcrc`/`newcrc` when [`EntryHeader::is_flush`] is true; widening each
/// field to a 64-bit wire integer (rather than the original format's
/// 32-bit fields) keeps every field naturally aligned with no padding
/// bytes, while the logical values stored still obey the 32-bit range
/// spec'd for `diff`/`extra`/`seek`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Unaligned)]
pub struct EntryHeader {
    diff: U64<BigEndian>,
    extra: U64<BigEndian>,
    seek: U64<BigEndian>,
}

impl EntryHeader {
    /// Build a normal record. `seek` must not fold to [`FLUSH_SENTINEL_FOLDED`];
    /// callers are expected to have checked this already (see `diff.rs`).
    pub fn normal(diff: u32, extra: u32, seek: i32) -> Self {
        EntryHeader {
            diff: U64::new(diff as u64),
            extra: U64::new(extra as u64),
            seek: U64::new(fold_seek(seek) as u64),
        }
    }

    pub fn flush(oldcrc: u32, newcrc: u32) -> Self {
        EntryHeader {
            diff: U64::new(oldcrc as u64),
            extra: U64::new(newcrc as u64),
            seek: U64::new(FLUSH_SENTINEL_FOLDED as u64),
        }
    }

    pub fn terminator() -> Self {
        Self::default()
    }

    fn seek_raw(&self) -> u32 {
        self.seek.get() as u32
    }

    pub fn seek_value(&self) -> i32 {
        unfold_seek(self.seek_raw())
    }

    pub fn is_flush(&self) -> bool {
        self.seek_raw() == FLUSH_SENTINEL_FOLDED
    }

    pub fn is_terminator(&self) -> bool {
        self.diff.get() == 0 && self.extra.get() == 0 && self.seek.get() == 0
    }

    pub fn diff_len(&self) -> u32 {
        self.diff.get() as u32
    }

    pub fn extra_len(&self) -> u32 {
        self.extra.get() as u32
    }

    pub fn oldcrc(&self) -> u32 {
        self.diff.get() as u32
    }

    pub fn newcrc(&self) -> u32 {
        self.extra.get() as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fold_roundtrips_everywhere() {
        let probes = [
            0,
            1,
            -1,
            i32::MAX,
            i32::MIN,
            i32::MIN + 1,
            i32::MAX - 1,
            1000,
            -1000,
            12345,
            -12345,
        ];
        for &v in &probes {
            assert_eq!(unfold_seek(fold_seek(v)), v, "failed to roundtrip {v}");
        }
    }

    #[test]
    fn fold_is_identity_on_nonnegative() {
        for v in [0, 1, 42, i32::MAX] {
            assert_eq!(fold_seek(v), v as u32);
        }
    }

    #[test]
    fn flush_sentinel_is_distinguishable() {
        assert_ne!(FLUSH_SENTINEL_FOLDED, fold_seek(0));
        assert_ne!(FLUSH_SENTINEL_FOLDED, fold_seek(1));
        assert_ne!(FLUSH_SENTINEL_FOLDED, fold_seek(-1));
    }

    #[test]
    fn terminator_and_flush_are_distinct_kinds() {
        let term = EntryHeader::terminator();
        assert!(term.is_terminator());
        assert!(!term.is_flush());

        let flush = EntryHeader::flush(7, 9);
        assert!(flush.is_flush());
        assert!(!flush.is_terminator());
        assert_eq!(flush.oldcrc(), 7);
        assert_eq!(flush.newcrc(), 9);
    }
}
