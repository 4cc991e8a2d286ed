//! A block-checkpointing binary delta codec, in the bsdiff/bspatch family.
//!
//! [`generate`] produces a raw (uncompressed) patch describing how to turn
//! an *old* byte buffer into a *new* one; [`apply`] and [`apply_directory`]
//! reconstruct *new* from *old* and that patch. Unlike a plain bsdiff
//! patch, the stream generated here is periodically interrupted by flush
//! records that checkpoint the block just produced (see [`checkpoint`]),
//! so a directory-mode apply can resume from a prior partially-applied run.

pub mod checkpoint;
pub mod diff;
pub mod patch;
pub mod wire;

pub use diff::{generate, DiffError};
pub use patch::{apply, apply_directory, PatchError};
pub use wire::{DDELTA_MAGIC, FLUSH_SENTINEL};

/// Progress callback states threaded through [`generate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Reading the old/new buffers in.
    Reading,
    /// Sorting the suffix array for the current block.
    Sorting,
    /// Scanning `new`; the payload is the cumulative scan position.
    Working(u64),
}
