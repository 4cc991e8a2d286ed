use std::cmp::Ordering;
use std::io::Write;

use byteorder::WriteBytesExt;
#[cfg(not(feature = "c"))]
use divsufsort as cdivsufsort;
use thiserror::Error;
use zerocopy::IntoBytes;

use crate::wire::{EntryHeader, PatchHeader, FLUSH_SENTINEL};
use crate::State;

type Str = Box<str>;
type Result<T> = std::result::Result<T, DiffError>;

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("io error while generating patch {0}")]
    Io(#[from] std::io::Error),
    #[error("patch generation failed: {0}")]
    Internal(Str),
}

const FUZZ: isize = 8;
/// Stall-guard trip count, empirically chosen by the original bsdiff-style
/// matcher. Preserve it exactly: changing it changes which patches a given
/// (old, new) pair produces.
const STALL_LIMIT: u32 = 100;

fn write_header(patch: &mut impl Write, len: u64) -> Result<()> {
    patch
        .write_all(PatchHeader::new(len).as_bytes())
        .map_err(Into::into)
}

fn write_entry(patch: &mut impl Write, entry: &EntryHeader) -> Result<()> {
    patch.write_all(entry.as_bytes()).map_err(Into::into)
}

fn write_terminator(patch: &mut impl Write) -> Result<()> {
    write_entry(patch, &EntryHeader::terminator())
}

fn to_u32(v: isize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| DiffError::Internal(format!("{what} out of range: {v}").into()))
}

fn to_i32(v: isize, what: &str) -> Result<i32> {
    i32::try_from(v).map_err(|_| DiffError::Internal(format!("{what} out of range: {v}").into()))
}

/// Generate a ddelta patch for `old` -> `new`, checkpointing every
/// `blocksize` bytes of `new` with a flush record (`blocksize == 0` means
/// one block spanning the whole file). `progress` is called periodically
/// with progress updates.
///
/// Both inputs must be fully resident in memory and no larger than
/// `i32::MAX` bytes; this function does not support streaming generation.
pub fn generate(
    old: &[u8],
    new: &[u8],
    patch: &mut impl Write,
    blocksize: u32,
    mut progress: impl FnMut(State),
) -> Result<()> {
    if old.len().max(new.len()) >= i32::MAX as usize {
        return Err(DiffError::Internal(
            format!("The filesize must not be larger than {} bytes", i32::MAX).into(),
        ));
    }
    progress(State::Sorting);
    write_header(patch, new.len() as u64)?;

    let newsize = new.len();
    let blocksize = if blocksize == 0 {
        newsize.max(1)
    } else {
        blocksize as usize
    };

    // The old buffer grows to cover `new` so that later blocks can match
    // against the bytes already emitted by earlier ones (see the block
    // boundary trick below).
    let mut old_buf = old.to_vec();
    old_buf.resize(old.len().max(newsize), 0);
    let mut oldsize = old.len();

    let mut scansize = blocksize.min(newsize);

    let mut scan: isize = 0;
    let mut len: isize = 0;
    let mut pos: isize = 0;
    let mut lastoffset: isize = 0;
    let mut lastscan: isize = 0;
    let mut lastpos: isize = 0;

    loop {
        len = 0;
        let mut sorted = cdivsufsort::sort(&old_buf[..oldsize]).into_parts().1;
        sorted.push(0);

        let mut oldcrc = crc32fast::Hasher::new();
        let mut newcrc = crc32fast::Hasher::new();

        while scan < scansize as isize {
            let mut num_less_than_eight: u32 = 0;
            let mut oldscore: isize = 0;
            scan += len;
            let mut scsc = scan;

            // If we come across a large block of data that only differs by
            // less than 8 bytes, this loop takes a long time to get past
            // it. Track the number of times we're stuck and break out.
            while scan < scansize as isize {
                if scan % 10_000 == 0 {
                    progress(State::Working(scan as u64));
                }
                let prev_len = len;
                let prev_oldscore = oldscore;
                let prev_pos = pos;

                len = search(
                    &sorted,
                    &old_buf[..oldsize],
                    &new[scan as usize..scansize],
                    0,
                    oldsize,
                    &mut pos,
                );

                while scsc < scan + len {
                    if (scsc + lastoffset < oldsize as isize)
                        && (old_buf[(scsc + lastoffset) as usize] == new[scsc as usize])
                    {
                        oldscore += 1;
                    }
                    scsc += 1;
                }

                if ((len == oldscore) && (len != 0)) || (len > oldscore + FUZZ) {
                    break;
                }

                if (scan + lastoffset < oldsize as isize)
                    && (old_buf[(scan + lastoffset) as usize] == new[scan as usize])
                {
                    oldscore -= 1;
                }

                if prev_len - FUZZ <= len
                    && len <= prev_len
                    && prev_oldscore - FUZZ <= oldscore
                    && oldscore <= prev_oldscore
                    && prev_pos <= pos
                    && pos <= prev_pos + FUZZ
                    && oldscore <= len
                    && len <= oldscore + FUZZ
                {
                    num_less_than_eight += 1;
                } else {
                    num_less_than_eight = 0;
                }

                if num_less_than_eight > STALL_LIMIT {
                    log::warn!("stall guard tripped at scan position {scan}, forcing a commit");
                    break;
                }

                scan += 1;
            }

            if (len != oldscore) || (scan == scansize as isize) {
                let (lenf, lenb) =
                    extend_match(&old_buf, oldsize, new, lastscan, lastpos, scan, pos, scansize)?;

                let diff = to_u32(lenf, "diff")?;
                let extra = to_u32((scan - lenb) - (lastscan + lenf), "extra")?;
                let seek = to_i32((pos - lenb) - (lastpos + lenf), "seek")?;
                if seek == FLUSH_SENTINEL {
                    return Err(DiffError::Internal(
                        "computed seek collided with the reserved flush sentinel".into(),
                    ));
                }

                write_entry(patch, &EntryHeader::normal(diff, extra, seek))?;

                for i in 0..lenf {
                    patch.write_u8(
                        new[(lastscan + i) as usize]
                            .wrapping_sub(old_buf[(lastpos + i) as usize]),
                    )?;
                }
                if extra != 0 {
                    patch.write_all(&new[(lastscan + lenf) as usize..(scan - lenb) as usize])?;
                }

                oldcrc.update(&old_buf[lastpos as usize..(lastpos + lenf) as usize]);
                newcrc.update(&new[lastscan as usize..(scan - lenb) as usize]);

                lastscan = scan - lenb;
                lastpos = pos - lenb;
                lastoffset = pos - scan;
            }
        }

        write_entry(
            patch,
            &EntryHeader::flush(oldcrc.finalize(), newcrc.finalize()),
        )?;

        if scansize < newsize {
            let block_start = scansize - blocksize;
            old_buf[block_start..scansize].copy_from_slice(&new[block_start..scansize]);
            oldsize = oldsize.max(scansize);
            scansize = (scansize + blocksize).min(newsize);
        } else {
            break;
        }
    }

    write_terminator(patch)?;
    patch.flush()?;
    Ok(())
}

/// Forward/backward extension of a tentative match plus overlap
/// resolution (spec §4.C). Returns `(lenf, lenb)`.
fn extend_match(
    old: &[u8],
    oldsize: usize,
    new: &[u8],
    lastscan: isize,
    lastpos: isize,
    scan: isize,
    pos: isize,
    scansize: usize,
) -> Result<(isize, isize)> {
    let mut s = 0;
    let mut s_f = 0;
    let mut lenf = 0;
    let mut i = 0;
    while (lastscan + i < scan) && (lastpos + i < oldsize as isize) {
        if old[(lastpos + i) as usize] == new[(lastscan + i) as usize] {
            s += 1;
        }
        i += 1;
        if s * 2 - i > s_f * 2 - lenf {
            s_f = s;
            lenf = i;
        }
    }

    let mut lenb = 0;
    if scan < scansize as isize {
        let mut s = 0;
        let mut s_b = 0;
        let mut i = 1;
        while (scan >= lastscan + i) && (pos >= i) {
            if old[(pos - i) as usize] == new[(scan - i) as usize] {
                s += 1;
            }
            if s * 2 - i > s_b * 2 - lenb {
                s_b = s;
                lenb = i;
            }
            i += 1;
        }
    }

    if lastscan + lenf > scan - lenb {
        let overlap = (lastscan + lenf) - (scan - lenb);
        let mut s = 0;
        let mut s_s = 0;
        let mut lens = 0;
        for i in 0..overlap {
            if new[(lastscan + lenf - overlap + i) as usize]
                == old[(lastpos + lenf - overlap + i) as usize]
            {
                s += 1;
            }
            if new[(scan - lenb + i) as usize] == old[(pos - lenb + i) as usize] {
                s -= 1;
            }
            if s > s_s {
                s_s = s;
                lens = i + 1;
            }
        }
        lenf += lens - overlap;
        lenb -= lens;
    }

    if lenf < 0 || (scan - lenb) - (lastscan + lenf) < 0 {
        return Err(DiffError::Internal(
            "invalid state while extending a match".into(),
        ));
    }

    Ok((lenf, lenb))
}

fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .enumerate()
        .take_while(|(_, (old, new))| old == new)
        .last()
        .map_or(0, |(i, _)| i + 1)
}

/// Compares lexicographically the common part of these slices, i.e. takes the smallest length and
/// compares within that.
fn min_memcmp(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().min(b.len());
    a[..len].cmp(&b[..len])
}

/// This is a binary search of the string `new` in the `old` string using the suffix array
/// `sorted`. `st` and `en` is the start and end of the search range (inclusive).
/// Returns the length of the longest prefix found and stores the position of the
/// string found in `*pos`.
fn search(sorted: &[i32], old: &[u8], new: &[u8], st: usize, en: usize, pos: &mut isize) -> isize {
    if en - st < 2 {
        let x = match_len(&old[(sorted[st] as usize)..], new) as isize;
        let y = match_len(&old[(sorted[en] as usize)..], new) as isize;

        if x > y {
            *pos = sorted[st] as isize;
            x
        } else {
            *pos = sorted[en] as isize;
            y
        }
    } else {
        let x = st + (en - st) / 2;
        if min_memcmp(&old[(sorted[x] as usize)..], new) != Ordering::Greater {
            search(sorted, old, new, x, en, pos)
        } else {
            search(sorted, old, new, st, x, pos)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::patch::apply;
    use std::io::Cursor;

    #[test]
    fn testy() {
        assert_eq!(match_len(b"abcdef", b"abcfed"), 3);
        assert_eq!(match_len(b"abc", b"abcfed"), 3);
        assert_eq!(match_len(b"abcdef", b"abc"), 3);
        assert_eq!(match_len(b"dabcde", b"abcfed"), 0);
    }

    fn roundtrip(old: &[u8], new: &[u8], blocksize: u32) -> Vec<u8> {
        let mut patch = Vec::new();
        generate(old, new, &mut patch, blocksize, |_| {}).unwrap();
        let mut out = Vec::new();
        apply(&mut Cursor::new(old), &mut out, &mut Cursor::new(&patch)).unwrap();
        out
    }

    #[test]
    fn single_block_roundtrip() {
        let old = b"hello world";
        let new = b"hello WORLD";
        assert_eq!(roundtrip(old, new, 0), new);
    }

    #[test]
    fn empty_old_roundtrip() {
        assert_eq!(roundtrip(b"", b"abc", 0), b"abc");
    }

    #[test]
    fn identity_roundtrip() {
        let x = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(roundtrip(x, x, 0), x);
    }

    #[test]
    fn empty_new_roundtrip() {
        assert_eq!(roundtrip(b"some old content", b"", 0), b"");
    }

    #[test]
    fn multi_block_roundtrip_matches_whole_new() {
        let old: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut new = old.clone();
        new.extend((0..2048u32).map(|i| ((i * 7) % 251) as u8));
        assert_eq!(roundtrip(&old, &new, 1024), new);
    }
}
