use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;
use zerocopy::Ref;

use crate::checkpoint::CheckpointStore;
use crate::wire::{EntryHeader, PatchHeader};

type Str = Box<str>;
type Result<T> = std::result::Result<T, PatchError>;

const BLOCK_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("io error reading the patch stream: {0}")]
    PatchIo(#[source] std::io::Error),
    #[error("io error reading the old stream: {0}")]
    OldIo(#[source] std::io::Error),
    #[error("io error writing the destination: {0}")]
    NewIo(#[source] std::io::Error),
    #[error("invalid magic number")]
    BadMagic,
    #[error("patch ended before producing the declared output length")]
    PatchShort,
    #[error("patch application failed: {0}")]
    Internal(Str),
}

fn read_from_patch<T: zerocopy::FromBytes + Copy>(patch: &mut impl Read) -> Result<T> {
    let mut buf = vec![0u8; std::mem::size_of::<T>()];
    patch.read_exact(&mut buf).map_err(PatchError::PatchIo)?;
    Ref::<_, T>::from_bytes(&buf[..])
        .map(|r| *r)
        .map_err(|_| PatchError::Internal("entry bytes not aligned".into()))
}

fn read_header(patch: &mut impl Read) -> Result<PatchHeader> {
    let header: PatchHeader = read_from_patch(patch)?;
    if !header.magic_ok() {
        return Err(PatchError::BadMagic);
    }
    Ok(header)
}

fn read_entry(patch: &mut impl Read) -> Result<EntryHeader> {
    read_from_patch(patch)
}

/// Apply the `diff` payload of a normal entry: read `size` bytes from both
/// `patch` and `old`, add them pairwise (wrapping), and write the result to
/// `new`. When `crc` is given, it accumulates over the old bytes consumed,
/// matching the original's rolling per-block CRC.
fn apply_diff(
    patch: &mut impl Read,
    old: &mut impl Read,
    new: &mut impl Write,
    mut size: u32,
    mut crc: Option<&mut crc32fast::Hasher>,
) -> Result<()> {
    let mut old_buf = [0u8; BLOCK_SIZE];
    let mut patch_buf = [0u8; BLOCK_SIZE];
    while size > 0 {
        let to_read = (BLOCK_SIZE as u32).min(size) as usize;
        let old_buf = &mut old_buf[..to_read];
        let patch_buf = &mut patch_buf[..to_read];

        patch.read_exact(patch_buf).map_err(PatchError::PatchIo)?;
        old.read_exact(old_buf).map_err(PatchError::OldIo)?;

        if let Some(hasher) = crc.as_deref_mut() {
            hasher.update(old_buf);
        }

        old_buf
            .iter_mut()
            .zip(patch_buf.iter())
            .for_each(|(o, p)| *o = o.wrapping_add(*p));

        new.write_all(old_buf).map_err(PatchError::NewIo)?;
        size -= to_read as u32;
    }
    Ok(())
}

fn copy_bytes(src: &mut impl Read, dst: &mut impl Write, mut bytes: u32) -> Result<()> {
    let mut buf = [0u8; BLOCK_SIZE];
    while bytes > 0 {
        let to_read = (BLOCK_SIZE as u32).min(bytes) as usize;
        let buf = &mut buf[..to_read];
        src.read_exact(buf).map_err(PatchError::PatchIo)?;
        dst.write_all(buf).map_err(PatchError::NewIo)?;
        bytes -= to_read as u32;
    }
    Ok(())
}

fn seek_old(old: &mut impl Seek, seek: i32) -> Result<()> {
    old.seek(SeekFrom::Current(seek as i64))
        .map_err(PatchError::OldIo)?;
    Ok(())
}

/// Apply a patch to `old`, writing the reconstructed file to `new`.
/// `old` must be seekable; `patch` and `new` are consumed/produced strictly
/// sequentially. Flush records are no-ops in this mode — there is no
/// directory to host block checkpoints, so nothing to checkpoint against.
pub fn apply(old: &mut (impl Read + Seek), new: &mut impl Write, patch: &mut impl Read) -> Result<()> {
    let header = read_header(patch)?;
    let mut bytes_written = 0u64;

    loop {
        let entry = read_entry(patch)?;

        if entry.is_terminator() {
            new.flush().map_err(PatchError::NewIo)?;
            return if bytes_written == header.new_file_size.get() {
                Ok(())
            } else {
                Err(PatchError::PatchShort)
            };
        }

        if entry.is_flush() {
            continue;
        }

        apply_diff(patch, old, new, entry.diff_len(), None)?;
        copy_bytes(patch, new, entry.extra_len())?;
        seek_old(old, entry.seek_value())?;
        bytes_written += entry.diff_len() as u64 + entry.extra_len() as u64;
    }
}

/// Apply a patch to `old` *in place*, using `dest_dir` to host the working
/// temp file and block checkpoints (spec §4.F/§4.G). Each block's output is
/// staged in `<dest_dir>/ddelta.tmp`; once a flush confirms the block's
/// `oldcrc` matches what the generator saw, the staged bytes are spliced
/// back into `old` at the block's offset and the checkpoint is consumed.
///
/// `old` is transformed into the reconstructed file; callers that want a
/// distinct output path are expected to relocate it afterwards. This
/// mirrors the original tool's behavior when given a directory destination:
/// the directory hosts scratch state, not the final bytes.
pub fn apply_directory(old: &mut File, dest_dir: &Path, patch: &mut impl Read) -> Result<()> {
    let header = read_header(patch)?;
    let store = CheckpointStore::new(dest_dir);
    let mut bytes_written = 0u64;
    let mut oldcrc = crc32fast::Hasher::new();
    let mut tmp = store.fresh_working_file()?;

    loop {
        let entry = read_entry(patch)?;

        if entry.is_terminator() {
            tmp.flush().map_err(PatchError::NewIo)?;
            tmp.sync_data().map_err(PatchError::NewIo)?;
            drop(tmp);
            store.sweep();
            return if bytes_written == header.new_file_size.get() {
                Ok(())
            } else {
                Err(PatchError::PatchShort)
            };
        }

        if entry.is_flush() {
            let block_start = bytes_written - tmp.stream_position().map_err(PatchError::NewIo)?;
            tmp.flush().map_err(PatchError::NewIo)?;
            tmp.sync_data().map_err(PatchError::NewIo)?;
            drop(tmp);

            if oldcrc.finalize() == entry.oldcrc() {
                store.promote(entry.newcrc())?;
            }
            store.restore(old, block_start, bytes_written, entry.newcrc())?;
            store.sweep();

            tmp = store.fresh_working_file()?;
            oldcrc = crc32fast::Hasher::new();
            continue;
        }

        apply_diff(patch, old, &mut tmp, entry.diff_len(), Some(&mut oldcrc))?;
        copy_bytes(patch, &mut tmp, entry.extra_len())?;
        seek_old(old, entry.seek_value())?;
        bytes_written += entry.diff_len() as u64 + entry.extra_len() as u64;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::diff::generate;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn file_mode_roundtrip_with_flush_markers() {
        let old: Vec<u8> = (0..2000u32).map(|i| (i % 200) as u8).collect();
        let mut new = old.clone();
        new.extend((0..1500u32).map(|i| ((i * 3) % 200) as u8));

        let mut patch = Vec::new();
        generate(&old, &new, &mut patch, 512, |_| {}).unwrap();

        let mut out = Vec::new();
        apply(&mut Cursor::new(&old), &mut out, &mut Cursor::new(&patch)).unwrap();
        assert_eq!(out, new);
    }

    #[test]
    fn directory_mode_transforms_old_into_new_in_place() {
        let old: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
        let mut new = old.clone();
        new.extend((0..1200u32).map(|i| ((i * 5) % 241) as u8));

        let mut patch = Vec::new();
        generate(&old, &new, &mut patch, 1024, |_| {}).unwrap();

        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        std::fs::write(&old_path, &old).unwrap();
        let mut old_file = File::options()
            .read(true)
            .write(true)
            .open(&old_path)
            .unwrap();

        apply_directory(&mut old_file, dir.path(), &mut Cursor::new(&patch)).unwrap();

        let result = std::fs::read(&old_path).unwrap();
        assert_eq!(result, new);
        assert!(!dir.path().join("ddelta.tmp").exists());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut patch = vec![0u8; 24];
        patch[0] = b'X';
        let mut out = Vec::new();
        let err = apply(&mut Cursor::new(&[][..]), &mut out, &mut Cursor::new(&patch)).unwrap_err();
        assert!(matches!(err, PatchError::BadMagic));
    }
}
