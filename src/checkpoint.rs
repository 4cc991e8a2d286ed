//! Directory-mode checkpoint store (spec §4.G).
//!
//! Lives entirely inside the destination directory during a single
//! `apply_directory` run: a working temp file (`ddelta.tmp`) accumulates
//! the block currently being produced, and on a successful flush it is
//! promoted to a CRC-named backup (`<newcrc>.tmp`) that a *later* run can
//! recognize and splice back into `old` instead of redoing the work.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::patch::PatchError;

const WORKING_NAME: &str = "ddelta.tmp";
const COPY_BUF: usize = 32 * 1024;

pub(crate) struct CheckpointStore<'a> {
    dir: &'a Path,
}

impl<'a> CheckpointStore<'a> {
    pub fn new(dir: &'a Path) -> Self {
        CheckpointStore { dir }
    }

    pub fn working_path(&self) -> PathBuf {
        self.dir.join(WORKING_NAME)
    }

    fn backup_path(&self, newcrc: u32) -> PathBuf {
        self.dir.join(format!("{newcrc}.tmp"))
    }

    /// Open a fresh, empty working temp file, discarding any prior one.
    pub fn fresh_working_file(&self) -> Result<File, PatchError> {
        let path = self.working_path();
        let _ = fs::remove_file(&path);
        File::create(&path).map_err(PatchError::NewIo)
    }

    /// Atomically rename the just-closed working file to `<newcrc>.tmp`,
    /// replacing any prior backup under that name.
    pub fn promote(&self, newcrc: u32) -> Result<(), PatchError> {
        let backup = self.backup_path(newcrc);
        let _ = fs::remove_file(&backup);
        fs::rename(self.working_path(), &backup).map_err(PatchError::NewIo)?;
        log::debug!("promoted working block to checkpoint {newcrc:#010x}");
        Ok(())
    }

    /// If `<newcrc>.tmp` exists, write its bytes into `old` at
    /// `[start, end)`, verifying the freshly computed CRC equals
    /// `expected_newcrc`. Returns whether a backup was found and restored.
    /// Leaves the backup file in place on CRC mismatch, per spec §8's
    /// "CRC-guarded restore" property.
    pub fn restore(
        &self,
        old: &mut File,
        start: u64,
        end: u64,
        expected_newcrc: u32,
    ) -> Result<bool, PatchError> {
        let backup = self.backup_path(expected_newcrc);
        if !backup.is_file() {
            log::debug!("no checkpoint {expected_newcrc:#010x} to restore, skipping");
            return Ok(false);
        }

        let origin = old.stream_position().map_err(PatchError::OldIo)?;
        old.seek(SeekFrom::Start(start)).map_err(PatchError::OldIo)?;

        let mut src = File::open(&backup).map_err(PatchError::NewIo)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; COPY_BUF];
        let mut remaining = end.saturating_sub(start);
        while remaining > 0 {
            let to_read = (buf.len() as u64).min(remaining) as usize;
            src.read_exact(&mut buf[..to_read])
                .map_err(PatchError::NewIo)?;
            old.write_all(&buf[..to_read]).map_err(PatchError::OldIo)?;
            hasher.update(&buf[..to_read]);
            remaining -= to_read as u64;
        }

        old.flush().map_err(PatchError::OldIo)?;
        old.sync_data().map_err(PatchError::OldIo)?;
        old.seek(SeekFrom::Start(origin)).map_err(PatchError::OldIo)?;

        let actual = hasher.finalize();
        if actual != expected_newcrc {
            return Err(PatchError::NewIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "checkpoint restore crc mismatch: expected {expected_newcrc:#010x}, got {actual:#010x}"
                ),
            )));
        }

        fs::remove_file(&backup).map_err(PatchError::NewIo)?;
        log::debug!("restored checkpoint {expected_newcrc:#010x} into old[{start}..{end})");
        Ok(true)
    }

    /// Remove the working temp file left over from a terminated run.
    pub fn sweep(&self) {
        let _ = fs::remove_file(self.working_path());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn promote_then_restore_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        {
            let mut working = store.fresh_working_file().unwrap();
            working.write_all(b"block bytes").unwrap();
        }
        store.promote(0xdead_beef).unwrap();
        assert!(store.backup_path(0xdead_beef).is_file());

        let mut old = File::create(dir.path().join("old.bin")).unwrap();
        old.set_len(11).unwrap();
        let mut old = File::options()
            .read(true)
            .write(true)
            .open(dir.path().join("old.bin"))
            .unwrap();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"block bytes");
        let crc = hasher.finalize();

        let restored = store.restore(&mut old, 0, 11, crc).unwrap();
        assert!(restored);
        assert!(!store.backup_path(0xdead_beef).is_file());

        let mut contents = Vec::new();
        old.seek(SeekFrom::Start(0)).unwrap();
        old.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"block bytes");
    }

    #[test]
    fn restore_rejects_crc_mismatch_and_keeps_backup() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        {
            let mut working = store.fresh_working_file().unwrap();
            working.write_all(b"payload").unwrap();
        }
        store.promote(1).unwrap();

        let mut old = File::create(dir.path().join("old.bin")).unwrap();
        old.set_len(7).unwrap();
        let mut old = File::options()
            .read(true)
            .write(true)
            .open(dir.path().join("old.bin"))
            .unwrap();

        let err = store.restore(&mut old, 0, 7, 0x1234).unwrap_err();
        assert!(matches!(err, PatchError::NewIo(_)));
        assert!(store.backup_path(1).is_file());
    }
}
