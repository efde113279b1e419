//! Sidecar metadata.
//!
//! Each data file `F` in cache or on the parallel file system carries a
//! sidecar `F.scr` recording what the file is supposed to be. A present,
//! complete sidecar is the definition of a complete file; deleting the
//! sidecar marks the file incomplete.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use scr_api_types::{CheckpointId, FileKind, Rank, META_FILE_SUFFIX};
use scr_hash::Hash;

const KEY_FILE: &str = "FILE";
const KEY_TYPE: &str = "TYPE";
const KEY_SIZE: &str = "SIZE";
const KEY_CKPT: &str = "CKPT";
const KEY_RANK: &str = "RANK";
const KEY_RANKS: &str = "RANKS";
const KEY_COMPLETE: &str = "COMPLETE";
const KEY_CRC: &str = "CRC";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Basename of the data file.
    pub filename: String,
    pub kind: FileKind,
    pub filesize: u64,
    pub checkpoint_id: CheckpointId,
    pub rank: Rank,
    pub ranks: usize,
    pub complete: bool,
    pub crc32: Option<u32>,
}

/// Sidecar path for a data file: the file name with `.scr` appended.
pub fn meta_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(META_FILE_SUFFIX);
    PathBuf::from(name)
}

impl Meta {
    pub fn new(
        file: &Path,
        kind: FileKind,
        filesize: u64,
        checkpoint_id: CheckpointId,
        rank: Rank,
        ranks: usize,
        complete: bool,
    ) -> Self {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            filename,
            kind,
            filesize,
            checkpoint_id,
            rank,
            ranks,
            complete,
            crc32: None,
        }
    }

    pub fn to_hash(&self) -> Hash {
        let mut hash = Hash::new();
        hash.set_value(KEY_FILE, &self.filename);
        hash.set_value(KEY_TYPE, self.kind.as_str());
        hash.set_value_u64(KEY_SIZE, self.filesize);
        hash.set_value_u64(KEY_CKPT, self.checkpoint_id);
        hash.set_value_u64(KEY_RANK, self.rank as u64);
        hash.set_value_u64(KEY_RANKS, self.ranks as u64);
        hash.set_value_u64(KEY_COMPLETE, self.complete as u64);
        if let Some(crc) = self.crc32 {
            hash.set_crc32(KEY_CRC, crc);
        }
        hash
    }

    pub fn from_hash(hash: &Hash) -> Result<Self, Error> {
        let get = |key: &str| {
            hash.get_value(key)
                .map(|v| v.to_owned())
                .ok_or_else(|| format_err!("sidecar metadata is missing key '{}'", key))
        };
        Ok(Self {
            filename: get(KEY_FILE)?,
            kind: get(KEY_TYPE)?.parse()?,
            filesize: hash
                .get_u64(KEY_SIZE)
                .ok_or_else(|| format_err!("sidecar metadata is missing key '{}'", KEY_SIZE))?,
            checkpoint_id: hash
                .get_u64(KEY_CKPT)
                .ok_or_else(|| format_err!("sidecar metadata is missing key '{}'", KEY_CKPT))?,
            rank: hash
                .get_u64(KEY_RANK)
                .ok_or_else(|| format_err!("sidecar metadata is missing key '{}'", KEY_RANK))?
                as Rank,
            ranks: hash
                .get_u64(KEY_RANKS)
                .ok_or_else(|| format_err!("sidecar metadata is missing key '{}'", KEY_RANKS))?
                as usize,
            complete: hash.get_u64(KEY_COMPLETE).unwrap_or(0) != 0,
            crc32: hash.get_crc32(KEY_CRC),
        })
    }

    /// Read the sidecar of data file `file`.
    pub fn read(file: &Path) -> Result<Self, Error> {
        let hash = Hash::read(meta_path(file))?;
        Self::from_hash(&hash)
    }

    /// Write the sidecar of data file `file`; this is how a file is marked
    /// complete.
    pub fn write(&self, file: &Path) -> Result<(), Error> {
        self.to_hash().write(meta_path(file))
    }

    /// Delete the sidecar, marking the file incomplete. Missing sidecars are
    /// fine.
    pub fn unlink(file: &Path) {
        let path = meta_path(file);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove sidecar {:?} - {}", path, err);
            }
        }
    }

    pub fn check_filesize(&self, size: u64) -> bool {
        self.filesize == size
    }
}

/// Compute the CRC32 of `file` and reconcile it with the sidecar: verify
/// when the sidecar already carries a CRC (a mismatch marks the file
/// incomplete and fails), record it otherwise.
pub fn compute_crc(file: &Path, buf_size: usize) -> Result<(), Error> {
    let mut meta = Meta::read(file)?;

    let mut reader = std::fs::File::open(file)
        .map_err(|err| format_err!("unable to open {:?} for crc check - {}", file, err))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; buf_size.max(4096)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let crc = hasher.finalize();

    match meta.crc32 {
        Some(expected) if expected != crc => {
            meta.complete = false;
            meta.write(file)?;
            bail!(
                "crc32 mismatch for {:?} (computed {:#x}, expected {:#x})",
                file,
                crc,
                expected
            );
        }
        Some(_) => Ok(()),
        None => {
            meta.crc32 = Some(crc);
            meta.write(file)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_round_trip() {
        let mut meta = Meta::new(Path::new("/cache/checkpoint.4/rank_0_a"), FileKind::Full, 1024, 4, 0, 8, true);
        meta.crc32 = Some(0x1234abcd);
        let back = Meta::from_hash(&meta.to_hash()).unwrap();
        assert_eq!(meta, back);
        assert_eq!(back.filename, "rank_0_a");
    }

    #[test]
    fn sidecar_file_cycle() {
        let dir = std::env::temp_dir().join(format!("scr-meta-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("data.bin");
        std::fs::write(&file, b"payload").unwrap();

        let meta = Meta::new(&file, FileKind::Full, 7, 1, 0, 2, true);
        meta.write(&file).unwrap();
        assert_eq!(Meta::read(&file).unwrap(), meta);

        // first pass records the crc, second verifies it
        compute_crc(&file, 4096).unwrap();
        let crc = Meta::read(&file).unwrap().crc32.unwrap();
        compute_crc(&file, 4096).unwrap();
        assert_eq!(Meta::read(&file).unwrap().crc32, Some(crc));

        // corrupt the payload, the check must fail and mark incomplete
        std::fs::write(&file, b"corrupt").unwrap();
        assert!(compute_crc(&file, 4096).is_err());
        assert!(!Meta::read(&file).unwrap().complete);

        Meta::unlink(&file);
        assert!(Meta::read(&file).is_err());
        Meta::unlink(&file); // idempotent

        let _ = std::fs::remove_dir_all(&dir);
    }
}
