//! Flush-location file: per-checkpoint set of `{CACHE, PFS, FLUSHING}`.
//!
//! Only the node master reads and writes this file; callers broadcast the
//! answers to their local peers.

use std::path::{Path, PathBuf};

use anyhow::Error;

use scr_api_types::{CheckpointId, FlushLocation};
use scr_hash::Hash;

const KEY_CKPT: &str = "CKPT";
const KEY_LOCATION: &str = "LOCATION";

pub struct FlushFile {
    path: PathBuf,
}

impl FlushFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Hash, Error> {
        Hash::read_or_default(&self.path)
    }

    pub fn location_set(&self, ckpt: CheckpointId, location: FlushLocation) -> Result<(), Error> {
        let mut hash = self.read()?;
        hash.set_kv(KEY_CKPT, ckpt.to_string())
            .set_kv(KEY_LOCATION, location.as_str());
        hash.write(&self.path)
    }

    pub fn location_unset(&self, ckpt: CheckpointId, location: FlushLocation) -> Result<(), Error> {
        let mut hash = self.read()?;
        if let Some(ckpt_hash) = hash.get_mut(KEY_CKPT).and_then(|h| h.get_mut(&ckpt.to_string())) {
            ckpt_hash.unset_kv(KEY_LOCATION, location.as_str());
        }
        hash.write(&self.path)
    }

    pub fn location_test(&self, ckpt: CheckpointId, location: FlushLocation) -> Result<bool, Error> {
        let hash = self.read()?;
        Ok(hash
            .get_kv(KEY_CKPT, &ckpt.to_string())
            .and_then(|h| h.get_kv(KEY_LOCATION, location.as_str()))
            .is_some())
    }

    /// A checkpoint needs a flush when it sits in cache but not on the
    /// parallel file system.
    pub fn need_flush(&self, ckpt: CheckpointId) -> Result<bool, Error> {
        let hash = self.read()?;
        let ckpt_hash = hash.get_kv(KEY_CKPT, &ckpt.to_string());
        let in_cache = ckpt_hash
            .and_then(|h| h.get_kv(KEY_LOCATION, FlushLocation::Cache.as_str()))
            .is_some();
        let in_pfs = ckpt_hash
            .and_then(|h| h.get_kv(KEY_LOCATION, FlushLocation::Pfs.as_str()))
            .is_some();
        Ok(in_cache && !in_pfs)
    }

    /// Purge every record of `ckpt` (checkpoint delete path).
    pub fn remove_checkpoint(&self, ckpt: CheckpointId) -> Result<(), Error> {
        let mut hash = self.read()?;
        hash.unset_kv(KEY_CKPT, &ckpt.to_string());
        hash.write(&self.path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn location_state_machine() {
        let dir = std::env::temp_dir().join(format!("scr-flushfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let ff = FlushFile::new(dir.join("flush.scrinfo"));

        assert!(!ff.need_flush(9).unwrap());

        ff.location_set(9, FlushLocation::Cache).unwrap();
        assert!(ff.need_flush(9).unwrap());
        assert!(ff.location_test(9, FlushLocation::Cache).unwrap());

        ff.location_set(9, FlushLocation::Flushing).unwrap();
        assert!(ff.location_test(9, FlushLocation::Flushing).unwrap());
        // still needs a flush until PFS is set
        assert!(ff.need_flush(9).unwrap());

        ff.location_set(9, FlushLocation::Pfs).unwrap();
        ff.location_unset(9, FlushLocation::Flushing).unwrap();
        assert!(!ff.need_flush(9).unwrap());
        assert!(!ff.location_test(9, FlushLocation::Flushing).unwrap());

        ff.remove_checkpoint(9).unwrap();
        assert!(!ff.location_test(9, FlushLocation::Pfs).unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
