//! Prefix-scoped catalog of flushed checkpoint directories.
//!
//! One entry per (checkpoint id, directory name) with a flush timestamp plus
//! complete, fetched and failed marks. The fetch path walks this catalog
//! backwards when the current link turns out to be a dud.

use std::path::{Path, PathBuf};

use anyhow::Error;

use scr_api_types::{CheckpointId, INDEX_FILE_NAME};
use scr_hash::Hash;

const KEY_CKPT: &str = "CKPT";
const KEY_DIR: &str = "DIR";
const KEY_COMPLETE: &str = "COMPLETE";
const KEY_FLUSHED: &str = "FLUSHED";
const KEY_FETCHED: &str = "FETCHED";
const KEY_FAILED: &str = "FAILED";

#[derive(Debug, Default)]
pub struct Index {
    hash: Hash,
    path: PathBuf,
}

impl Index {
    pub fn read(prefix: &Path) -> Result<Self, Error> {
        let path = prefix.join(INDEX_FILE_NAME);
        Ok(Self {
            hash: Hash::read_or_default(&path)?,
            path,
        })
    }

    pub fn write(&self) -> Result<(), Error> {
        self.hash.write(&self.path)
    }

    fn dir_hash(&mut self, id: CheckpointId, dir: &str) -> &mut Hash {
        self.hash
            .set_kv(KEY_CKPT, id.to_string())
            .set_kv(KEY_DIR, dir)
    }

    /// Register a directory and stamp its flush time.
    pub fn add_checkpoint_dir(&mut self, id: CheckpointId, dir: &str) {
        self.dir_hash(id, dir);
    }

    pub fn mark_flushed(&mut self, id: CheckpointId, dir: &str) {
        let now = proxmox_time::epoch_i64();
        self.dir_hash(id, dir).set_value_i64(KEY_FLUSHED, now);
    }

    pub fn set_complete(&mut self, id: CheckpointId, dir: &str, complete: bool) {
        self.dir_hash(id, dir)
            .set_value_u64(KEY_COMPLETE, complete as u64);
    }

    pub fn mark_fetched(&mut self, id: CheckpointId, dir: &str) {
        let now = proxmox_time::epoch_i64();
        self.dir_hash(id, dir).set_value_i64(KEY_FETCHED, now);
    }

    pub fn mark_failed(&mut self, id: CheckpointId, dir: &str) {
        let now = proxmox_time::epoch_i64();
        self.dir_hash(id, dir).set_value_i64(KEY_FAILED, now);
    }

    pub fn checkpoint_id_by_dir(&self, dir: &str) -> Option<CheckpointId> {
        let ckpts = self.hash.get(KEY_CKPT)?;
        for (id, entry) in ckpts.iter() {
            if entry.get_kv(KEY_DIR, dir).is_some() {
                return id.parse().ok();
            }
        }
        None
    }

    /// Most recent complete, not-failed checkpoint strictly older than
    /// `older_than` (pass `None` for no bound). Returns (id, directory).
    pub fn most_recent_complete(
        &self,
        older_than: Option<CheckpointId>,
    ) -> Option<(CheckpointId, String)> {
        let ckpts = self.hash.get(KEY_CKPT)?;
        let mut best: Option<(CheckpointId, String)> = None;
        for (id_str, entry) in ckpts.iter() {
            let id: CheckpointId = match id_str.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            if let Some(bound) = older_than {
                if id >= bound {
                    continue;
                }
            }
            if best.as_ref().map(|(b, _)| id <= *b).unwrap_or(false) {
                continue;
            }
            if let Some(dirs) = entry.get(KEY_DIR) {
                for (dir, marks) in dirs.iter() {
                    let complete = marks.get_u64(KEY_COMPLETE) == Some(1);
                    let failed = marks.get(KEY_FAILED).is_some();
                    if complete && !failed {
                        best = Some((id, dir.to_owned()));
                        break;
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn catalog_cursor() {
        let prefix = std::env::temp_dir().join(format!("scr-index-test-{}", std::process::id()));
        std::fs::create_dir_all(&prefix).unwrap();

        let mut index = Index::read(&prefix).unwrap();
        for (id, dir) in [(100u64, "scr.a.1.100"), (101, "scr.a.1.101"), (102, "scr.a.1.102")] {
            index.add_checkpoint_dir(id, dir);
            index.mark_flushed(id, dir);
            index.set_complete(id, dir, true);
        }
        index.mark_failed(101, "scr.a.1.101");
        index.write().unwrap();

        let index = Index::read(&prefix).unwrap();
        assert_eq!(index.checkpoint_id_by_dir("scr.a.1.101"), Some(101));
        assert_eq!(index.checkpoint_id_by_dir("nope"), None);

        assert_eq!(
            index.most_recent_complete(None),
            Some((102, "scr.a.1.102".to_owned()))
        );
        // 101 is failed, the cursor skips straight to 100
        assert_eq!(
            index.most_recent_complete(Some(102)),
            Some((100, "scr.a.1.100".to_owned()))
        );
        assert_eq!(index.most_recent_complete(Some(100)), None);

        let _ = std::fs::remove_dir_all(&prefix);
    }
}
