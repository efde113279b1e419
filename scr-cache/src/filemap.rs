//! Per-node filemap: `(checkpoint, rank) → {files, expected count, tags,
//! redundancy descriptor}`.
//!
//! The filemap is the crash-recovery oracle: every mutation must be written
//! back to disk before the described file is created or exposed, so a crash
//! leaves at most a phantom entry, never an unreferenced file.

use std::path::{Path, PathBuf};

use anyhow::Error;

use scr_api_types::{CheckpointId, Rank};
use scr_hash::Hash;

const KEY_CKPT: &str = "CKPT";
const KEY_RANK: &str = "RANK";
const KEY_FILE: &str = "FILE";
const KEY_EXPECTED: &str = "FILES";
const KEY_DESC: &str = "DESC";
const KEY_TAG: &str = "TAG";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filemap {
    hash: Hash,
}

impl Filemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self {
            hash: Hash::read_or_default(path)?,
        })
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.hash.write(path)
    }

    fn rank_hash(&self, ckpt: CheckpointId, rank: Rank) -> Option<&Hash> {
        self.hash
            .get_kv(KEY_CKPT, &ckpt.to_string())?
            .get_kv(KEY_RANK, &rank.to_string())
    }

    fn rank_hash_mut(&mut self, ckpt: CheckpointId, rank: Rank) -> &mut Hash {
        self.hash
            .set_kv(KEY_CKPT, ckpt.to_string())
            .set_kv(KEY_RANK, rank.to_string())
    }

    pub fn add_file(&mut self, ckpt: CheckpointId, rank: Rank, file: impl AsRef<Path>) {
        self.rank_hash_mut(ckpt, rank)
            .set_kv(KEY_FILE, file.as_ref().to_string_lossy());
    }

    pub fn remove_file(&mut self, ckpt: CheckpointId, rank: Rank, file: impl AsRef<Path>) {
        self.rank_hash_mut(ckpt, rank)
            .unset_kv(KEY_FILE, &file.as_ref().to_string_lossy());
    }

    pub fn remove_checkpoint(&mut self, ckpt: CheckpointId) {
        self.hash.unset_kv(KEY_CKPT, &ckpt.to_string());
    }

    pub fn remove_rank_by_checkpoint(&mut self, ckpt: CheckpointId, rank: Rank) {
        if let Some(ckpt_hash) = self
            .hash
            .get_mut(KEY_CKPT)
            .and_then(|h| h.get_mut(&ckpt.to_string()))
        {
            ckpt_hash.unset_kv(KEY_RANK, &rank.to_string());
        }
    }

    pub fn list_checkpoints(&self) -> Vec<CheckpointId> {
        let mut ids: Vec<CheckpointId> = match self.hash.get(KEY_CKPT) {
            Some(h) => h.keys().filter_map(|k| k.parse().ok()).collect(),
            None => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    pub fn num_checkpoints(&self) -> usize {
        self.hash.get(KEY_CKPT).map(|h| h.len()).unwrap_or(0)
    }

    pub fn latest_checkpoint(&self) -> Option<CheckpointId> {
        self.list_checkpoints().into_iter().max()
    }

    pub fn oldest_checkpoint(&self) -> Option<CheckpointId> {
        self.list_checkpoints().into_iter().min()
    }

    pub fn list_ranks_by_checkpoint(&self, ckpt: CheckpointId) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = match self
            .hash
            .get_kv(KEY_CKPT, &ckpt.to_string())
            .and_then(|h| h.get(KEY_RANK))
        {
            Some(h) => h.keys().filter_map(|k| k.parse().ok()).collect(),
            None => Vec::new(),
        };
        ranks.sort_unstable();
        ranks
    }

    pub fn first_rank_by_checkpoint(&self, ckpt: CheckpointId) -> Option<Rank> {
        self.list_ranks_by_checkpoint(ckpt).into_iter().next()
    }

    /// All ranks this node has files for, across every cached checkpoint.
    pub fn list_ranks(&self) -> Vec<Rank> {
        let mut ranks = Vec::new();
        for ckpt in self.list_checkpoints() {
            ranks.extend(self.list_ranks_by_checkpoint(ckpt));
        }
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }

    pub fn num_ranks(&self) -> usize {
        self.list_ranks().len()
    }

    pub fn have_rank(&self, rank: Rank) -> bool {
        self.list_checkpoints()
            .iter()
            .any(|&ckpt| self.rank_hash(ckpt, rank).is_some())
    }

    pub fn have_rank_by_checkpoint(&self, ckpt: CheckpointId, rank: Rank) -> bool {
        self.rank_hash(ckpt, rank).is_some()
    }

    pub fn list_files(&self, ckpt: CheckpointId, rank: Rank) -> Vec<PathBuf> {
        match self.rank_hash(ckpt, rank).and_then(|h| h.get(KEY_FILE)) {
            Some(h) => h.keys().map(PathBuf::from).collect(),
            None => Vec::new(),
        }
    }

    pub fn num_files(&self, ckpt: CheckpointId, rank: Rank) -> usize {
        self.rank_hash(ckpt, rank)
            .and_then(|h| h.get(KEY_FILE))
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub fn set_expected_files(&mut self, ckpt: CheckpointId, rank: Rank, count: usize) {
        self.rank_hash_mut(ckpt, rank)
            .set_value_u64(KEY_EXPECTED, count as u64);
    }

    pub fn num_expected_files(&self, ckpt: CheckpointId, rank: Rank) -> Option<usize> {
        self.rank_hash(ckpt, rank)
            .and_then(|h| h.get_u64(KEY_EXPECTED))
            .map(|n| n as usize)
    }

    pub fn set_desc(&mut self, ckpt: CheckpointId, rank: Rank, desc: Hash) {
        self.rank_hash_mut(ckpt, rank).set_hash(KEY_DESC, desc);
    }

    pub fn get_desc(&self, ckpt: CheckpointId, rank: Rank) -> Option<Hash> {
        self.rank_hash(ckpt, rank)
            .and_then(|h| h.get(KEY_DESC))
            .filter(|h| !h.is_empty())
            .cloned()
    }

    pub fn set_tag(&mut self, ckpt: CheckpointId, rank: Rank, tag: &str, value: &str) {
        self.rank_hash_mut(ckpt, rank)
            .set(KEY_TAG)
            .set_value(tag, value);
    }

    pub fn get_tag(&self, ckpt: CheckpointId, rank: Rank, tag: &str) -> Option<String> {
        self.rank_hash(ckpt, rank)
            .and_then(|h| h.get(KEY_TAG))
            .and_then(|h| h.get_value(tag))
            .map(|v| v.to_owned())
    }

    /// Remove and return everything this map holds for `rank`.
    pub fn extract_rank(&mut self, rank: Rank) -> Filemap {
        let mut out = Filemap::new();
        for ckpt in self.list_checkpoints() {
            if let Some(ckpt_hash) = self
                .hash
                .get_mut(KEY_CKPT)
                .and_then(|h| h.get_mut(&ckpt.to_string()))
            {
                if let Some(rank_hash) = ckpt_hash
                    .get_mut(KEY_RANK)
                    .and_then(|h| h.unset(&rank.to_string()))
                {
                    out.hash
                        .set_kv(KEY_CKPT, ckpt.to_string())
                        .set(KEY_RANK)
                        .set_hash(rank.to_string(), rank_hash);
                }
            }
        }
        // drop checkpoints that lost their last rank
        for ckpt in self.list_checkpoints() {
            let empty = self
                .hash
                .get_kv(KEY_CKPT, &ckpt.to_string())
                .map(|h| h.get(KEY_RANK).map(|r| r.is_empty()).unwrap_or(true))
                .unwrap_or(true);
            if empty {
                self.remove_checkpoint(ckpt);
            }
        }
        out
    }

    pub fn merge(&mut self, other: &Filemap) {
        self.hash.merge(&other.hash);
    }

    pub fn clear(&mut self) {
        self.hash.clear();
    }

    pub fn as_hash(&self) -> &Hash {
        &self.hash
    }

    pub fn from_hash(hash: Hash) -> Self {
        Self { hash }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.hash.to_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            hash: Hash::from_bytes(data)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_list_remove() {
        let mut map = Filemap::new();
        map.add_file(3, 0, "/cache/checkpoint.3/rank_0_a");
        map.add_file(3, 0, "/cache/checkpoint.3/rank_0_b");
        map.add_file(5, 1, "/cache/checkpoint.5/rank_1_a");
        map.set_expected_files(3, 0, 2);

        assert_eq!(map.list_checkpoints(), vec![3, 5]);
        assert_eq!(map.latest_checkpoint(), Some(5));
        assert_eq!(map.oldest_checkpoint(), Some(3));
        assert_eq!(map.num_files(3, 0), 2);
        assert_eq!(map.num_expected_files(3, 0), Some(2));
        assert_eq!(map.num_expected_files(3, 1), None);
        assert_eq!(map.list_ranks(), vec![0, 1]);
        assert_eq!(map.first_rank_by_checkpoint(5), Some(1));

        map.remove_file(3, 0, "/cache/checkpoint.3/rank_0_a");
        assert_eq!(map.num_files(3, 0), 1);

        map.remove_checkpoint(3);
        assert_eq!(map.list_checkpoints(), vec![5]);
    }

    #[test]
    fn extract_and_merge() {
        let mut map = Filemap::new();
        map.add_file(7, 2, "/cache/checkpoint.7/two");
        map.add_file(7, 4, "/cache/checkpoint.7/four");
        map.set_tag(7, 4, "PARTNER", "node3");

        let extracted = map.extract_rank(4);
        assert!(!map.have_rank(4));
        assert!(map.have_rank_by_checkpoint(7, 2));
        assert_eq!(extracted.list_files(7, 4), vec![PathBuf::from("/cache/checkpoint.7/four")]);
        assert_eq!(extracted.get_tag(7, 4, "PARTNER").as_deref(), Some("node3"));

        map.merge(&extracted);
        assert!(map.have_rank_by_checkpoint(7, 4));
    }

    #[test]
    fn extract_drops_empty_checkpoints() {
        let mut map = Filemap::new();
        map.add_file(1, 0, "/cache/checkpoint.1/only");
        let _ = map.extract_rank(0);
        assert_eq!(map.num_checkpoints(), 0);
    }

    #[test]
    fn desc_round_trip() {
        let mut desc = Hash::new();
        desc.set_value("TYPE", "XOR");
        desc.set_value("INTERVAL", "1");

        let mut map = Filemap::new();
        map.set_desc(2, 0, desc.clone());
        assert_eq!(map.get_desc(2, 0), Some(desc));
        assert_eq!(map.get_desc(2, 1), None);
    }
}
