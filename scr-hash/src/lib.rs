//! Hierarchical string-keyed hash.
//!
//! Every serialized object in the library (filemaps, sidecar metadata,
//! summaries, the index, the halt file, the transfer file, XOR chunk headers
//! and all exchange payloads) is a tree of string keys. A "value" is simply
//! a key whose subtree is empty, so `set_kv("SIZE", "1024")` produces
//! `SIZE → 1024 → {}` and `get_value("SIZE")` reads it back.
//!
//! On disk the tree is a canonical JSON document written atomically via
//! rename; node-shared files (transfer, halt) are accessed under an advisory
//! lock.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Context, Error};
use serde::{Deserialize, Serialize};

use proxmox_sys::fs::CreateOptions;

/// How long to wait on the advisory lock of a node-shared hash file.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash {
    children: BTreeMap<String, Hash>,
}

impl Hash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn get(&self, key: &str) -> Option<&Hash> {
        self.children.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Hash> {
        self.children.get_mut(key)
    }

    /// Get or create the child under `key`.
    pub fn set(&mut self, key: impl Into<String>) -> &mut Hash {
        self.children.entry(key.into()).or_default()
    }

    /// Insert `subtree` under `key`, replacing any existing child.
    pub fn set_hash(&mut self, key: impl Into<String>, subtree: Hash) -> &mut Hash {
        let entry = self.children.entry(key.into()).or_default();
        *entry = subtree;
        entry
    }

    /// Get or create `key → val`, returning the hash under `val`.
    pub fn set_kv(&mut self, key: impl Into<String>, val: impl Into<String>) -> &mut Hash {
        self.set(key).set(val)
    }

    pub fn get_kv(&self, key: &str, val: &str) -> Option<&Hash> {
        self.get(key).and_then(|h| h.get(val))
    }

    pub fn unset(&mut self, key: &str) -> Option<Hash> {
        self.children.remove(key)
    }

    pub fn unset_kv(&mut self, key: &str, val: &str) {
        if let Some(h) = self.children.get_mut(key) {
            h.children.remove(val);
            if h.children.is_empty() {
                self.children.remove(key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.children.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Hash)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn first_key(&self) -> Option<&str> {
        self.children.keys().next().map(|k| k.as_str())
    }

    /// First value stored under `key`, i.e. the first child key of
    /// `self[key]`.
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|h| h.first_key())
    }

    /// Replace whatever is under `key` with the single value `val`.
    pub fn set_value(&mut self, key: impl Into<String>, val: impl Into<String>) {
        let key = key.into();
        self.unset(&key);
        self.set_kv(key, val);
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_value(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_value(key).and_then(|v| v.parse().ok())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_value(key).and_then(|v| v.parse().ok())
    }

    pub fn set_value_u64(&mut self, key: impl Into<String>, val: u64) {
        self.set_value(key, val.to_string());
    }

    pub fn set_value_i64(&mut self, key: impl Into<String>, val: i64) {
        self.set_value(key, val.to_string());
    }

    /// CRC32 values are stored in `0x`-prefixed hex form.
    pub fn get_crc32(&self, key: &str) -> Option<u32> {
        let v = self.get_value(key)?;
        let v = v.strip_prefix("0x").unwrap_or(v);
        u32::from_str_radix(v, 16).ok()
    }

    pub fn set_crc32(&mut self, key: impl Into<String>, crc: u32) {
        self.set_value(key, format!("{:#x}", crc));
    }

    /// Recursively union `other` into `self`.
    pub fn merge(&mut self, other: &Hash) {
        for (key, sub) in &other.children {
            self.set(key.clone()).merge(sub);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // a BTreeMap of strings cannot fail to serialize
        serde_json::to_vec(self).expect("hash serialization failed")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Hash::new());
        }
        serde_json::from_slice(data).map_err(|err| format_err!("malformed hash data - {}", err))
    }

    /// Read a hash file; fails when the file is missing or malformed.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|err| format_err!("unable to read hash file {:?} - {}", path, err))?;
        Self::from_bytes(&data).with_context(|| format!("parsing hash file {:?}", path))
    }

    /// Read a hash file, treating a missing file as an empty hash.
    pub fn read_or_default(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(data) => Self::from_bytes(&data).with_context(|| format!("parsing hash file {:?}", path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Hash::new()),
            Err(err) => Err(format_err!("unable to read hash file {:?} - {}", path, err)),
        }
    }

    /// Atomically write the hash to `path` (write tmp file + rename).
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        proxmox_sys::fs::replace_file(path, &data, CreateOptions::new(), false)
            .map_err(|err| format_err!("unable to write hash file {:?} - {}", path, err))
    }

    /// Read a node-shared hash file under a shared advisory lock.
    pub fn read_with_lock(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut file =
            proxmox_sys::fs::open_file_locked(path, LOCK_TIMEOUT, false, CreateOptions::new())?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Self::from_bytes(&data).with_context(|| format!("parsing locked hash file {:?}", path))
    }

    /// Open a node-shared hash file under an exclusive advisory lock for a
    /// read-modify-write cycle. The lock is held until the guard is written
    /// back or dropped.
    pub fn lock_open_read(path: impl AsRef<Path>) -> Result<LockedHash, Error> {
        let path = path.as_ref().to_owned();
        let mut file =
            proxmox_sys::fs::open_file_locked(&path, LOCK_TIMEOUT, true, CreateOptions::new())?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let hash =
            Hash::from_bytes(&data).with_context(|| format!("parsing locked hash file {:?}", path))?;
        Ok(LockedHash { file, path, hash })
    }
}

/// Exclusively locked hash file, mutated in place and written back through
/// the same file descriptor so the lock covers the full cycle.
pub struct LockedHash {
    file: File,
    path: PathBuf,
    pub hash: Hash,
}

impl LockedHash {
    /// Write the (possibly modified) hash back and release the lock.
    pub fn write_close_unlock(mut self) -> Result<(), Error> {
        let mut data = serde_json::to_vec_pretty(&self.hash)?;
        data.push(b'\n');
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file
            .write_all(&data)
            .map_err(|err| format_err!("unable to write hash file {:?} - {}", self.path, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kv_semantics() {
        let mut h = Hash::new();
        h.set_kv("CKPT", "7").set_kv("RANK", "0").set_kv("FILE", "a.dat");
        assert_eq!(h.get_value("CKPT"), Some("7"));
        assert!(h.get_kv("CKPT", "7").is_some());
        assert_eq!(
            h.get_kv("CKPT", "7").unwrap().get_kv("RANK", "0").unwrap().get_value("FILE"),
            Some("a.dat")
        );

        h.set_value_u64("SIZE", 4096);
        h.set_value_u64("SIZE", 8192);
        assert_eq!(h.get_u64("SIZE"), Some(8192));
        assert_eq!(h.get("SIZE").unwrap().len(), 1);
    }

    #[test]
    fn merge_and_round_trip() {
        let mut a = Hash::new();
        a.set_kv("RANK", "0").set_value("FILES", "2");
        let mut b = Hash::new();
        b.set_kv("RANK", "1").set_value("FILES", "3");
        a.merge(&b);
        assert_eq!(a.get("RANK").unwrap().len(), 2);

        let bytes = a.to_bytes();
        let c = Hash::from_bytes(&bytes).unwrap();
        assert_eq!(a, c);

        assert!(Hash::from_bytes(b"").unwrap().is_empty());
        assert!(Hash::from_bytes(b"not json").is_err());
    }

    #[test]
    fn crc_format() {
        let mut h = Hash::new();
        h.set_crc32("CRC", 0xdeadbeef);
        assert_eq!(h.get_value("CRC"), Some("0xdeadbeef"));
        assert_eq!(h.get_crc32("CRC"), Some(0xdeadbeef));
    }

    #[test]
    fn file_round_trip() {
        let dir = std::env::temp_dir().join(format!("scr-hash-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.scrinfo");

        let mut h = Hash::new();
        h.set_kv("NODES", "4");
        h.write(&path).unwrap();
        assert_eq!(Hash::read(&path).unwrap(), h);

        let mut locked = Hash::lock_open_read(&path).unwrap();
        locked.hash.set_value("NODES", "8");
        locked.write_close_unlock().unwrap();
        assert_eq!(Hash::read_with_lock(&path).unwrap().get_u64("NODES"), Some(8));

        assert!(Hash::read(dir.join("missing")).is_err());
        assert!(Hash::read_or_default(dir.join("missing")).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
