//! Halt file: the channel through which operator tooling asks a running job
//! to stop at the next opportunity.
//!
//! The file is shared between the library and external tools, so every
//! read-modify-write cycle happens under the advisory lock.

use std::path::{Path, PathBuf};

use anyhow::Error;

use scr_hash::Hash;

pub const KEY_SECONDS: &str = "SECONDS";
pub const KEY_EXIT_REASON: &str = "EXIT_REASON";
pub const KEY_CHECKPOINTS: &str = "CHECKPOINTS";
pub const KEY_EXIT_BEFORE: &str = "EXIT_BEFORE";
pub const KEY_EXIT_AFTER: &str = "EXIT_AFTER";

const KEYS: &[&str] = &[
    KEY_SECONDS,
    KEY_EXIT_REASON,
    KEY_CHECKPOINTS,
    KEY_EXIT_BEFORE,
    KEY_EXIT_AFTER,
];

pub struct HaltFile {
    path: PathBuf,
}

impl HaltFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge the on-disk halt values into `halt` (the file wins, since the
    /// operator may have updated it), decrement the checkpoints-left counter
    /// by `decrement`, and write the result back. The lock is held across
    /// the whole cycle.
    pub fn sync_and_decrement(&self, halt: &mut Hash, decrement: u64) -> Result<(), Error> {
        let mut locked = Hash::lock_open_read(&self.path)?;

        for key in KEYS {
            if let Some(value) = locked.hash.get_value(key) {
                let value = value.to_owned();
                halt.set_value(*key, value);
            }
        }

        if decrement > 0 {
            if let Some(left) = halt.get_u64(KEY_CHECKPOINTS) {
                halt.set_value_u64(KEY_CHECKPOINTS, left.saturating_sub(decrement));
            }
        }

        locked.hash = halt.clone();
        locked.write_close_unlock()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operator_values_win_and_counter_decrements() {
        let dir = std::env::temp_dir().join(format!("scr-haltfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let hf = HaltFile::new(dir.join("halt.scrinfo"));

        let mut halt = Hash::new();
        halt.set_value_u64(KEY_SECONDS, 600);
        hf.sync_and_decrement(&mut halt, 0).unwrap();

        // operator writes a reason and a checkpoint budget
        let mut locked = Hash::lock_open_read(hf.path()).unwrap();
        locked.hash.set_value(KEY_EXIT_REASON, "MAINTENANCE");
        locked.hash.set_value_u64(KEY_CHECKPOINTS, 2);
        locked.write_close_unlock().unwrap();

        hf.sync_and_decrement(&mut halt, 1).unwrap();
        assert_eq!(halt.get_value(KEY_EXIT_REASON), Some("MAINTENANCE"));
        assert_eq!(halt.get_u64(KEY_CHECKPOINTS), Some(1));
        assert_eq!(halt.get_u64(KEY_SECONDS), Some(600));

        hf.sync_and_decrement(&mut halt, 1).unwrap();
        hf.sync_and_decrement(&mut halt, 1).unwrap();
        assert_eq!(halt.get_u64(KEY_CHECKPOINTS), Some(0));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
