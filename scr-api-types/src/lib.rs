//! Shared plain types for the scr checkpoint/restart library.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Monotonically increasing checkpoint id, assigned at `start_checkpoint`.
///
/// Strictly increases within a run and is never reused.
pub type CheckpointId = u64;

/// Rank of one participating process in the fixed-size world group.
pub type Rank = usize;

/// Version number written into `summary.scr` blobs.
pub const SUMMARY_FILE_VERSION: u64 = 5;

/// Name of the summary blob inside a PFS checkpoint directory.
pub const SUMMARY_FILE_NAME: &str = "summary.scr";

/// Name of the legacy (version 4 and earlier) textual summary file.
pub const SUMMARY_FILE_NAME_V4: &str = "scr_summary.txt";

/// Symbolic link under the prefix pointing at the most recently flushed
/// checkpoint directory.
pub const CURRENT_LINK: &str = "scr.current";

/// Catalog of flushed checkpoint directories under the prefix.
pub const INDEX_FILE_NAME: &str = "index";

pub const HALT_FILE_NAME: &str = "halt.scrinfo";
pub const FLUSH_FILE_NAME: &str = "flush.scrinfo";
pub const NODES_FILE_NAME: &str = "nodes.scrinfo";
pub const MASTER_FILEMAP_NAME: &str = "filemap.scrinfo";
pub const TRANSFER_FILE_NAME: &str = "transfer.scrinfo";

/// Suffix appended to a data file name to form its sidecar metadata file.
pub const META_FILE_SUFFIX: &str = ".scr";

lazy_static! {
    /// Parity chunk files: `<group_rank+1>_of_<group_size>_in_<group_id>.xor`
    pub static ref XOR_CHUNK_FILE_REGEX: Regex =
        Regex::new(r"^(\d+)_of_(\d+)_in_(\d+)\.xor$").unwrap();

    /// Cache subdirectories: `checkpoint.<id>`
    pub static ref CHECKPOINT_DIR_REGEX: Regex =
        Regex::new(r"^checkpoint\.(\d+)$").unwrap();

    /// PFS checkpoint directories: `scr.<timestamp>.<jobid>.<id>`
    pub static ref PFS_DIR_REGEX: Regex =
        Regex::new(r"^scr\..+\..+\.(\d+)$").unwrap();
}

/// Redundancy scheme applied to a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CopyType {
    /// Files stay on the local node only.
    Local,
    /// Each rank keeps a full copy of a neighbor's files.
    Partner,
    /// XOR reduce-scatter parity across a set of ranks.
    Xor,
}

impl CopyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyType::Local => "LOCAL",
            CopyType::Partner => "PARTNER",
            CopyType::Xor => "XOR",
        }
    }
}

impl fmt::Display for CopyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CopyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_uppercase().as_str() {
            "LOCAL" => Ok(CopyType::Local),
            "PARTNER" => Ok(CopyType::Partner),
            "XOR" => Ok(CopyType::Xor),
            _ => bail!("unknown copy type '{}'", s),
        }
    }
}

/// File kind recorded in sidecar metadata.
///
/// Parity chunks are tagged `Xor` so the flush pipeline can skip them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileKind {
    Full,
    Xor,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Full => "FULL",
            FileKind::Xor => "XOR",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "FULL" => Ok(FileKind::Full),
            "XOR" => Ok(FileKind::Xor),
            _ => bail!("unknown file kind '{}'", s),
        }
    }
}

/// Where a checkpoint currently lives; a checkpoint may hold several
/// locations at once (e.g. `CACHE` and `FLUSHING` during an async flush).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlushLocation {
    Cache,
    Pfs,
    Flushing,
}

impl FlushLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushLocation::Cache => "CACHE",
            FlushLocation::Pfs => "PFS",
            FlushLocation::Flushing => "FLUSHING",
        }
    }
}

impl fmt::Display for FlushLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn copy_type_round_trip() {
        for ty in [CopyType::Local, CopyType::Partner, CopyType::Xor] {
            assert_eq!(ty, ty.as_str().parse::<CopyType>().unwrap());
        }
        assert_eq!("xor".parse::<CopyType>().unwrap(), CopyType::Xor);
        assert!("RAID5".parse::<CopyType>().is_err());
    }

    #[test]
    fn xor_chunk_regex() {
        let caps = XOR_CHUNK_FILE_REGEX.captures("3_of_4_in_8.xor").unwrap();
        assert_eq!(&caps[1], "3");
        assert_eq!(&caps[2], "4");
        assert_eq!(&caps[3], "8");
        assert!(!XOR_CHUNK_FILE_REGEX.is_match("rank_0_a"));
    }
}
