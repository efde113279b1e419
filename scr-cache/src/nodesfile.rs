//! Nodes file: records how many nodes the current run spans.

use std::path::Path;

use anyhow::Error;

use scr_hash::Hash;

const KEY_NODES: &str = "NODES";

pub fn write(path: &Path, nodes: u64) -> Result<(), Error> {
    let mut hash = Hash::new();
    hash.set_value_u64(KEY_NODES, nodes);
    hash.write(path)
}

pub fn read(path: &Path) -> Result<Option<u64>, Error> {
    Ok(Hash::read_or_default(path)?.get_u64(KEY_NODES))
}
