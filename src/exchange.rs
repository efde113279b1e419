//! Hash payloads over the communicator.
//!
//! Every wire exchange in the library is a serialized [`Hash`]; these
//! helpers wrap the byte-level primitives of [`Communicator`].

use std::collections::{BTreeMap, HashMap};

use anyhow::Error;

use scr_comm::Communicator;
use scr_hash::Hash;

pub fn send_hash(comm: &dyn Communicator, dest: usize, hash: &Hash) -> Result<(), Error> {
    comm.send(dest, &hash.to_bytes())
}

pub fn recv_hash(comm: &dyn Communicator, src: usize) -> Result<Hash, Error> {
    Hash::from_bytes(&comm.recv(src)?)
}

/// Pairwise hash exchange; either side may be absent. An absent sender still
/// transmits an empty hash so the receiving side always completes.
pub fn sendrecv_hash(
    comm: &dyn Communicator,
    send: Option<(usize, &Hash)>,
    recv_from: Option<usize>,
) -> Result<Option<Hash>, Error> {
    let empty = Hash::new();
    let (dest, hash) = match send {
        Some((dest, hash)) => (Some(dest), hash),
        None => (None, &empty),
    };
    let bytes = hash.to_bytes();
    let received = comm.sendrecv(dest.map(|d| (d, bytes.as_slice())), recv_from)?;
    received.map(|data| Hash::from_bytes(&data)).transpose()
}

pub fn bcast_hash(comm: &dyn Communicator, root: usize, hash: Option<&Hash>) -> Result<Hash, Error> {
    let bytes = match hash {
        Some(h) => h.to_bytes(),
        None => Vec::new(),
    };
    Hash::from_bytes(&comm.bcast(root, bytes)?)
}

/// Sparse all-to-all of hashes: each rank offers a payload for zero or more
/// destinations and receives whatever the others addressed to it. Absent
/// payloads travel as empty hashes and are dropped on receive.
pub fn exchange_hashes(
    comm: &dyn Communicator,
    send: &HashMap<usize, Hash>,
) -> Result<BTreeMap<usize, Hash>, Error> {
    let empty = Hash::new().to_bytes();
    for dest in 0..comm.size() {
        match send.get(&dest) {
            Some(hash) => comm.send(dest, &hash.to_bytes())?,
            None => comm.send(dest, &empty)?,
        }
    }

    let mut received = BTreeMap::new();
    for src in 0..comm.size() {
        let hash = Hash::from_bytes(&comm.recv(src)?)?;
        if !hash.is_empty() {
            received.insert(src, hash);
        }
    }
    Ok(received)
}
