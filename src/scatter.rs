//! Restart-time filemap scatter: the node master folds every shard filemap
//! left behind by the previous run into one aggregate, hands each current
//! resident its own slice, and load balances whatever belongs to ranks that
//! no longer live here.

use std::collections::HashMap;

use anyhow::Error;

use scr_cache::Filemap;
use scr_comm::Communicator;
use scr_hash::Hash;

use crate::context::Context;
use crate::exchange::exchange_hashes;

const KEY_FILEMAP: &str = "Filemap";

pub fn scatter_filemaps(ctx: &Context, my_map: &mut Filemap) -> Result<(), Error> {
    let mut send: HashMap<usize, Hash> = HashMap::new();

    if ctx.am_node_master() {
        // fold all shards named by the master filemap into one aggregate
        let mut all_map = Filemap::new();
        let master = Hash::read_or_default(&ctx.master_map_file)?;
        if let Some(shards) = master.get(KEY_FILEMAP) {
            for file in shards.keys() {
                let shard = Filemap::read(file)?;
                all_map.merge(&shard);
                if let Err(err) = std::fs::remove_file(file) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("failed to remove filemap shard {:?} - {}", file, err);
                    }
                }
            }
        }

        // keep the aggregate on disk until the scatter lands
        if all_map.num_ranks() > 0 {
            all_map.write(&ctx.map_file)?;
        }

        // which world ranks live on this node now?
        let gathered = ctx
            .local
            .gather(0, &(ctx.my_rank_world() as u64).to_le_bytes())?
            .expect("gather at root returned nothing");
        let resident_ranks: Vec<usize> = gathered
            .into_iter()
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()) as usize)
            .collect();

        // residents get their own files back
        for (local_rank, world_rank) in resident_ranks.iter().enumerate() {
            if all_map.have_rank(*world_rank) {
                let slice = all_map.extract_rank(*world_rank);
                send.entry(local_rank)
                    .or_insert_with(Hash::new)
                    .merge(slice.as_hash());
            }
        }

        // round robin the survivors' leftovers across the residents
        let leftover = all_map.list_ranks();
        for (j, rank) in leftover.into_iter().enumerate() {
            let local_rank = j % ctx.local.size();
            let slice = all_map.extract_rank(rank);
            send.entry(local_rank)
                .or_insert_with(Hash::new)
                .merge(slice.as_hash());
        }

        // write the new master filemap naming one shard per resident
        let mut master = Hash::new();
        for local_rank in 0..ctx.local.size() {
            let shard = ctx
                .cntl_prefix
                .join(format!("filemap_{}.scrinfo", local_rank));
            master.set_kv(KEY_FILEMAP, shard.to_string_lossy());
        }
        master.write(&ctx.master_map_file)?;
    } else {
        ctx.local
            .gather(0, &(ctx.my_rank_world() as u64).to_le_bytes())?;
    }

    // every resident merges the shard the master addressed to it
    let received = exchange_hashes(ctx.local.as_ref(), &send)?;
    if let Some(from_master) = received.get(&0) {
        my_map.merge(&Filemap::from_hash(from_master.clone()));
    }

    if my_map.num_ranks() > 0 {
        my_map.write(&ctx.map_file)?;
    }

    Ok(())
}
