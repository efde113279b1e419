//! Restart-time file distribution: re-home cached files to whatever rank
//! owns them under the current process-to-node mapping.
//!
//! Owners announce, per round, which rank's files they could send; every
//! rank picks the earliest round in which somebody offers its files; the
//! rounds then run MOVE-mode swaps so no node ever needs space for two
//! copies.

use std::collections::HashMap;

use anyhow::Error;

use scr_api_types::{CheckpointId, CopyType};
use scr_cache::Filemap;
use scr_comm::{alltrue, Communicator, ReduceOp};
use scr_hash::Hash;

use crate::cache::{self, checkpoint_dir};
use crate::context::Context;
use crate::descriptor::CkptDesc;
use crate::exchange::exchange_hashes;
use crate::swap::{self, SwapMode};

/// Re-home the redundancy descriptors for a checkpoint: whoever holds a
/// rank's descriptor hash sends it over; everyone then rebuilds the
/// (collective) descriptor from the copy now in its own filemap.
pub fn distribute_ckptdescs(
    ctx: &Context,
    map: &mut Filemap,
    id: CheckpointId,
) -> Result<Option<CkptDesc>, Error> {
    let mut send: HashMap<usize, Hash> = HashMap::new();
    let mut invalid_rank_found = false;

    for rank in map.list_ranks_by_checkpoint(id) {
        if rank >= ctx.ranks_world() {
            log::error!("invalid rank id {} in world of {}", rank, ctx.ranks_world());
            invalid_rank_found = true;
            continue;
        }
        if let Some(desc) = map.get_desc(id, rank) {
            send.insert(rank, desc);
        }
    }

    if !alltrue(ctx.world.as_ref(), !invalid_rank_found)? {
        return Ok(None);
    }

    let received = exchange_hashes(ctx.world.as_ref(), &send)?;

    if !alltrue(ctx.world.as_ref(), !received.is_empty())? {
        log::debug!("cannot find a process holding my checkpoint descriptor");
        return Ok(None);
    }

    // all copies describe the same redundancy instance; any will do
    let desc_hash = received.values().next().expect("nonempty map").clone();
    map.set_desc(id, ctx.my_rank_world(), desc_hash);
    map.write(&ctx.map_file)?;

    let desc = CkptDesc::create_from_filemap(ctx, map, id, ctx.my_rank_world())?;

    // re-store the rebuilt descriptor so the recorded base and directory
    // reflect this node's view of the cache
    map.set_desc(id, ctx.my_rank_world(), desc.store_to_hash());
    map.write(&ctx.map_file)?;

    Ok(Some(desc))
}

/// Move every cached file of checkpoint `id` to the rank that owns it now.
/// Returns whether the transfers themselves completed; it does not promise
/// everyone ended up with a full set (XOR may still rebuild).
pub fn distribute_files(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
) -> Result<bool, Error> {
    let my_rank = ctx.my_rank_world();
    let mut ok = true;

    // drop broken sets before moving anything
    cache::clean_files(ctx, map)?;

    let ranks = map.list_ranks_by_checkpoint(id);
    let nranks = ranks.len();

    // start sending from the first owned rank at or above our own; this
    // offset spreads senders across the rounds
    let mut start_index = 0;
    let mut invalid_rank_found = false;
    for (i, &rank) in ranks.iter().enumerate().rev() {
        if rank >= my_rank {
            start_index = i;
        }
        if rank >= ctx.ranks_world() {
            log::error!("invalid rank id {} in world of {}", rank, ctx.ranks_world());
            invalid_rank_found = true;
        }
    }

    if !alltrue(ctx.world.as_ref(), !invalid_rank_found)? {
        return Ok(false);
    }

    // announce, for each rank we fully hold, the round we could send in
    let mut have_rank_by_round = vec![0usize; nranks];
    let mut send_flag_by_round = vec![false; nranks];
    let mut send: HashMap<usize, Hash> = HashMap::new();
    for round in 0..nranks {
        let index = (start_index + round) % nranks;
        let rank = ranks[index];
        have_rank_by_round[round] = rank;

        if cache::bool_have_files(ctx, map, id, rank) {
            let mut hash = Hash::new();
            hash.set(round.to_string());
            send.insert(rank, hash);
        }
    }
    let received = exchange_hashes(ctx.world.as_ref(), &send)?;

    // earliest offer wins
    let mut retrieve_rank: Option<usize> = None;
    let mut retrieve_round: i64 = -1;
    for (rank, hash) in &received {
        if let Some(round) = hash.first_key().and_then(|k| k.parse::<i64>().ok()) {
            if retrieve_round == -1 || round < retrieve_round {
                retrieve_round = round;
                retrieve_rank = Some(*rank);
            }
        }
    }

    // without XOR there is no way to recover a rank nobody offers
    let can_get_files = retrieve_rank.is_some();
    if desc.copy_type != CopyType::Xor && !alltrue(ctx.world.as_ref(), can_get_files)? {
        if !can_get_files {
            log::debug!("cannot find a process holding my checkpoint files");
        }
        return Ok(false);
    }

    let max_rounds = ctx.world.allreduce_i64(retrieve_round, ReduceOp::Max)?;

    // tell the chosen owner which round we come calling
    let mut send: HashMap<usize, Hash> = HashMap::new();
    if let Some(rank) = retrieve_rank {
        let mut hash = Hash::new();
        hash.set(retrieve_round.to_string());
        send.insert(rank, hash);
    }
    let received = exchange_hashes(ctx.world.as_ref(), &send)?;
    for hash in received.values() {
        if let Some(round) = hash.first_key().and_then(|k| k.parse::<usize>().ok()) {
            if round < nranks {
                send_flag_by_round[round] = true;
            }
        }
    }

    let ckpt_dir = checkpoint_dir(desc, id);

    let last_round = if max_rounds >= 0 { max_rounds as usize } else { 0 };
    for round in 0..=last_round {
        if max_rounds < 0 {
            break;
        }
        let mut send_rank: Option<usize> = None;
        let mut send_num = 0usize;

        if round < nranks && send_flag_by_round[round] {
            let dst = have_rank_by_round[round];
            send_rank = Some(dst);
            send_num = map.num_files(id, dst);
        }

        let mut recv_rank: Option<usize> = None;
        if retrieve_round == round as i64 {
            recv_rank = retrieve_rank;
        }

        if send_rank == Some(my_rank) {
            // my own files, just rename them into place
            for file in map.list_files(id, my_rank) {
                let name = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
                let newfile = ckpt_dir.join(&name);
                if newfile != file {
                    map.add_file(id, my_rank, &newfile);
                    map.write(&ctx.map_file)?;

                    log::debug!("round {}: rename {:?} -> {:?}", round, file, newfile);
                    if let Err(err) = std::fs::rename(&file, &newfile) {
                        log::error!("moving checkpoint file {:?} failed - {}", file, err);
                        ok = false;
                    }
                    let meta_old = scr_cache::meta::meta_path(&file);
                    let meta_new = scr_cache::meta::meta_path(&newfile);
                    if let Err(err) = std::fs::rename(&meta_old, &meta_new) {
                        log::error!("moving sidecar {:?} failed - {}", meta_old, err);
                        ok = false;
                    }

                    map.remove_file(id, my_rank, &file);
                    map.write(&ctx.map_file)?;
                }
            }
        } else {
            // files we hold for a rank nobody asked about are dead weight
            if round < nranks && send_rank.is_none() {
                let dst = have_rank_by_round[round];
                cache::unlink_rank(ctx, map, id, dst)?;
            }

            if send_rank.is_some() || recv_rank.is_some() {
                let filemap_send_rank = send_rank;

                // trade file counts first
                let send_bytes = (send_num as u64).to_le_bytes();
                let recv_num = ctx
                    .world
                    .sendrecv(
                        send_rank.map(|r| (r, &send_bytes[..])),
                        recv_rank,
                    )?
                    .map(|b| u64::from_le_bytes(b.try_into().unwrap()) as usize)
                    .unwrap_or(0);

                let mut recv_left = recv_num;
                if recv_rank.is_some() {
                    map.set_expected_files(id, my_rank, recv_num);
                }

                let mut send_left = send_num;
                let mut send_rank = send_rank;
                let mut recv_rank = recv_rank;
                if send_left == 0 {
                    send_rank = None;
                }
                if recv_left == 0 {
                    recv_rank = None;
                }

                let files = match send_rank {
                    Some(_) => map.list_files(id, filemap_send_rank.unwrap()),
                    None => Vec::new(),
                };
                let numfiles = files.len();

                while send_rank.is_some() || recv_rank.is_some() {
                    let file = send_rank.map(|_| files[numfiles - send_left].clone());

                    let file_partner = swap::swap_file_names(
                        ctx.world.as_ref(),
                        file.as_deref(),
                        send_rank,
                        recv_rank,
                        Some(&ckpt_dir),
                    )?;

                    if let Some(partner) = &file_partner {
                        map.add_file(id, my_rank, partner);
                        map.write(&ctx.map_file)?;
                    }

                    if !swap::swap_files(
                        ctx,
                        ctx.world.as_ref(),
                        SwapMode::Move,
                        file.as_deref(),
                        send_rank,
                        file_partner.as_deref(),
                        recv_rank,
                    )? {
                        log::error!(
                            "swapping checkpoint files failed (to {:?}, from {:?})",
                            send_rank,
                            recv_rank
                        );
                        ok = false;
                    }

                    if let Some(file) = &file {
                        map.remove_file(id, filemap_send_rank.unwrap(), file);
                        map.write(&ctx.map_file)?;
                    }

                    if recv_rank.is_some() {
                        recv_left -= 1;
                        if recv_left == 0 {
                            recv_rank = None;
                        }
                    }
                    if send_rank.is_some() {
                        send_left -= 1;
                        if send_left == 0 {
                            send_rank = None;
                        }
                    }
                }

                if let Some(dst) = filemap_send_rank {
                    map.remove_rank_by_checkpoint(id, dst);
                    map.write(&ctx.map_file)?;
                }
            }
        }
    }

    // anything scheduled past the last active round is unwanted
    let first_dead = (max_rounds + 1).max(0) as usize;
    for round in first_dead..nranks {
        let dst = have_rank_by_round[round];
        cache::unlink_rank(ctx, map, id, dst)?;
    }

    map.write(&ctx.map_file)?;

    // drop anything the moves left half-formed
    cache::clean_files(ctx, map)?;

    Ok(ok)
}
