//! Redundancy encoders: LOCAL, PARTNER and the XOR reduce-scatter.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{format_err, Error};

use scr_api_types::{CheckpointId, CopyType, FileKind};
use scr_cache::{meta, Filemap, Meta};
use scr_comm::{alltrue, Communicator, ReduceOp};
use scr_hash::Hash;

use crate::cache::{self, checkpoint_dir};
use crate::context::Context;
use crate::descriptor::CkptDesc;
use crate::exchange::sendrecv_hash;
use crate::fileio::{self, LogicalFileSet};
use crate::swap::{self, SwapMode};

pub const KEY_RANKS: &str = "RANKS";
pub const KEY_GROUP: &str = "GROUP";
pub const KEY_GROUP_RANK: &str = "RANK";
pub const KEY_CKPT: &str = "CKPT";
pub const KEY_CHUNK: &str = "CHUNK";
pub const KEY_CURRENT: &str = "CURRENT";
pub const KEY_PARTNER: &str = "PARTNER";
pub const KEY_RANK: &str = "RANK";
pub const KEY_FILES: &str = "FILES";
pub const KEY_FILE: &str = "FILE";

pub const FILEMAP_TAG_PARTNER: &str = "PARTNER";

/// Parity chunk path for one group member.
pub fn xor_chunk_path(dir: &Path, group_rank: usize, group_size: usize, group_id: usize) -> PathBuf {
    dir.join(format!("{}_of_{}_in_{}.xor", group_rank + 1, group_size, group_id))
}

/// A parity chunk starts with a length-prefixed header hash; the raw parity
/// payload follows.
pub fn write_xor_header(fd: &mut File, header: &Hash) -> Result<(), Error> {
    let bytes = header.to_bytes();
    fd.write_all(&(bytes.len() as u64).to_le_bytes())?;
    fd.write_all(&bytes)?;
    Ok(())
}

/// Read the header hash, leaving the descriptor positioned at the first
/// payload byte. Returns the header and the payload offset.
pub fn read_xor_header(fd: &mut File) -> Result<(Hash, u64), Error> {
    fd.seek(SeekFrom::Start(0))?;
    let mut len_bytes = [0u8; 8];
    fd.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    let mut bytes = vec![0u8; len as usize];
    fd.read_exact(&mut bytes)?;
    Ok((Hash::from_bytes(&bytes)?, 8 + len))
}

/// Record the world size and the group-rank to world-rank mapping.
fn xor_header_set_ranks(header: &mut Hash, comm: &dyn Communicator, ranks_world: usize) {
    header.unset(KEY_RANKS);
    header.unset(KEY_GROUP);
    header.set_value_u64(KEY_RANKS, ranks_world as u64);
    let group = header.set(KEY_GROUP);
    group.set_value_u64(KEY_RANKS, comm.size() as u64);
    for i in 0..comm.size() {
        group
            .set(KEY_GROUP_RANK)
            .set_value(i.to_string(), comm.global_rank(i).to_string());
    }
}

/// Group-rank to world-rank mapping recorded by [`xor_header_set_ranks`].
pub fn xor_header_group_map(header: &Hash) -> Result<Vec<usize>, Error> {
    let group = header
        .get(KEY_GROUP)
        .ok_or_else(|| format_err!("chunk header lacks group info"))?;
    let ranks = group
        .get_u64(KEY_RANKS)
        .ok_or_else(|| format_err!("chunk header lacks group size"))? as usize;
    let mut map = Vec::with_capacity(ranks);
    for i in 0..ranks {
        let world = group
            .get(KEY_GROUP_RANK)
            .and_then(|h| h.get_u64(&i.to_string()))
            .ok_or_else(|| format_err!("chunk header lacks world rank of member {}", i))?;
        map.push(world as usize);
    }
    Ok(map)
}

/// Apply the redundancy scheme for a checkpoint; returns the collective
/// commit decision and the total bytes examined across the world.
pub fn copy_files(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
) -> Result<(bool, f64), Error> {
    let my_rank = ctx.my_rank_world();

    // scan for invalid files before spending any bandwidth
    let mut valid = true;
    let mut my_bytes = 0.0;
    for file in map.list_files(id, my_rank) {
        if !cache::bool_have_file(id, my_rank, ctx.ranks_world(), &file) {
            log::debug!("file determined to be invalid: {:?}", file);
            valid = false;
        }
        my_bytes += fileio::file_size(&file).unwrap_or(0) as f64;

        // PARTNER computes the crc inline during the copy
        if ctx.config.crc_on_copy && desc.copy_type != CopyType::Partner {
            if let Err(err) = meta::compute_crc(&file, ctx.config.file_buf_size) {
                log::error!("crc computation failed for {:?} - {}", file, err);
                valid = false;
            }
        }
    }

    if !alltrue(ctx.world.as_ref(), valid)? {
        if my_rank == 0 {
            log::warn!("skipping redundancy encode, one or more checkpoint files is invalid");
        }
        return Ok((false, 0.0));
    }

    let start = Instant::now();

    let ok = match desc.copy_type {
        CopyType::Local => true,
        CopyType::Partner => copy_partner(ctx, map, desc, id)?,
        CopyType::Xor => copy_xor(ctx, map, desc, id)?,
    };

    // remember the final count, needed to tell "wrote 0 files" from
    // "don't know"
    let num_files = map.num_files(id, my_rank);
    map.set_expected_files(id, my_rank, num_files);
    map.write(&ctx.map_file)?;

    if !ok {
        log::error!("redundancy encode failed for checkpoint {}", id);
    }
    let all_ok = alltrue(ctx.world.as_ref(), ok)?;

    let total_bytes = ctx.world.allreduce_f64_sum(my_bytes)?;

    if my_rank == 0 {
        let secs = start.elapsed().as_secs_f64();
        let mb_per_s = if secs > 0.0 {
            total_bytes / (1024.0 * 1024.0 * secs)
        } else {
            0.0
        };
        log::info!(
            "encoded checkpoint {}: {:.3} secs, {:.0} bytes, {:.2} MB/s",
            id,
            secs,
            total_bytes,
            mb_per_s
        );
    }

    Ok((all_ok, total_bytes))
}

/// PARTNER: push a full copy of every file to the right neighbor; record
/// bookkeeping for the left neighbor's incoming copy before any byte lands.
fn copy_partner(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
) -> Result<bool, Error> {
    let comm = desc.comm.as_ref();
    let files = map.list_files(id, ctx.my_rank_world());

    // how many files will cross in each direction
    let send_num = files.len() as u64;
    let recv_num = comm
        .sendrecv(
            Some((desc.rhs_rank, &send_num.to_le_bytes())),
            Some(desc.lhs_rank),
        )?
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .unwrap_or(0);

    map.set_expected_files(id, desc.lhs_rank_world, recv_num as usize);
    // the drain path needs to know which node holds the copy
    map.set_tag(id, desc.lhs_rank_world, FILEMAP_TAG_PARTNER, &desc.lhs_hostname);

    let my_desc_hash = desc.store_to_hash();
    let lhs_desc = sendrecv_hash(comm, Some((desc.rhs_rank, &my_desc_hash)), Some(desc.lhs_rank))?
        .unwrap_or_default();
    map.set_desc(id, desc.lhs_rank_world, lhs_desc);

    map.write(&ctx.map_file)?;

    let ckpt_dir = checkpoint_dir(desc, id);

    let mut ok = true;
    let mut send_left = send_num as usize;
    let mut recv_left = recv_num as usize;
    while send_left > 0 || recv_left > 0 {
        let mut send_rank = None;
        let mut file: Option<&Path> = None;
        if send_left > 0 {
            file = Some(files[files.len() - send_left].as_path());
            send_rank = Some(desc.rhs_rank);
            send_left -= 1;
        }

        let mut recv_rank = None;
        if recv_left > 0 {
            recv_rank = Some(desc.lhs_rank);
            recv_left -= 1;
        }

        let file_partner =
            swap::swap_file_names(comm, file, send_rank, recv_rank, Some(&ckpt_dir))?;

        if let Some(partner) = &file_partner {
            map.add_file(id, desc.lhs_rank_world, partner);
            map.write(&ctx.map_file)?;
        }

        if !swap::swap_files(
            ctx,
            comm,
            SwapMode::Copy,
            file,
            send_rank,
            file_partner.as_deref(),
            recv_rank,
        )? {
            ok = false;
        }
    }

    Ok(ok)
}

/// XOR: reduce-scatter one parity chunk per member across the set.
fn copy_xor(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
) -> Result<bool, Error> {
    let comm = desc.comm.as_ref();
    let my_rank = ctx.my_rank_world();
    let mut ok = true;

    // record the left neighbor's descriptor so a restart can find the set
    // even if that node is gone
    let my_desc_hash = desc.store_to_hash();
    let lhs_desc = sendrecv_hash(comm, Some((desc.rhs_rank, &my_desc_hash)), Some(desc.lhs_rank))?
        .unwrap_or_default();
    map.set_desc(id, desc.lhs_rank_world, lhs_desc);

    let mut header = Hash::new();
    xor_header_set_ranks(&mut header, comm, ctx.ranks_world());
    header.set_value_u64(KEY_CKPT, id);

    // size up my logical file set and collect sidecars for the header
    let files = map.list_files(id, my_rank);
    let mut paths = Vec::with_capacity(files.len());
    let mut current_files = Hash::new();
    let mut my_bytes: u64 = 0;
    for (i, file) in files.iter().enumerate() {
        let size = fileio::file_size(file)?;
        my_bytes += size;
        let file_meta = Meta::read(file)?;
        current_files.set_hash(i.to_string(), file_meta.to_hash());
        paths.push((file.clone(), size));
    }

    let mut current_hash = Hash::new();
    current_hash.set_value_u64(KEY_RANK, my_rank as u64);
    current_hash.set_value_u64(KEY_FILES, files.len() as u64);
    current_hash.set_hash(KEY_FILE, current_files);

    let partner_hash =
        sendrecv_hash(comm, Some((desc.rhs_rank, &current_hash)), Some(desc.lhs_rank))?
            .unwrap_or_default();
    header.set_hash(KEY_CURRENT, current_hash);
    header.set_hash(KEY_PARTNER, partner_hash);

    let max_bytes = comm.allreduce_i64(my_bytes as i64, ReduceOp::Max)? as u64;

    // if the payload doesn't divide evenly, round the chunk up one byte
    let mut chunk_size = max_bytes / (desc.ranks as u64 - 1);
    if (desc.ranks as u64 - 1) * chunk_size < max_bytes {
        chunk_size += 1;
    }
    if chunk_size == 0 {
        chunk_size += 1;
    }
    header.set_value_u64(KEY_CHUNK, chunk_size);

    let ckpt_dir = checkpoint_dir(desc, id);
    let chunk_file = xor_chunk_path(&ckpt_dir, desc.my_rank, desc.ranks, desc.group_id);

    // the chunk enters the filemap before it exists on disk
    map.add_file(id, my_rank, &chunk_file);
    map.write(&ctx.map_file)?;

    let mut fd_chunk = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&chunk_file)
        .unwrap_or_else(|err| {
            ctx.abort(&format!(
                "opening parity chunk for writing: {:?} - {}",
                chunk_file, err
            ))
        });
    write_xor_header(&mut fd_chunk, &header)?;

    let mut logical = LogicalFileSet::open_read(&paths)?;
    let buf_size = ctx.mpi_buf_size();
    let mut send_buf = vec![0u8; buf_size];

    // XOR reduce-scatter around the ring
    let mut nread: u64 = 0;
    while nread < chunk_size {
        let count = ((chunk_size - nread) as usize).min(buf_size);

        let mut recv_data: Option<Vec<u8>> = None;
        for chunk_id in (0..desc.ranks).rev() {
            if chunk_id > 0 {
                let mut chunk_id_rel = (desc.my_rank + desc.ranks + chunk_id) % desc.ranks;
                if chunk_id_rel > desc.my_rank {
                    chunk_id_rel -= 1;
                }
                let offset = chunk_size * chunk_id_rel as u64 + nread;
                if let Err(err) = logical.read_pad(&mut send_buf[..count], offset) {
                    log::error!("stripe read failed - {}", err);
                    ok = false;
                }
            } else {
                send_buf[..count].fill(0);
            }

            if chunk_id < desc.ranks - 1 {
                let recv = recv_data.as_ref().expect("pipeline buffer missing");
                for i in 0..count {
                    send_buf[i] ^= recv[i];
                }
            }

            if chunk_id > 0 {
                // forward the partial reduction and take the next one
                recv_data = comm
                    .sendrecv(Some((desc.rhs_rank, &send_buf[..count])), Some(desc.lhs_rank))?;
            } else if let Err(err) = fd_chunk.write_all(&send_buf[..count]) {
                log::error!("writing parity chunk {:?} failed - {}", chunk_file, err);
                ok = false;
            }
        }

        nread += count as u64;
    }

    nix::unistd::fsync(fd_chunk.as_raw_fd())
        .map_err(|err| format_err!("fsync of {:?} failed - {}", chunk_file, err))?;
    drop(fd_chunk);

    let chunk_size_on_disk = fileio::file_size(&chunk_file)?;
    let chunk_meta = Meta::new(
        &chunk_file,
        FileKind::Xor,
        chunk_size_on_disk,
        id,
        my_rank,
        ctx.ranks_world(),
        true,
    );
    chunk_meta.write(&chunk_file)?;

    if ctx.config.crc_on_copy {
        meta::compute_crc(&chunk_file, ctx.config.file_buf_size)?;
    }

    Ok(ok)
}
