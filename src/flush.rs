//! Synchronous flush: drain a cached checkpoint to the parallel file
//! system, write its summary, advance the current link.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{format_err, Error};

use scr_api_types::{CheckpointId, FileKind, FlushLocation, CURRENT_LINK};
use scr_cache::{meta, Filemap, FlushFile, Meta};
use scr_comm::{alltrue, Communicator};
use scr_hash::Hash;

use crate::context::Context;
use crate::exchange::{recv_hash, send_hash};
use crate::fileio;
use crate::index::Index;
use crate::summary;

/// Parity chunks stay in cache; everything else flushes.
pub fn bool_flush_file(file: &Path) -> bool {
    match Meta::read(file) {
        Ok(meta) => meta.kind != FileKind::Xor,
        Err(_) => true,
    }
}

/// Collective need-flush test: the node master consults the flush file and
/// the answer is shared with the local peers.
pub fn need_flush(ctx: &Context, id: CheckpointId) -> Result<bool, Error> {
    let need = if ctx.am_node_master() {
        FlushFile::new(&ctx.flush_file).need_flush(id)? as i64
    } else {
        0
    };
    let need = ctx.local.bcast(0, need.to_le_bytes().to_vec())?;
    Ok(i64::from_le_bytes(need.try_into().unwrap()) != 0)
}

/// Whether any node still has `id` marked FLUSHING.
pub fn is_flushing(ctx: &Context, id: CheckpointId) -> Result<bool, Error> {
    let flushing = if ctx.am_node_master() {
        FlushFile::new(&ctx.flush_file).location_test(id, FlushLocation::Flushing)?
    } else {
        false
    };
    // one node flushing means the checkpoint is flushing
    Ok(!alltrue(ctx.world.as_ref(), !flushing)?)
}

/// Rank 0 creates the timestamped PFS directory and registers it in the
/// index; everyone learns the path.
pub fn flush_dir_create(ctx: &Context, id: CheckpointId) -> Result<Option<PathBuf>, Error> {
    let name = if ctx.my_rank_world() == 0 {
        let now = proxmox_time::epoch_i64();
        let stamp = proxmox_time::strftime_local("%Y-%m-%d_%H:%M:%S", now)
            .unwrap_or_else(|_| now.to_string());
        let dirname = format!("scr.{}.{}.{}", stamp, ctx.config.jobid().unwrap_or("nojob"), id);

        let mut index = Index::read(&ctx.config.prefix)?;
        index.add_checkpoint_dir(id, &dirname);
        index.mark_flushed(id, &dirname);
        index.write()?;

        let dir = ctx.config.prefix.join(&dirname);
        match proxmox_sys::fs::create_path(&dir, None, None) {
            Ok(_) => dirname,
            Err(err) => {
                log::error!("failed to create checkpoint directory {:?} - {}", dir, err);
                String::new()
            }
        }
    } else {
        String::new()
    };

    let name = ctx.world.bcast(0, name.into_bytes())?;
    let name = String::from_utf8_lossy(&name).into_owned();
    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some(ctx.config.prefix.join(name)))
}

/// Copy one cache file (and its sidecar) into the PFS directory; returns
/// the sidecar metadata with the completion flag reflecting the outcome.
pub fn flush_a_file(ctx: &Context, file: &Path, dst_dir: &Path) -> Result<(Meta, u64), Error> {
    let mut file_meta = Meta::read(file)?;
    let mut flushed = true;

    let with_crc = ctx.config.crc_on_flush;
    let (dst, bytes, crc) = fileio::copy_to(file, dst_dir, ctx.config.file_buf_size, with_crc)?;
    log::debug!("flushed {:?} to {:?}", file, dst);

    if let Some(crc) = crc {
        match file_meta.crc32 {
            Some(expected) if expected != crc => {
                // the copy read different bytes than the ones recorded
                file_meta.complete = false;
                file_meta.write(file)?;
                log::error!(
                    "crc mismatch while flushing {:?} ({:#x} != {:#x})",
                    file,
                    crc,
                    expected
                );
                flushed = false;
            }
            Some(_) => {}
            None => {
                file_meta.crc32 = Some(crc);
                file_meta.write(file)?;
            }
        }
    }

    if bytes != file_meta.filesize {
        log::error!(
            "flushed {:?} with {} bytes, expected {}",
            file,
            bytes,
            file_meta.filesize
        );
        flushed = false;
    }

    // the sidecar travels along
    let meta_file = meta::meta_path(file);
    if meta_file.exists() {
        fileio::copy_to(&meta_file, dst_dir, ctx.config.file_buf_size, false)?;
    }

    file_meta.complete = flushed;
    Ok((file_meta, bytes))
}

/// Flush this rank's files for a checkpoint, filling in the per-file
/// summary entries. Returns (file entries, bytes, ok).
pub fn flush_files_list(
    ctx: &Context,
    map: &Filemap,
    id: CheckpointId,
    dir: &Path,
) -> Result<(Hash, f64, bool), Error> {
    let mut ok = true;
    let mut total_bytes = 0.0;
    let mut files_hash = Hash::new();

    for file in map.list_files(id, ctx.my_rank_world()) {
        if !bool_flush_file(&file) {
            continue;
        }

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_hash = files_hash.set_kv(summary::KEY_FILE, name);

        match flush_a_file(ctx, &file, dir) {
            Ok((file_meta, bytes)) if file_meta.complete => {
                file_hash.set_value_u64(summary::KEY_SIZE, file_meta.filesize);
                if let Some(crc) = file_meta.crc32 {
                    file_hash.set_crc32(summary::KEY_CRC, crc);
                }
                total_bytes += bytes as f64;
            }
            Ok(_) | Err(_) => {
                file_hash.set_value_u64(summary::KEY_COMPLETE, 0);
                ok = false;
            }
        }
    }

    Ok((files_hash, total_bytes, ok))
}

/// Gather per-rank summary entries to rank 0 through a sliding window of
/// `width` concurrently working ranks. `work` produces this rank's entries
/// (and byte count) when its turn comes.
pub fn flow_controlled_gather<F>(
    ctx: &Context,
    width: usize,
    mut work: F,
) -> Result<(Option<Hash>, f64, bool), Error>
where
    F: FnMut() -> Result<(Hash, f64, bool), Error>,
{
    let world = ctx.world.as_ref();
    let ranks = ctx.ranks_world();

    if ctx.my_rank_world() == 0 {
        let mut data = Hash::new();
        let (my_hash, mut total_bytes, mut all_ok) = work()?;
        data.set_kv(summary::KEY_RANK, "0").merge(&my_hash);

        let width = width.clamp(1, ranks.saturating_sub(1).max(1));
        let mut next = 1;
        let mut outstanding: Vec<usize> = Vec::new();
        while next < ranks || !outstanding.is_empty() {
            while next < ranks && outstanding.len() < width {
                world.send(next, &1i64.to_le_bytes())?;
                outstanding.push(next);
                next += 1;
            }

            let (src, bytes) = world.recv_any(&outstanding)?;
            outstanding.retain(|&r| r != src);
            total_bytes += f64::from_le_bytes(bytes.try_into().unwrap());

            let incoming = recv_hash(world, src)?;
            if incoming.get_u64("OK") != Some(1) {
                all_ok = false;
            }
            if let Some(rank_data) = incoming.get(summary::KEY_RANK) {
                data.set(summary::KEY_RANK).merge(rank_data);
            }
        }

        Ok((Some(data), total_bytes, all_ok))
    } else {
        // wait for the start token
        world.recv(0)?;
        let (my_hash, bytes, ok) = work()?;

        world.send(0, &bytes.to_le_bytes())?;
        let mut payload = Hash::new();
        payload.set_value_u64("OK", ok as u64);
        payload
            .set(summary::KEY_RANK)
            .set(ctx.my_rank_world().to_string())
            .merge(&my_hash);
        send_hash(world, 0, &payload)?;

        Ok((None, bytes, ok))
    }
}

/// Write the summary, mark the index complete and atomically repoint the
/// current link. Rank 0 only; returns whether everything landed.
pub fn commit_to_prefix(
    ctx: &Context,
    dir: &Path,
    id: CheckpointId,
    data: &Hash,
) -> Result<(), Error> {
    summary::write(dir, id, ctx.ranks_world(), true, data)?;

    let dirname = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format_err!("flush directory {:?} has no name", dir))?;

    let mut index = Index::read(&ctx.config.prefix)?;
    index.set_complete(id, &dirname, true);
    index.write()?;

    let current = ctx.config.prefix.join(CURRENT_LINK);
    if current.symlink_metadata().is_ok() {
        std::fs::remove_file(&current)?;
    }
    std::os::unix::fs::symlink(&dirname, &current)
        .map_err(|err| format_err!("unable to update {:?} - {}", current, err))?;

    Ok(())
}

/// The synchronous flush proper. The caller has already drained or stopped
/// any asynchronous flush.
pub fn flush_files(ctx: &Context, map: &Filemap, id: CheckpointId) -> Result<bool, Error> {
    if ctx.config.flush == 0 {
        return Ok(false);
    }
    if !need_flush(ctx, id)? {
        return Ok(true);
    }

    if ctx.my_rank_world() == 0 {
        log::info!("initiating flush of checkpoint {}", id);
    }
    ctx.world.barrier()?;
    let start = Instant::now();

    // all files must still be present everywhere
    let have_files = crate::cache::check_files(map, id);
    if !alltrue(ctx.world.as_ref(), have_files)? {
        if ctx.my_rank_world() == 0 {
            log::error!("cannot flush checkpoint {}, files are missing from cache", id);
        }
        return Ok(false);
    }

    let dir = match flush_dir_create(ctx, id)? {
        Some(dir) => dir,
        None => {
            if ctx.my_rank_world() == 0 {
                log::error!("failed to create flush directory for checkpoint {}", id);
            }
            return Ok(false);
        }
    };
    if ctx.my_rank_world() == 0 {
        log::info!("flushing checkpoint {} to {:?}", id, dir);
    }

    let (data, total_bytes, all_ok) =
        flow_controlled_gather(ctx, ctx.config.flush_width, || {
            flush_files_list(ctx, map, id, &dir)
        })?;

    let mut flushed = all_ok;
    if ctx.my_rank_world() == 0 {
        if flushed {
            if let Err(err) = commit_to_prefix(ctx, &dir, id, data.as_ref().expect("root data")) {
                log::error!("failed to commit flush of checkpoint {} - {}", id, err);
                flushed = false;
            }
        }
    }

    let flushed_bytes = ctx
        .world
        .bcast(0, (flushed as i64).to_le_bytes().to_vec())?;
    let flushed = i64::from_le_bytes(flushed_bytes.try_into().unwrap()) != 0;

    if flushed && ctx.am_node_master() {
        FlushFile::new(&ctx.flush_file).location_set(id, FlushLocation::Pfs)?;
    }

    if ctx.my_rank_world() == 0 {
        let secs = start.elapsed().as_secs_f64();
        if flushed {
            log::info!(
                "flush of checkpoint {} succeeded: {:.3} secs, {:.0} bytes",
                id,
                secs,
                total_bytes
            );
        } else {
            log::error!("flush of checkpoint {} failed", id);
        }
    }

    Ok(flushed)
}
