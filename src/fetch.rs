//! Fetch: restore a checkpoint from the parallel file system into cache.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, format_err, Error};

use scr_api_types::{CheckpointId, FileKind, FlushLocation};
use scr_cache::{Filemap, FlushFile, Meta};
use scr_comm::{alltrue, Communicator};
use scr_hash::Hash;

use crate::cache::{self, checkpoint_dir, checkpoint_dir_create};
use crate::context::Context;
use crate::descriptor::{ckptdesc_get, CkptDesc};
use crate::exchange::{recv_hash, send_hash};
use crate::fileio;
use crate::redundancy;
use crate::summary;

/// Copy one file out of the PFS directory into cache, verifying size and
/// (when enabled) the CRC recorded in the summary.
fn fetch_a_file(
    ctx: &Context,
    fetch_dir: &Path,
    file_meta: &Meta,
    ckpt_dir: &Path,
) -> Result<PathBuf, Error> {
    let src = fetch_dir.join(&file_meta.filename);

    let with_crc = ctx.config.crc_on_flush;
    let (dst, bytes, crc) = fileio::copy_to(&src, ckpt_dir, ctx.config.file_buf_size, with_crc)?;

    if bytes != file_meta.filesize {
        bail!(
            "fetched {:?} with {} bytes, summary says {}",
            src,
            bytes,
            file_meta.filesize
        );
    }
    if let (Some(read_crc), Some(expected)) = (crc, file_meta.crc32) {
        if read_crc != expected {
            bail!(
                "crc mismatch fetching {:?} ({:#x} != {:#x})",
                src,
                read_crc,
                expected
            );
        }
    }

    Ok(dst)
}

/// Fetch every file the summary lists for this rank. The filemap entry is
/// written before each file is created.
fn fetch_files_list(
    ctx: &Context,
    map: &mut Filemap,
    list_hash: &Hash,
    id: CheckpointId,
    fetch_dir: &Path,
    ckpt_dir: &Path,
) -> Result<(f64, bool), Error> {
    let my_rank = ctx.my_rank_world();
    let mut total_bytes = 0.0;
    let mut ok = true;
    let mut my_num_files = 0;

    if let Some(files) = list_hash.get(summary::KEY_FILE) {
        for (name, entry) in files.iter() {
            // parity chunks are never listed for fetch; the marker guards
            // against name collisions with data files
            if entry.get(summary::KEY_NOFETCH).is_some() {
                continue;
            }
            my_num_files += 1;

            let base = Path::new(name)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(name));
            let newfile = ckpt_dir.join(&base);

            map.add_file(id, my_rank, &newfile);
            map.write(&ctx.map_file)?;

            let size = entry
                .get_u64(summary::KEY_SIZE)
                .ok_or_else(|| format_err!("summary lists no size for {}", name))?;
            total_bytes += size as f64;

            // absence of a complete flag means complete
            let complete = entry.get_u64(summary::KEY_COMPLETE).unwrap_or(1) != 0;

            let mut file_meta = Meta::new(
                &newfile,
                FileKind::Full,
                size,
                id,
                my_rank,
                ctx.ranks_world(),
                complete,
            );
            file_meta.crc32 = entry.get_crc32(summary::KEY_CRC);

            match fetch_a_file(ctx, fetch_dir, &file_meta, ckpt_dir) {
                Ok(_) => {}
                Err(err) => {
                    log::error!("fetch failed - {}", err);
                    ok = false;
                }
            }

            file_meta.write(&newfile)?;
        }
    }

    map.set_expected_files(id, my_rank, my_num_files);
    map.write(&ctx.map_file)?;

    Ok((total_bytes, ok))
}

/// Collective fetch of one PFS checkpoint directory. Returns the fetched
/// checkpoint id on success.
pub fn fetch_files(
    ctx: &Context,
    map: &mut Filemap,
    descs: &[CkptDesc],
    fetch_dir: Option<PathBuf>,
) -> Result<Option<CheckpointId>, Error> {
    let my_rank = ctx.my_rank_world();
    let start = Instant::now();

    // everyone learns the directory rank 0 picked
    let dir_bytes = match (&fetch_dir, my_rank) {
        (Some(dir), 0) => dir.to_string_lossy().into_owned().into_bytes(),
        _ => Vec::new(),
    };
    let dir_bytes = ctx.world.bcast(0, dir_bytes)?;
    let fetch_dir = String::from_utf8_lossy(&dir_bytes).into_owned();
    if fetch_dir.is_empty() {
        return Ok(None);
    }
    let fetch_dir = PathBuf::from(fetch_dir);

    // rank 0 reads and validates the summary
    let mut summary_hash = Hash::new();
    let mut id: i64 = -1;
    if my_rank == 0 {
        log::info!("attempting fetch from {:?}", fetch_dir);
        match summary::read(&fetch_dir, ctx.ranks_world()) {
            Ok((hash, ckpt_id)) => {
                summary_hash = hash;
                id = ckpt_id as i64;
            }
            Err(err) => log::warn!("failed to read summary - {}", err),
        }
    }

    let id_bytes = ctx.world.bcast(0, id.to_le_bytes().to_vec())?;
    let id = i64::from_le_bytes(id_bytes.try_into().unwrap());
    if id < 0 {
        return Ok(None);
    }
    let id = id as CheckpointId;

    // stale cache for this id only gets in the way
    cache::checkpoint_delete(ctx, map, id)?;

    let desc = ckptdesc_get(descs, id)
        .ok_or_else(|| format_err!("no enabled descriptor covers checkpoint {}", id))?;

    map.set_desc(id, my_rank, desc.store_to_hash());
    map.write(&ctx.map_file)?;

    checkpoint_dir_create(ctx, desc, id)?;
    let ckpt_dir = checkpoint_dir(desc, id);

    // rank 0 streams per-rank file lists through a sliding window of readers
    let mut success = true;
    let mut total_bytes = 0.0;
    if my_rank == 0 {
        let ranks_hash = summary_hash
            .get_kv(summary::KEY_CKPT, &id.to_string())
            .and_then(|h| h.get(summary::KEY_RANK))
            .cloned()
            .unwrap_or_default();

        let my_list = ranks_hash.get("0").cloned().unwrap_or_default();
        let (bytes, ok) = fetch_files_list(ctx, map, &my_list, id, &fetch_dir, &ckpt_dir)?;
        total_bytes += bytes;
        success &= ok;

        let ranks = ctx.ranks_world();
        let width = ctx.config.fetch_width.clamp(1, ranks.saturating_sub(1).max(1));
        let mut next = 1;
        let mut outstanding: Vec<usize> = Vec::new();
        while next < ranks || !outstanding.is_empty() {
            while next < ranks && outstanding.len() < width {
                let list = ranks_hash.get(&next.to_string()).cloned().unwrap_or_default();
                send_hash(ctx.world.as_ref(), next, &list)?;
                outstanding.push(next);
                next += 1;
            }

            let (src, bytes) = ctx.world.recv_any(&outstanding)?;
            outstanding.retain(|&r| r != src);
            total_bytes += f64::from_le_bytes(bytes.try_into().unwrap());
        }
    } else {
        let my_list = recv_hash(ctx.world.as_ref(), 0)?;
        let (bytes, ok) = fetch_files_list(ctx, map, &my_list, id, &fetch_dir, &ckpt_dir)?;
        success &= ok;
        ctx.world.send(0, &bytes.to_le_bytes())?;
    }

    if !alltrue(ctx.world.as_ref(), success)? {
        cache::checkpoint_delete(ctx, map, id)?;
        if my_rank == 0 {
            log::warn!("one or more processes failed to read its files from {:?}", fetch_dir);
        }
        return Ok(None);
    }

    // freshly fetched cache still needs its redundancy applied
    let (ok, _bytes) = redundancy::copy_files(ctx, map, desc, id)?;
    if !ok {
        cache::checkpoint_delete(ctx, map, id)?;
        return Ok(None);
    }

    if ctx.am_node_master() {
        let flush_file = FlushFile::new(&ctx.flush_file);
        flush_file.location_set(id, FlushLocation::Cache)?;
        flush_file.location_set(id, FlushLocation::Pfs)?;
        flush_file.location_unset(id, FlushLocation::Flushing)?;
    }

    if my_rank == 0 {
        log::info!(
            "fetched checkpoint {} in {:.3} secs ({:.0} bytes)",
            id,
            start.elapsed().as_secs_f64(),
            total_bytes
        );
    }

    Ok(Some(id))
}
