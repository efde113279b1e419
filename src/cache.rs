//! Cache control: checkpoint directories, deletion, validation and the
//! pieces retention is built from.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use scr_api_types::{CheckpointId, Rank};
use scr_cache::{meta, Filemap, FlushFile, Meta};
use scr_comm::ReduceOp;
use scr_hash::Hash;

use crate::context::Context;
use crate::descriptor::{self, CkptDesc};
use crate::fileio;

/// Cache directory of one checkpoint: `<desc.directory>/checkpoint.<id>`.
pub fn checkpoint_dir(desc: &CkptDesc, id: CheckpointId) -> PathBuf {
    desc.directory.join(format!("checkpoint.{}", id))
}

/// Node master creates the checkpoint directory; everyone on the node waits
/// until it exists.
pub fn checkpoint_dir_create(ctx: &Context, desc: &CkptDesc, id: CheckpointId) -> Result<(), Error> {
    if ctx.am_node_master() {
        let dir = checkpoint_dir(desc, id);
        log::debug!("creating checkpoint directory {:?}", dir);
        proxmox_sys::fs::create_path(&dir, None, None)
            .map_err(|err| format_err!("unable to create checkpoint directory {:?} - {}", dir, err))?;
    }
    ctx.local.barrier()?;
    Ok(())
}

/// Remove the (expected empty) checkpoint directory after everyone on the
/// node has let go of it. The barrier runs even when this process no longer
/// knows the directory, so the node stays in step.
fn checkpoint_dir_delete(
    ctx: &Context,
    parent: Option<&Path>,
    id: CheckpointId,
) -> Result<(), Error> {
    ctx.local.barrier()?;
    if ctx.am_node_master() {
        if let Some(parent) = parent {
            let dir = parent.join(format!("checkpoint.{}", id));
            log::debug!("removing checkpoint directory {:?}", dir);
            if let Err(err) = std::fs::remove_dir(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove checkpoint directory {:?} - {}", dir, err);
                }
            }
        }
    }
    Ok(())
}

/// Drop every trace of a checkpoint from this node: files, sidecars, cache
/// directory, flush state and filemap entries.
pub fn checkpoint_delete(ctx: &Context, map: &mut Filemap, id: CheckpointId) -> Result<(), Error> {
    if ctx.my_rank_world() == 0 {
        log::info!("deleting checkpoint {} from cache", id);
    }

    for rank in map.list_ranks_by_checkpoint(id) {
        for file in map.list_files(id, rank) {
            // watch for cache hardware silently corrupting files under us
            if ctx.config.crc_on_delete {
                if let Err(err) = meta::compute_crc(&file, ctx.config.file_buf_size) {
                    log::error!("crc check before delete failed for {:?} - {}", file, err);
                }
            }

            if let Err(err) = std::fs::remove_file(&file) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove {:?} - {}", file, err);
                }
            }
            Meta::unlink(&file);
        }
    }

    let dir = descriptor::dir_from_filemap(map, id, ctx.my_rank_world());
    checkpoint_dir_delete(ctx, dir.as_deref(), id)?;

    FlushFile::new(&ctx.flush_file).remove_checkpoint(id)?;

    map.remove_checkpoint(id);
    map.write(&ctx.map_file)?;

    Ok(())
}

/// Collectively delete every cached checkpoint on the node, then the filemap
/// file itself.
pub fn unlink_all(ctx: &Context, map: &mut Filemap) -> Result<(), Error> {
    loop {
        let num = map.num_checkpoints() as i64;
        let max_num = ctx.local.allreduce_i64(num, ReduceOp::Max)?;
        if max_num == 0 {
            break;
        }

        let latest = map.latest_checkpoint().map(|id| id as i64).unwrap_or(-1);
        let max_ckpt = ctx.local.allreduce_i64(latest, ReduceOp::Max)?;
        if max_ckpt < 0 {
            break;
        }
        checkpoint_delete(ctx, map, max_ckpt as CheckpointId)?;
    }

    if let Err(err) = std::fs::remove_file(&ctx.map_file) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to remove filemap {:?} - {}", ctx.map_file, err);
        }
    }
    log::debug!("cleared cache, removed {:?}", ctx.map_file);
    Ok(())
}

/// Unlink every file this node holds for `(ckpt, rank)` and drop the rank
/// from the checkpoint's filemap entry.
pub fn unlink_rank(
    ctx: &Context,
    map: &mut Filemap,
    ckpt: CheckpointId,
    rank: Rank,
) -> Result<(), Error> {
    for file in map.list_files(ckpt, rank) {
        log::debug!("deleting file {:?} of unneeded rank {}", file, rank);
        if let Err(err) = std::fs::remove_file(&file) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {:?} - {}", file, err);
            }
        }
        Meta::unlink(&file);
        map.remove_file(ckpt, rank, &file);
    }
    map.remove_rank_by_checkpoint(ckpt, rank);
    map.write(&ctx.map_file)
}

/// A file counts as held when it is readable and its sidecar matches the
/// checkpoint, rank, world size and on-disk size.
pub fn bool_have_file(
    ckpt: CheckpointId,
    rank: Rank,
    ranks: usize,
    file: &Path,
) -> bool {
    let meta = match Meta::read(file) {
        Ok(meta) => meta,
        Err(err) => {
            log::debug!("no usable sidecar for {:?} - {}", file, err);
            return false;
        }
    };
    if !meta.complete {
        log::debug!("file marked incomplete: {:?}", file);
        return false;
    }
    if meta.checkpoint_id != ckpt || meta.rank != rank || meta.ranks != ranks {
        log::debug!(
            "sidecar identity mismatch for {:?} (ckpt {} rank {} ranks {})",
            file,
            meta.checkpoint_id,
            meta.rank,
            meta.ranks
        );
        return false;
    }
    match fileio::file_size(file) {
        Ok(size) if size == meta.filesize => true,
        Ok(size) => {
            log::debug!(
                "size mismatch for {:?}: {} on disk, {} expected",
                file,
                size,
                meta.filesize
            );
            false
        }
        Err(err) => {
            log::debug!("cannot stat {:?} - {}", file, err);
            false
        }
    }
}

/// Do we hold everything the filemap promises for `(ckpt, rank)`?
pub fn bool_have_files(ctx: &Context, map: &Filemap, ckpt: CheckpointId, rank: Rank) -> bool {
    if !map.have_rank_by_checkpoint(ckpt, rank) {
        return false;
    }
    let expected = map.num_expected_files(ckpt, rank);
    if expected != Some(map.num_files(ckpt, rank)) {
        return false;
    }
    map.list_files(ckpt, rank)
        .iter()
        .all(|file| bool_have_file(ckpt, rank, ctx.ranks_world(), file))
}

/// Walk the whole filemap; for any (checkpoint, rank) with a missing or
/// broken file, delete all of that pair's files and drop the entries.
pub fn clean_files(ctx: &Context, map: &mut Filemap) -> Result<(), Error> {
    let mut keep = Filemap::new();

    for ckpt in map.list_checkpoints() {
        for rank in map.list_ranks_by_checkpoint(ckpt) {
            let files = map.list_files(ckpt, rank);
            let expected = map.num_expected_files(ckpt, rank);

            let mut missing = files
                .iter()
                .any(|f| !bool_have_file(ckpt, rank, ctx.ranks_world(), f));
            if expected != Some(files.len()) {
                missing = true;
            }

            if let Some(desc) = map.get_desc(ckpt, rank) {
                keep.set_desc(ckpt, rank, desc);
            }
            if let Some(tag) = map.get_tag(ckpt, rank, "PARTNER") {
                keep.set_tag(ckpt, rank, "PARTNER", &tag);
            }

            if missing {
                for file in &files {
                    log::info!(
                        "deleting file of broken set: checkpoint {} rank {} file {:?}",
                        ckpt,
                        rank,
                        file
                    );
                    if let Err(err) = std::fs::remove_file(file) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("failed to remove {:?} - {}", file, err);
                        }
                    }
                    Meta::unlink(file);
                }
            } else {
                if let Some(expected) = expected {
                    keep.set_expected_files(ckpt, rank, expected);
                }
                for file in &files {
                    keep.add_file(ckpt, rank, file);
                }
            }
        }
    }

    map.clear();
    map.merge(&keep);
    map.write(&ctx.map_file)
}

/// True when every file of `ckpt` listed for any rank on this node is
/// readable and complete.
pub fn check_files(map: &Filemap, ckpt: CheckpointId) -> bool {
    for rank in map.list_ranks_by_checkpoint(ckpt) {
        for file in map.list_files(ckpt, rank) {
            match Meta::read(&file) {
                Ok(meta) if meta.complete => {}
                _ => return false,
            }
            if !file.is_file() {
                return false;
            }
        }
    }
    true
}

/// Quota for a cache base; a single cache descriptor is synthesized from the
/// flat configuration.
pub fn cache_size_for_base(ctx: &Context, base: &Path) -> usize {
    if base == ctx.config.cache_base {
        ctx.config.cache_size
    } else {
        // unknown base: no retention budget recorded for it
        0
    }
}

/// Descriptor hash for (ckpt, my rank) straight from the filemap.
pub fn desc_hash_from_filemap(ctx: &Context, map: &Filemap, ckpt: CheckpointId) -> Option<Hash> {
    map.get_desc(ckpt, ctx.my_rank_world())
}
