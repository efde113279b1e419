//! Restart-time reconstruction of one failed member's files from the
//! surviving members' data and parity chunks.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use scr_api_types::{CheckpointId, CopyType, FileKind};
use scr_cache::{meta, Filemap, Meta};
use scr_comm::{alltrue, Communicator, ReduceOp};
use scr_hash::Hash;

use crate::cache::{self, checkpoint_dir};
use crate::context::Context;
use crate::descriptor::CkptDesc;
use crate::exchange::{recv_hash, send_hash};
use crate::fileio::LogicalFileSet;
use crate::redundancy::{
    read_xor_header, write_xor_header, xor_chunk_path, KEY_CHUNK, KEY_CURRENT, KEY_FILE,
    KEY_FILES, KEY_PARTNER,
};
use crate::{fileio, redundancy};

/// Find this rank's parity chunk for a checkpoint, if the filemap lists one.
pub fn find_xor_file(map: &Filemap, ckpt: CheckpointId, rank: usize) -> Option<PathBuf> {
    map.list_files(ckpt, rank).into_iter().find(|file| {
        Meta::read(file)
            .map(|m| m.kind == FileKind::Xor)
            .unwrap_or(false)
    })
}

/// File list recorded in a chunk-header member hash: paths (joined with
/// `dir`) and original sizes, in header order.
fn header_file_list(member: &Hash, dir: &Path) -> Result<Vec<(PathBuf, u64)>, Error> {
    let num_files = member
        .get_u64(KEY_FILES)
        .ok_or_else(|| format_err!("chunk header member lacks file count"))? as usize;
    let files_hash = member
        .get(KEY_FILE)
        .ok_or_else(|| format_err!("chunk header member lacks file list"))?;

    let mut out = Vec::with_capacity(num_files);
    for i in 0..num_files {
        let meta_hash = files_hash
            .get(&i.to_string())
            .ok_or_else(|| format_err!("file {} missing from chunk header", i))?;
        let file_meta = Meta::from_hash(meta_hash)?;
        out.push((dir.join(&file_meta.filename), file_meta.filesize));
    }
    Ok(out)
}

/// Rebuild the files of group member `root` using the surviving members'
/// data files and parity chunks. Collective over the set.
fn rebuild_xor(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
    root: usize,
) -> Result<bool, Error> {
    let comm = desc.comm.as_ref();
    let my_rank = ctx.my_rank_world();
    let mut ok = true;

    let ckpt_dir = checkpoint_dir(desc, id);

    let header;
    let chunk_file;
    let mut fd_chunk;
    let mut logical;

    if root != desc.my_rank {
        // surviving member: stream from my data files and my parity chunk
        chunk_file = find_xor_file(map, id, my_rank)
            .unwrap_or_else(|| ctx.abort("missing parity chunk during rebuild"));

        let mut fd = File::open(&chunk_file).unwrap_or_else(|err| {
            ctx.abort(&format!(
                "opening parity chunk for rebuild: {:?} - {}",
                chunk_file, err
            ))
        });
        let (hdr, _payload_off) = read_xor_header(&mut fd)?;
        header = hdr;
        fd_chunk = fd;

        let current = header
            .get(KEY_CURRENT)
            .ok_or_else(|| format_err!("chunk header lacks current member"))?;
        let paths = header_file_list(current, &ckpt_dir)?;
        logical = LogicalFileSet::open_read(&paths)?;

        // root's right neighbor holds root's file list in its header; root's
        // left neighbor contributes its own list as root's partner entry
        if root == desc.lhs_rank {
            send_hash(comm, desc.lhs_rank, &header)?;
        }
        if root == desc.rhs_rank {
            send_hash(comm, desc.rhs_rank, current)?;
        }
    } else {
        // failed member: learn everything from the neighbors
        let received = recv_hash(comm, desc.rhs_rank)?;

        let mut hdr = received;
        let my_hash = hdr
            .unset(KEY_PARTNER)
            .ok_or_else(|| format_err!("received chunk header lacks partner entry"))?;
        hdr.unset(KEY_CURRENT);
        hdr.set_hash(KEY_CURRENT, my_hash);

        let partner_hash = recv_hash(comm, desc.lhs_rank)?;
        hdr.set_hash(KEY_PARTNER, partner_hash);
        header = hdr;

        chunk_file = xor_chunk_path(&ckpt_dir, desc.my_rank, desc.ranks, desc.group_id);

        let current = header
            .get(KEY_CURRENT)
            .ok_or_else(|| format_err!("chunk header lacks current member"))?;
        let paths = header_file_list(current, &ckpt_dir)?;

        // everything must be in the filemap before any file is created
        map.add_file(id, my_rank, &chunk_file);
        for (path, _) in &paths {
            map.add_file(id, my_rank, path);
        }
        map.set_expected_files(id, my_rank, paths.len() + 1);
        map.write(&ctx.map_file)?;

        logical = LogicalFileSet::create_write(&paths)?;
        let mut fd = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&chunk_file)
            .unwrap_or_else(|err| {
                ctx.abort(&format!(
                    "opening parity chunk for rebuild: {:?} - {}",
                    chunk_file, err
                ))
            });
        write_xor_header(&mut fd, &header)?;
        fd_chunk = fd;
    }

    let chunk_size = header
        .get_u64(KEY_CHUNK)
        .ok_or_else(|| format_err!("chunk header lacks chunk size"))?;

    let buf_size = ctx.mpi_buf_size();
    let mut send_buf = vec![0u8; buf_size];

    // pipelined XOR reduce to the failed member
    let mut offset: u64 = 0;
    for chunk_id in 0..desc.ranks {
        let mut nread: u64 = 0;
        while nread < chunk_size {
            let count = ((chunk_size - nread) as usize).min(buf_size);

            if root != desc.my_rank {
                if chunk_id != desc.my_rank {
                    if let Err(err) = logical.read_pad(&mut send_buf[..count], offset) {
                        log::error!("stripe read failed during rebuild - {}", err);
                        ok = false;
                    }
                    offset += count as u64;
                } else if let Err(err) = fd_chunk.read_exact(&mut send_buf[..count]) {
                    log::error!("parity read failed during rebuild - {}", err);
                    ok = false;
                }

                // xor in the partial reduction coming down the ring
                if root != desc.lhs_rank {
                    let data = comm.recv(desc.lhs_rank)?;
                    for i in 0..count {
                        send_buf[i] ^= data[i];
                    }
                }
                comm.send(desc.rhs_rank, &send_buf[..count])?;
            } else {
                let data = comm.recv(desc.lhs_rank)?;
                if chunk_id != desc.my_rank {
                    if let Err(err) = logical.write_pad(&data[..count], offset) {
                        log::error!("stripe write failed during rebuild - {}", err);
                        ok = false;
                    }
                    offset += count as u64;
                } else if let Err(err) = fd_chunk.write_all(&data[..count]) {
                    log::error!("parity write failed during rebuild - {}", err);
                    ok = false;
                }
            }

            nread += count as u64;
        }
    }

    drop(fd_chunk);
    drop(logical);

    if root == desc.my_rank {
        // restore the sidecars recorded in the header and verify
        let current = header.get(KEY_CURRENT).expect("current vanished");
        let files_hash = current.get(KEY_FILE).expect("file list vanished");
        let num_files = current.get_u64(KEY_FILES).unwrap_or(0) as usize;
        for i in 0..num_files {
            if let Some(meta_hash) = files_hash.get(&i.to_string()) {
                let file_meta = Meta::from_hash(meta_hash)?;
                let path = ckpt_dir.join(&file_meta.filename);
                file_meta.write(&path)?;

                if ctx.config.crc_on_copy {
                    if let Err(err) = meta::compute_crc(&path, ctx.config.file_buf_size) {
                        log::error!("crc verification after rebuild failed for {:?} - {}", path, err);
                        ok = false;
                    }
                }
            }
        }

        let chunk_meta = Meta::new(
            &chunk_file,
            FileKind::Xor,
            fileio::file_size(&chunk_file)?,
            id,
            my_rank,
            ctx.ranks_world(),
            true,
        );
        chunk_meta.write(&chunk_file)?;
        if ctx.config.crc_on_copy {
            let _ = meta::compute_crc(&chunk_file, ctx.config.file_buf_size);
        }
    }

    Ok(ok)
}

/// Check whether the set can absorb its losses (at most one failed member)
/// and run the rebuild if anyone needs it.
pub fn attempt_rebuild_xor(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
) -> Result<bool, Error> {
    let comm = desc.comm.as_ref();
    let my_rank = ctx.my_rank_world();

    let mut have_my_files = cache::bool_have_files(ctx, map, id, my_rank);
    if find_xor_file(map, id, my_rank).is_none() {
        have_my_files = false;
    }
    let need_rebuild = !have_my_files;

    let total_rebuild = comm.allreduce_i64(need_rebuild as i64, ReduceOp::Sum)?;

    let set_can_rebuild = total_rebuild <= 1;
    if !alltrue(ctx.world.as_ref(), set_can_rebuild)? {
        if my_rank == 0 {
            log::error!("cannot rebuild missing files, more than one failure in a set");
        }
        return Ok(false);
    }

    let mut ok = true;
    if total_rebuild > 0 {
        let candidate = if need_rebuild { desc.my_rank as i64 } else { -1 };
        let rebuild_rank = comm.allreduce_i64(candidate, ReduceOp::Max)?;

        if need_rebuild {
            log::info!("rebuilding files from parity segments");
        }
        ok = rebuild_xor(ctx, map, desc, id, rebuild_rank as usize)?;
    }

    if !alltrue(ctx.world.as_ref(), ok)? {
        if my_rank == 0 {
            log::warn!("one or more processes failed to rebuild its files");
        }
        return Ok(false);
    }

    Ok(true)
}

/// Post-distribute recovery: XOR rebuilds, LOCAL and PARTNER re-apply their
/// copy once everyone holds their own files again.
pub fn rebuild_files(
    ctx: &Context,
    map: &mut Filemap,
    desc: &CkptDesc,
    id: CheckpointId,
) -> Result<bool, Error> {
    if desc.copy_type == CopyType::Xor && !attempt_rebuild_xor(ctx, map, desc, id)? {
        if ctx.my_rank_world() == 0 {
            log::info!("missing checkpoint files for {}", id);
        }
        return Ok(false);
    }

    let have_my_files = cache::bool_have_files(ctx, map, id, ctx.my_rank_world());
    if !alltrue(ctx.world.as_ref(), have_my_files)? {
        if ctx.my_rank_world() == 0 {
            log::info!("missing checkpoint files for {}", id);
        }
        return Ok(false);
    }

    match desc.copy_type {
        CopyType::Local | CopyType::Partner => {
            let (ok, _bytes) = redundancy::copy_files(ctx, map, desc, id)?;
            Ok(ok)
        }
        CopyType::Xor => Ok(true),
    }
}
