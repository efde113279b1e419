//! Asynchronous flush: hand the file list to an external transfer agent
//! through the node-shared transfer file and poll for progress.
//!
//! The transfer file is an on-disk RPC channel: the library enqueues files
//! with their destinations and sizes, sets `COMMAND=RUN`, and the agent
//! echoes progress through `WRITTEN` and its `STATE`. Only the node master
//! touches the file, always under the advisory lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Error;

use scr_api_types::{CheckpointId, FlushLocation};
use scr_cache::{meta, Filemap, FlushFile, Meta};
use scr_comm::{alltrue, Communicator};
use scr_hash::Hash;

use crate::context::Context;
use crate::exchange::{recv_hash, send_hash};
use crate::flush;
use crate::summary;

pub const KEY_FILES: &str = "FILES";
pub const KEY_DESTINATION: &str = "DESTINATION";
pub const KEY_SIZE: &str = "SIZE";
pub const KEY_WRITTEN: &str = "WRITTEN";
pub const KEY_COMMAND: &str = "COMMAND";
pub const KEY_STATE: &str = "STATE";
pub const KEY_BW: &str = "BW";
pub const KEY_PERCENT: &str = "PERCENT";
pub const KEY_FLAG: &str = "FLAG";
pub const FLAG_DONE: &str = "DONE";
pub const COMMAND_RUN: &str = "RUN";
pub const COMMAND_STOP: &str = "STOP";
pub const STATE_STOP: &str = "STOP";

/// How long to sleep between probes of the transfer file.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Tracking state for one in-flight asynchronous flush.
pub struct AsyncFlush {
    pub id: CheckpointId,
    pub dir: PathBuf,
    /// The `FILES` entries this process enqueued (the node master holds the
    /// merged set for the whole node).
    pub queued: Hash,
    /// Total bytes to move, across the world.
    pub bytes_total: f64,
}

/// Queue one file and its sidecar for transfer to `dst_dir`.
fn file_enqueue(files: &mut Hash, file: &Path, dst_dir: &Path) -> Result<f64, Error> {
    let mut bytes = 0.0;

    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size = crate::fileio::file_size(file)?;
    let entry = files.set(file.to_string_lossy());
    entry.set_value(KEY_DESTINATION, dst_dir.join(&name).to_string_lossy());
    entry.set_value_u64(KEY_SIZE, size);
    entry.set_value_u64(KEY_WRITTEN, 0);
    bytes += size as f64;

    let meta_file = meta::meta_path(file);
    let meta_size = crate::fileio::file_size(&meta_file)?;
    let meta_name = meta_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let entry = files.set(meta_file.to_string_lossy());
    entry.set_value(KEY_DESTINATION, dst_dir.join(&meta_name).to_string_lossy());
    entry.set_value_u64(KEY_SIZE, meta_size);
    entry.set_value_u64(KEY_WRITTEN, 0);
    bytes += meta_size as f64;

    Ok(bytes)
}

/// Every queued file must report `WRITTEN >= SIZE` for the transfer to
/// count as complete. Also sums the bytes written so far.
fn file_test(transfer: &Hash, queued: &Hash) -> (bool, f64) {
    let mut complete = true;
    let mut bytes = 0.0;

    let files = match transfer.get(KEY_FILES) {
        Some(files) => files,
        None => return (false, 0.0),
    };

    for (file, _) in queued.iter() {
        let entry = match files.get(file) {
            Some(entry) => entry,
            None => {
                complete = false;
                continue;
            }
        };
        match (entry.get_u64(KEY_SIZE), entry.get_u64(KEY_WRITTEN)) {
            (Some(size), Some(written)) => {
                if written < size {
                    complete = false;
                }
                bytes += written as f64;
            }
            _ => complete = false,
        }
    }

    (complete, bytes)
}

/// Remove our queued files from the transfer hash.
fn file_dequeue(transfer: &mut Hash, queued: &Hash) {
    for (file, _) in queued.iter() {
        transfer.unset_kv(KEY_FILES, file);
    }
}

/// Have the node master write `command` into the transfer file.
fn command_set(ctx: &Context, command: &str) -> Result<(), Error> {
    if ctx.am_node_master() {
        let mut locked = Hash::lock_open_read(&ctx.transfer_file)?;
        locked.hash.set_value(KEY_COMMAND, command);
        locked.write_close_unlock()?;
    }
    Ok(())
}

/// Spin until every node's transfer file echoes the given agent state.
fn state_wait(ctx: &Context, state: &str) -> Result<(), Error> {
    loop {
        let valid = if ctx.am_node_master() {
            let hash = Hash::read_with_lock(&ctx.transfer_file)?;
            hash.get_kv(KEY_STATE, state).is_some()
        } else {
            true
        };
        if alltrue(ctx.world.as_ref(), valid)? {
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Clear the FILES list everywhere.
fn file_clear_all(ctx: &Context) -> Result<(), Error> {
    if ctx.am_node_master() {
        let mut locked = Hash::lock_open_read(&ctx.transfer_file)?;
        locked.hash.unset(KEY_FILES);
        locked.write_close_unlock()?;
    }
    Ok(())
}

/// Kick off an asynchronous flush of a checkpoint. Returns the tracking
/// state, or `None` when the flush could not start.
pub fn start(ctx: &Context, map: &Filemap, id: CheckpointId) -> Result<Option<AsyncFlush>, Error> {
    if ctx.config.flush == 0 {
        return Ok(None);
    }
    if !flush::need_flush(ctx, id)? {
        return Ok(None);
    }

    if ctx.my_rank_world() == 0 {
        log::info!("initiating async flush of checkpoint {}", id);
    }
    ctx.world.barrier()?;

    // FLUSHING is on record before the agent sees the first byte
    if ctx.am_node_master() {
        FlushFile::new(&ctx.flush_file).location_set(id, FlushLocation::Flushing)?;
    }

    let have_files = crate::cache::check_files(map, id);
    if !alltrue(ctx.world.as_ref(), have_files)? {
        if ctx.my_rank_world() == 0 {
            log::error!("cannot start async flush of {}, files are missing from cache", id);
        }
        return Ok(None);
    }

    let dir = match flush::flush_dir_create(ctx, id)? {
        Some(dir) => dir,
        None => {
            if ctx.my_rank_world() == 0 {
                log::error!("failed to create flush directory for checkpoint {}", id);
            }
            return Ok(None);
        }
    };
    if ctx.my_rank_world() == 0 {
        log::info!("async flushing checkpoint {} to {:?}", id, dir);
    }

    let mut queued = Hash::new();
    let mut my_bytes = 0.0;
    for file in map.list_files(id, ctx.my_rank_world()) {
        if flush::bool_flush_file(&file) {
            my_bytes += file_enqueue(&mut queued, &file, &dir)?;
        }
    }

    // node master merges the local enqueues and hands them to the agent
    let mut merged = queued.clone();
    if ctx.am_node_master() {
        for src in 1..ctx.local.size() {
            let peer = recv_hash(ctx.local.as_ref(), src)?;
            merged.merge(&peer);
        }

        let mut locked = Hash::lock_open_read(&ctx.transfer_file)?;
        locked.hash.set(KEY_FILES).merge(&merged);

        if locked.hash.get_value(KEY_BW).is_none() {
            let bw = ctx.config.flush_async_bw / ctx.level.size() as f64;
            locked.hash.set_value(KEY_BW, format!("{}", bw));
        }
        if locked.hash.get_value(KEY_PERCENT).is_none() {
            locked
                .hash
                .set_value(KEY_PERCENT, format!("{}", ctx.config.flush_async_percent));
        }

        locked.hash.set_value(KEY_COMMAND, COMMAND_RUN);
        locked.hash.unset_kv(KEY_FLAG, FLAG_DONE);
        locked.write_close_unlock()?;
    } else {
        send_hash(ctx.local.as_ref(), 0, &queued)?;
    }

    let bytes_total = ctx.world.allreduce_f64_sum(my_bytes)?;
    ctx.world.barrier()?;

    Ok(Some(AsyncFlush {
        id,
        dir,
        queued: if ctx.am_node_master() { merged } else { queued },
        bytes_total,
    }))
}

/// Poll whether the agent has finished our files. Returns (done, bytes so
/// far across the world).
pub fn test(ctx: &Context, map: &Filemap, flight: &AsyncFlush) -> Result<(bool, f64), Error> {
    if ctx.config.flush == 0 {
        return Ok((false, 0.0));
    }

    let have_files = crate::cache::check_files(map, flight.id);
    if !alltrue(ctx.world.as_ref(), have_files)? {
        if ctx.my_rank_world() == 0 {
            log::error!(
                "files of checkpoint {} vanished during async flush",
                flight.id
            );
        }
        return Ok((false, 0.0));
    }

    let (mut done, mut bytes) = (true, 0.0);
    if ctx.am_node_master() {
        match Hash::read_with_lock(&ctx.transfer_file) {
            Ok(transfer) => {
                let (complete, written) = file_test(&transfer, &flight.queued);
                done = complete;
                bytes = written;
            }
            Err(_) => done = false,
        }
    }

    let total = ctx.world.allreduce_f64_sum(bytes)?;
    let done = alltrue(ctx.world.as_ref(), done)?;
    Ok((done, total))
}

/// The agent reports everything written: gather sidecar metadata, commit
/// the summary and index, repoint the current link, release the agent.
pub fn complete(ctx: &Context, map: &Filemap, flight: &AsyncFlush) -> Result<bool, Error> {
    let have_files = crate::cache::check_files(map, flight.id);
    if !alltrue(ctx.world.as_ref(), have_files)? {
        if ctx.my_rank_world() == 0 {
            log::error!(
                "files of checkpoint {} vanished while completing async flush",
                flight.id
            );
        }
        return Ok(false);
    }

    // same gather as the synchronous flush, without the data copy
    let (data, _bytes, all_ok) = flush::flow_controlled_gather(ctx, ctx.config.flush_width, || {
        let mut files_hash = Hash::new();
        for file in map.list_files(flight.id, ctx.my_rank_world()) {
            if !flush::bool_flush_file(&file) {
                continue;
            }
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file_hash = files_hash.set_kv(summary::KEY_FILE, name);
            let file_meta = Meta::read(&file)?;
            file_hash.set_value_u64(summary::KEY_SIZE, file_meta.filesize);
            if let Some(crc) = file_meta.crc32 {
                file_hash.set_crc32(summary::KEY_CRC, crc);
            }
        }
        Ok((files_hash, 0.0, true))
    })?;

    let mut flushed = all_ok;
    if ctx.my_rank_world() == 0 && flushed {
        if let Err(err) =
            flush::commit_to_prefix(ctx, &flight.dir, flight.id, data.as_ref().expect("root data"))
        {
            log::error!(
                "failed to commit async flush of checkpoint {} - {}",
                flight.id,
                err
            );
            flushed = false;
        }
    }

    let flushed_bytes = ctx
        .world
        .bcast(0, (flushed as i64).to_le_bytes().to_vec())?;
    let flushed = i64::from_le_bytes(flushed_bytes.try_into().unwrap()) != 0;

    if ctx.am_node_master() {
        let flush_file = FlushFile::new(&ctx.flush_file);
        if flushed {
            flush_file.location_set(flight.id, FlushLocation::Pfs)?;
        }
        flush_file.location_unset(flight.id, FlushLocation::Flushing)?;

        // release the agent and drop our files from its queue
        let mut locked = Hash::lock_open_read(&ctx.transfer_file)?;
        file_dequeue(&mut locked.hash, &flight.queued);
        locked.hash.set_value(KEY_COMMAND, COMMAND_STOP);
        locked.write_close_unlock()?;
    }

    if ctx.my_rank_world() == 0 {
        if flushed {
            log::info!("async flush of checkpoint {} succeeded", flight.id);
        } else {
            log::error!("async flush of checkpoint {} failed", flight.id);
        }
    }

    Ok(flushed)
}

/// Abort an in-flight transfer: order the agent to stop, wait until every
/// node sees it stopped, then clear the queue.
pub fn stop(ctx: &Context) -> Result<(), Error> {
    if ctx.my_rank_world() == 0 {
        log::info!("stopping async flush");
    }

    command_set(ctx, COMMAND_STOP)?;
    state_wait(ctx, STATE_STOP)?;
    file_clear_all(ctx)?;

    ctx.world.barrier()?;
    Ok(())
}

/// Block until the in-flight transfer finishes, completing it on the way
/// out. Returns whether the flush committed.
pub fn wait(ctx: &Context, map: &Filemap, flight: &AsyncFlush) -> Result<bool, Error> {
    loop {
        if !flush::is_flushing(ctx, flight.id)? {
            return Ok(true);
        }
        let (done, bytes) = test(ctx, map, flight)?;
        if done {
            return complete(ctx, map, flight);
        }
        if ctx.my_rank_world() == 0 && flight.bytes_total > 0.0 {
            log::info!(
                "flush of checkpoint {} is {:.0}% complete",
                flight.id,
                bytes / flight.bytes_total * 100.0
            );
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
