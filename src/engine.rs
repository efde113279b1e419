//! The five-call lifecycle: init, need-checkpoint, start / route /
//! complete, finalize.
//!
//! `Scr` owns the mutable state of one library instance (filemap, async
//! flush tracking, halt bookkeeping, timing counters); the immutable wiring
//! lives in [`Context`]. One instance per process, one process per rank.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{format_err, Error};

use scr_api_types::{CheckpointId, CopyType, FlushLocation, CURRENT_LINK};
use scr_cache::{nodesfile, Filemap, FlushFile, Meta};
use scr_comm::{alltrue, Communicator, ReduceOp};
use scr_hash::Hash;

use crate::cache;
use crate::config::Config;
use crate::context::Context;
use crate::descriptor::{self, CkptDesc};
use crate::distribute;
use crate::fetch;
use crate::fileio;
use crate::flush;
use crate::flush_async::{self, AsyncFlush};
use crate::halt::{self, HaltMode, NoOracle, SecondsRemaining};
use crate::index::Index;
use crate::rebuild;
use crate::scatter;
use crate::{ScrError, ScrResult};

pub struct Scr {
    ctx: Context,
    map: Filemap,
    descs: Vec<CkptDesc>,

    /// Latest checkpoint in cache; 0 means none yet.
    ckpt_id: CheckpointId,
    in_checkpoint: bool,
    need_checkpoint_count: u64,

    halt_hash: Hash,
    halted: bool,
    oracle: Box<dyn SecondsRemaining>,

    flight: Option<AsyncFlush>,

    time_checkpoint_total: f64,
    time_checkpoint_count: u64,
    checkpoint_start: Instant,
    last_checkpoint_end: Instant,
}

impl Scr {
    /// Initialize the library: read parameters, build communicators,
    /// recover the newest viable checkpoint from cache (or fetch it from
    /// the parallel file system), and enforce retention. Succeeds even when
    /// nothing could be recovered.
    pub fn init(world: Arc<dyn Communicator>, config: Config) -> ScrResult<Self> {
        Self::init_with_oracle(world, config, Box::new(NoOracle))
    }

    pub fn init_with_oracle(
        world: Arc<dyn Communicator>,
        config: Config,
        oracle: Box<dyn SecondsRemaining>,
    ) -> ScrResult<Self> {
        if !config.enabled {
            return Err(ScrError::Other(format_err!("scr is disabled")));
        }

        let ctx = Context::new(world, config).map_err(ScrError::fatal)?;

        // one descriptor synthesized from the flat knobs
        let mut ckptdesc_hash = Hash::new();
        {
            let entry = ckptdesc_hash.set("0");
            entry.set_value(
                descriptor::KEY_BASE,
                ctx.config.cache_base.to_string_lossy(),
            );
            entry.set_value(descriptor::KEY_TYPE, ctx.config.copy_type.as_str());
            match ctx.config.copy_type {
                CopyType::Partner => {
                    entry.set_value_u64(
                        descriptor::KEY_HOP_DISTANCE,
                        ctx.config.hop_distance as u64,
                    );
                }
                CopyType::Xor => {
                    entry.set_value_u64(
                        descriptor::KEY_HOP_DISTANCE,
                        ctx.config.hop_distance as u64,
                    );
                    entry.set_value_u64(descriptor::KEY_SET_SIZE, ctx.config.set_size as u64);
                }
                CopyType::Local => {}
            }
        }
        let descs = CkptDesc::create_list(&ctx, &ckptdesc_hash)?;

        // without an every-checkpoint descriptor nothing protects the run
        if !descs.iter().any(|d| d.enabled && d.interval == 1) {
            return Err(ScrError::fatal(format_err!(
                "no enabled checkpoint descriptor with interval 1"
            )));
        }

        // node master prepares the control and cache directories
        if ctx.am_node_master() {
            proxmox_sys::fs::create_path(&ctx.cntl_prefix, None, None)
                .map_err(|err| {
                    ScrError::fatal(format_err!(
                        "failed to create control directory {:?} - {}",
                        ctx.cntl_prefix,
                        err
                    ))
                })?;
            for desc in descs.iter().filter(|d| d.enabled) {
                proxmox_sys::fs::create_path(&desc.directory, None, None).map_err(|err| {
                    ScrError::fatal(format_err!(
                        "failed to create cache directory {:?} - {}",
                        desc.directory,
                        err
                    ))
                })?;
            }
        }
        ctx.local.barrier().map_err(ScrError::fatal)?;

        // record the node count for the operator tooling
        let nodes = ctx
            .world
            .allreduce_i64(ctx.level.size() as i64, ReduceOp::Max)?;
        if ctx.am_node_master() {
            nodesfile::write(&ctx.nodes_file, nodes as u64)?;
        }

        // no resume of a previous run's async flush: start the transfer
        // file from scratch
        if ctx.am_node_master() {
            if let Err(err) = std::fs::remove_file(&ctx.transfer_file) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "failed to remove stale transfer file {:?} - {}",
                        ctx.transfer_file,
                        err
                    );
                }
            }
        }

        let mut halt_hash = Hash::new();
        if ctx.config.halt_seconds > 0 {
            halt_hash.set_value_u64(scr_cache::haltfile::KEY_SECONDS, ctx.config.halt_seconds);
        }

        ctx.world.barrier().map_err(ScrError::fatal)?;

        let mut engine = Scr {
            ctx,
            map: Filemap::new(),
            descs,
            ckpt_id: 0,
            in_checkpoint: false,
            need_checkpoint_count: 0,
            halt_hash,
            halted: false,
            oracle,
            flight: None,
            time_checkpoint_total: 0.0,
            time_checkpoint_count: 0,
            checkpoint_start: Instant::now(),
            last_checkpoint_end: Instant::now(),
        };

        // exit right away if the operator already asked for it
        engine.check_halt_and_act(0)?;

        // a global restart must come back from the parallel file system
        let mut fetch_enabled = engine.ctx.config.fetch;
        let mut flush_on_restart = engine.ctx.config.flush_on_restart;
        if engine.ctx.config.global_restart {
            flush_on_restart = true;
            fetch_enabled = false;
        }

        // pick up whatever filemaps the previous run left on this node
        scatter::scatter_filemaps(&engine.ctx, &mut engine.map)?;

        let mut recovered = false;
        if engine.ctx.config.distribute {
            recovered = engine.distribute_and_rebuild()?;
            if recovered {
                engine.trim_to_latest()?;
                if flush_on_restart {
                    engine.flush_sync(engine.ckpt_id)?;
                } else {
                    engine.check_flush()?;
                }
            }
        }

        if !recovered || engine.ctx.config.global_restart {
            cache::unlink_all(&engine.ctx, &mut engine.map)?;
            engine.ckpt_id = 0;
            recovered = false;
        }

        if !recovered && fetch_enabled {
            recovered = engine.fetch_loop()?;
        }

        if !recovered {
            cache::unlink_all(&engine.ctx, &mut engine.map)?;
            engine.ckpt_id = 0;
        }

        engine.ctx.world.barrier().map_err(ScrError::fatal)?;
        engine.last_checkpoint_end = Instant::now();

        Ok(engine)
    }

    /// Newest-first: distribute, rebuild and keep the first checkpoint that
    /// comes back whole; purge every one that does not.
    fn distribute_and_rebuild(&mut self) -> Result<bool, Error> {
        let mut recovered = false;

        loop {
            cache::clean_files(&self.ctx, &mut self.map)?;

            let latest = self.map.latest_checkpoint().map(|id| id as i64).unwrap_or(-1);
            let max_id = self.ctx.world.allreduce_i64(latest, ReduceOp::Max)?;
            if max_id < 0 {
                break;
            }
            let id = max_id as CheckpointId;

            if self.ctx.my_rank_world() == 0 {
                log::info!("attempting to distribute and rebuild checkpoint {}", id);
            }

            let mut rebuilt = false;
            if let Some(desc) = distribute::distribute_ckptdescs(&self.ctx, &mut self.map, id)? {
                cache::checkpoint_dir_create(&self.ctx, &desc, id)?;
                distribute::distribute_files(&self.ctx, &mut self.map, &desc, id)?;

                if rebuild::rebuild_files(&self.ctx, &mut self.map, &desc, id)? {
                    rebuilt = true;
                    self.ckpt_id = id;

                    // distribution may have dropped our descriptor entry
                    // along with an unneeded shard; put it back
                    self.map
                        .set_desc(id, self.ctx.my_rank_world(), desc.store_to_hash());
                    self.map.write(&self.ctx.map_file)?;

                    let flush_file = FlushFile::new(&self.ctx.flush_file);
                    if self.ctx.am_node_master() {
                        flush_file.location_set(id, FlushLocation::Cache)?;
                    }

                    // if any node remembers this checkpoint on the parallel
                    // file system, everyone records it
                    let in_pfs = self.ctx.am_node_master()
                        && flush_file.location_test(id, FlushLocation::Pfs)?;
                    if !alltrue(self.ctx.world.as_ref(), !in_pfs)? {
                        if self.ctx.am_node_master() {
                            flush_file.location_set(id, FlushLocation::Pfs)?;
                        }
                    }

                    // a flush interrupted by the restart is forgotten
                    if self.ctx.am_node_master() {
                        flush_file.location_unset(id, FlushLocation::Flushing)?;
                    }
                }
            }

            if rebuilt {
                if self.ctx.my_rank_world() == 0 {
                    log::info!("rebuilt checkpoint {}", id);
                }
                recovered = true;
                break;
            }

            if self.ctx.my_rank_world() == 0 {
                log::info!("failed to distribute and rebuild checkpoint {}", id);
            }
            cache::checkpoint_delete(&self.ctx, &mut self.map, id)?;
        }

        Ok(recovered)
    }

    /// After a successful rebuild only the latest checkpoint is kept.
    fn trim_to_latest(&mut self) -> Result<(), Error> {
        if self.ckpt_id == 0 {
            return Ok(());
        }
        if self.ctx.my_rank_world() == 0 {
            log::info!("deleting excess checkpoints");
        }

        loop {
            let num = self.map.num_checkpoints() as i64;
            let max_num = self.ctx.world.allreduce_i64(num, ReduceOp::Max)?;
            if max_num <= 1 {
                break;
            }

            let oldest = self
                .map
                .oldest_checkpoint()
                .map(|id| id as i64)
                .unwrap_or(i64::MAX);
            let min_id = self.ctx.world.allreduce_i64(oldest, ReduceOp::Min)?;
            if min_id as CheckpointId != self.ckpt_id {
                cache::checkpoint_delete(&self.ctx, &mut self.map, min_id as CheckpointId)?;
            }
        }

        Ok(())
    }

    /// Walk the PFS catalog until a checkpoint fetches cleanly: start at
    /// the current link, then fall back through the index cursor, marking
    /// failures as we go.
    fn fetch_loop(&mut self) -> Result<bool, Error> {
        let current = self.ctx.config.prefix.join(CURRENT_LINK);

        let mut index = if self.ctx.my_rank_world() == 0 {
            Some(Index::read(&self.ctx.config.prefix)?)
        } else {
            None
        };

        let mut cursor: Option<CheckpointId> = None;
        loop {
            // rank 0 picks the next candidate directory
            let mut target = String::new();
            if let Some(index) = index.as_mut() {
                if let Ok(link) = std::fs::read_link(&current) {
                    target = link.to_string_lossy().into_owned();
                }

                if !target.is_empty() {
                    cursor = index.checkpoint_id_by_dir(&target);
                } else if let Some((id, dir)) = index.most_recent_complete(cursor) {
                    cursor = Some(id);
                    target = dir;
                }

                if !target.is_empty() {
                    if let Some(id) = cursor {
                        index.mark_fetched(id, &target);
                        index.write()?;
                    }
                }
            }

            let target_bytes = self.ctx.world.bcast(0, target.into_bytes())?;
            let target = String::from_utf8_lossy(&target_bytes).into_owned();

            let fetch_dir = if target.is_empty() {
                None
            } else {
                Some(self.ctx.config.prefix.join(&target))
            };
            let had_dir = fetch_dir.is_some();

            match fetch::fetch_files(&self.ctx, &mut self.map, &self.descs, fetch_dir)? {
                Some(id) => {
                    self.ckpt_id = id;
                    if self.ctx.my_rank_world() == 0 {
                        if current.symlink_metadata().is_ok() {
                            std::fs::remove_file(&current)?;
                        }
                        std::os::unix::fs::symlink(&target, &current)?;
                    }
                    return Ok(true);
                }
                None => {
                    if self.ctx.my_rank_world() == 0 {
                        if current.symlink_metadata().is_ok() {
                            let _ = std::fs::remove_file(&current);
                        }
                        if let (Some(index), Some(id)) = (index.as_mut(), cursor) {
                            if !target.is_empty() {
                                index.mark_failed(id, &target);
                                index.write()?;
                            }
                        }
                    }
                    if !had_dir {
                        // the catalog is exhausted
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Should the application take a checkpoint now?
    pub fn need_checkpoint(&mut self) -> ScrResult<bool> {
        self.need_checkpoint_count += 1;

        let mut flag = halt::check_halt_and_decrement(
            &self.ctx,
            &mut self.halt_hash,
            self.oracle.as_ref(),
            HaltMode::TestButDontHalt,
            0,
        )?;

        if self.ctx.my_rank_world() == 0 {
            let config = &self.ctx.config;

            if !flag
                && config.checkpoint_interval > 0
                && self.need_checkpoint_count % config.checkpoint_interval == 0
            {
                flag = true;
            }

            if !flag && config.checkpoint_seconds > 0 {
                let since = self.last_checkpoint_end.elapsed().as_secs();
                if since >= config.checkpoint_seconds {
                    flag = true;
                }
            }

            if !flag && config.checkpoint_overhead > 0.0 {
                if self.time_checkpoint_count == 0 {
                    // no cost estimate yet; take one checkpoint to get one
                    flag = true;
                } else {
                    let avg = self.time_checkpoint_total / self.time_checkpoint_count as f64;
                    let idle = self.last_checkpoint_end.elapsed().as_secs_f64();
                    let percent = avg / (idle + avg) * 100.0;
                    if percent < config.checkpoint_overhead {
                        flag = true;
                    }
                }
            }

            // with no criterion configured, always say yes
            if !flag
                && config.checkpoint_interval == 0
                && config.checkpoint_seconds == 0
                && config.checkpoint_overhead <= 0.0
            {
                flag = true;
            }
        }

        let flag_bytes = self
            .ctx
            .world
            .bcast(0, (flag as i64).to_le_bytes().to_vec())?;
        Ok(i64::from_le_bytes(flag_bytes.try_into().unwrap()) != 0)
    }

    /// Open a checkpoint window: assign the next id, make room in cache and
    /// create the checkpoint directory.
    pub fn start_checkpoint(&mut self) -> ScrResult<()> {
        if self.in_checkpoint {
            return Err(ScrError::fatal(format_err!(
                "complete_checkpoint must be called before start_checkpoint is called again"
            )));
        }

        // nobody deletes anything until everyone is ready to start
        self.ctx.world.barrier().map_err(ScrError::fatal)?;
        self.in_checkpoint = true;

        self.ckpt_id += 1;
        let id = self.ckpt_id;

        let di = self
            .desc_index(id)
            .ok_or_else(|| ScrError::fatal(format_err!("no descriptor for checkpoint {}", id)))?;

        self.checkpoint_start = Instant::now();

        // quota pressure triggers a sweep of this base: evict everything
        // older, taking the non-flushing checkpoints first and waiting out
        // any in-flight flush before evicting its checkpoint
        let quota = cache::cache_size_for_base(&self.ctx, &self.descs[di].base);
        if quota > 0 {
            let base = self.descs[di].base.clone();
            let ckpts = self.map.list_checkpoints();

            let in_base = |map: &Filemap, ctx: &Context, ckpt: CheckpointId| {
                descriptor::base_from_filemap(map, ckpt, ctx.my_rank_world())
                    .map(|b| b == base)
                    .unwrap_or(false)
            };

            let nckpts_base = ckpts
                .iter()
                .filter(|&&c| in_base(&self.map, &self.ctx, c))
                .count();

            if nckpts_base >= quota {
                let mut deferred: Vec<CheckpointId> = Vec::new();
                for &ckpt in &ckpts {
                    if !in_base(&self.map, &self.ctx, ckpt) {
                        continue;
                    }
                    if flush::is_flushing(&self.ctx, ckpt)? {
                        deferred.push(ckpt);
                    } else {
                        cache::checkpoint_delete(&self.ctx, &mut self.map, ckpt)?;
                    }
                }
                for ckpt in deferred {
                    self.flush_async_wait()?;
                    cache::checkpoint_delete(&self.ctx, &mut self.map, ckpt)?;
                }
            }
        }

        // the descriptor lands in the filemap before the directory exists
        let desc_hash = self.descs[di].store_to_hash();
        self.map.set_desc(id, self.ctx.my_rank_world(), desc_hash);
        self.map.write(&self.ctx.map_file)?;

        cache::checkpoint_dir_create(&self.ctx, &self.descs[di], id)?;

        if self.ctx.my_rank_world() == 0 {
            log::info!("starting checkpoint {}", id);
        }
        Ok(())
    }

    /// Map a user path into the current checkpoint's cache directory.
    /// Inside a checkpoint window the file is recorded in the filemap;
    /// outside it must already exist.
    pub fn route_file(&mut self, file: &Path) -> ScrResult<PathBuf> {
        let name = file
            .file_name()
            .ok_or_else(|| format_err!("cannot route path without a file name: {:?}", file))?;

        let di = self
            .desc_index(self.ckpt_id)
            .ok_or_else(|| format_err!("no descriptor for checkpoint {}", self.ckpt_id))?;
        let newfile = cache::checkpoint_dir(&self.descs[di], self.ckpt_id).join(name);

        if self.in_checkpoint {
            self.map.add_file(self.ckpt_id, self.ctx.my_rank_world(), &newfile);
            self.map.write(&self.ctx.map_file)?;
        } else if !newfile.is_file() {
            return Err(ScrError::Other(format_err!(
                "routed file {:?} does not exist in cache",
                newfile
            )));
        }

        Ok(newfile)
    }

    /// Close the checkpoint window: write sidecars, apply redundancy and
    /// decide collectively whether the checkpoint stands.
    pub fn complete_checkpoint(&mut self, valid: bool) -> ScrResult<bool> {
        if !self.in_checkpoint {
            return Err(ScrError::fatal(format_err!(
                "start_checkpoint must be called before complete_checkpoint"
            )));
        }
        let id = self.ckpt_id;
        let my_rank = self.ctx.my_rank_world();

        for file in self.map.list_files(id, my_rank) {
            let filesize = fileio::file_size(&file).unwrap_or(0);
            let meta = Meta::new(
                &file,
                scr_api_types::FileKind::Full,
                filesize,
                id,
                my_rank,
                self.ctx.ranks_world(),
                valid,
            );
            meta.write(&file)?;
        }

        let di = self
            .desc_index(id)
            .ok_or_else(|| ScrError::fatal(format_err!("no descriptor for checkpoint {}", id)))?;
        let (ok, _bytes) = {
            let (descs, map) = (&self.descs, &mut self.map);
            crate::redundancy::copy_files(&self.ctx, map, &descs[di], id)?
        };

        let cost = self.checkpoint_start.elapsed().as_secs_f64();
        self.time_checkpoint_total += cost;
        self.time_checkpoint_count += 1;

        if self.ctx.my_rank_world() == 0 {
            log::info!("completed checkpoint {} (ok={})", id, ok);
        }

        if ok {
            if self.ctx.am_node_master() {
                FlushFile::new(&self.ctx.flush_file).location_set(id, FlushLocation::Cache)?;
            }
            self.check_halt_and_act(1)?;
            if !self.halted {
                self.check_flush()?;
            }
        } else {
            cache::checkpoint_delete(&self.ctx, &mut self.map, id)?;
        }

        // good moment to check on an ongoing async flush
        if let Some(flight) = self.flight.take() {
            let (done, bytes) = flush_async::test(&self.ctx, &self.map, &flight)?;
            if done {
                flush_async::complete(&self.ctx, &self.map, &flight)?;
            } else {
                if self.ctx.my_rank_world() == 0 && flight.bytes_total > 0.0 {
                    log::info!(
                        "flush of checkpoint {} is {:.0}% complete",
                        flight.id,
                        bytes / flight.bytes_total * 100.0
                    );
                }
                self.flight = Some(flight);
            }
        }

        self.ctx.world.barrier().map_err(ScrError::fatal)?;
        self.in_checkpoint = false;
        self.last_checkpoint_end = Instant::now();

        Ok(ok)
    }

    /// Drain or stop any asynchronous flush and make sure the latest
    /// checkpoint reaches the parallel file system.
    pub fn finalize(mut self) -> ScrResult<()> {
        if self.ctx.my_rank_world() == 0 {
            // reaching finalize means the job does not want a restart
            halt::halt(&self.ctx, &mut self.halt_hash, "SCR_FINALIZE_CALLED")?;
        }

        if let Some(flight) = self.flight.take() {
            if flight.id == self.ckpt_id {
                // about to flush the same checkpoint synchronously
                self.stop_async_flight(&flight)?;
            } else {
                flush_async::wait(&self.ctx, &self.map, &flight)?;
            }
        }

        if self.ckpt_id > 0 && flush::need_flush(&self.ctx, self.ckpt_id)? {
            flush::flush_files(&self.ctx, &self.map, self.ckpt_id)?;
        }

        Ok(())
    }

    /// Latest checkpoint in cache (0 when none).
    pub fn checkpoint_id(&self) -> CheckpointId {
        self.ckpt_id
    }

    /// Whether a halt condition fired (only observable when
    /// `exit_on_halt` is disabled).
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn filemap(&self) -> &Filemap {
        &self.map
    }

    fn desc_index(&self, id: CheckpointId) -> Option<usize> {
        let desc = descriptor::ckptdesc_get(&self.descs, id)?;
        self.descs.iter().position(|d| d.index == desc.index)
    }

    /// Flush by interval policy, async or sync.
    fn check_flush(&mut self) -> Result<(), Error> {
        let config = &self.ctx.config;
        if config.flush == 0 || self.ckpt_id == 0 || self.ckpt_id % config.flush != 0 {
            return Ok(());
        }

        if config.flush_async {
            // never two async flushes at once
            if self.flight.is_some() {
                self.flush_async_wait()?;
            }
            self.flight = flush_async::start(&self.ctx, &self.map, self.ckpt_id)?;
        } else {
            flush::flush_files(&self.ctx, &self.map, self.ckpt_id)?;
        }
        Ok(())
    }

    /// Synchronous flush of `id`, first waiting out any in-flight async
    /// flush (which may already cover it).
    fn flush_sync(&mut self, id: CheckpointId) -> Result<(), Error> {
        if self.flight.is_some() {
            self.flush_async_wait()?;
            if !flush::need_flush(&self.ctx, id)? {
                return Ok(());
            }
        }
        flush::flush_files(&self.ctx, &self.map, id)?;
        Ok(())
    }

    fn flush_async_wait(&mut self) -> Result<(), Error> {
        if let Some(flight) = self.flight.take() {
            flush_async::wait(&self.ctx, &self.map, &flight)?;
        }
        Ok(())
    }

    fn stop_async_flight(&mut self, flight: &AsyncFlush) -> Result<(), Error> {
        flush_async::stop(&self.ctx)?;
        // the stopped transfer no longer counts as flushing
        if self.ctx.am_node_master() {
            FlushFile::new(&self.ctx.flush_file)
                .location_unset(flight.id, FlushLocation::Flushing)?;
        }
        Ok(())
    }

    /// Evaluate the halt conditions; when one fires, drain the flush
    /// pipeline, push the latest checkpoint to the parallel file system and
    /// terminate (or mark halted when process exit is disabled).
    fn check_halt_and_act(&mut self, decrement: u64) -> Result<bool, Error> {
        let need = halt::check_halt_and_decrement(
            &self.ctx,
            &mut self.halt_hash,
            self.oracle.as_ref(),
            HaltMode::TestAndHalt,
            decrement,
        )?;
        if !need {
            return Ok(false);
        }

        if let Some(flight) = self.flight.take() {
            if flight.id == self.ckpt_id {
                self.stop_async_flight(&flight)?;
            } else {
                flush_async::wait(&self.ctx, &self.map, &flight)?;
            }
        }

        if self.ckpt_id > 0 {
            flush::flush_files(&self.ctx, &self.map, self.ckpt_id)?;
        }

        // nobody exits before everyone has flushed
        self.ctx.world.barrier()?;

        self.halted = true;
        if self.ctx.config.exit_on_halt {
            std::process::exit(0);
        }
        Ok(true)
    }
}
