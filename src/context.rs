//! Run context: configuration, communicators and control-directory paths.
//!
//! One `Context` per library instance; nothing here mutates after init, so
//! the engine can borrow it freely.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};

use scr_api_types::{
    FLUSH_FILE_NAME, HALT_FILE_NAME, MASTER_FILEMAP_NAME, NODES_FILE_NAME, TRANSFER_FILE_NAME,
};
use scr_comm::Communicator;

use crate::config::Config;

pub struct Context {
    pub config: Config,

    /// All ranks of the run.
    pub world: Arc<dyn Communicator>,
    /// Ranks on this node.
    pub local: Arc<dyn Communicator>,
    /// Ranks across nodes sharing my node-local rank.
    pub level: Arc<dyn Communicator>,

    pub hostname: String,
    pub page_size: usize,

    /// `<cntl_base>/<user>/scr.<jobid>`
    pub cntl_prefix: PathBuf,
    pub halt_file: PathBuf,
    pub flush_file: PathBuf,
    pub nodes_file: PathBuf,
    /// This process' filemap shard: `filemap_<local_rank>.scrinfo`
    pub map_file: PathBuf,
    pub master_map_file: PathBuf,
    pub transfer_file: PathBuf,
}

impl Context {
    /// Build the run context: duplicate of the world plus the node-local and
    /// cross-node level communicators, derived by splitting on hostname.
    /// Collective over `world`.
    pub fn new(world: Arc<dyn Communicator>, config: Config) -> Result<Self, Error> {
        let hostname = match &config.hostname {
            Some(name) => name.clone(),
            None => nix::unistd::gethostname()
                .map_err(|err| format_err!("gethostname failed - {}", err))?
                .to_string_lossy()
                .into_owned(),
        };

        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(4096);

        // group ranks by hostname: color is the lowest world rank on the
        // same node
        let gathered = world.gather(0, hostname.as_bytes())?;
        let all_hostnames: Vec<String> = match gathered {
            Some(parts) => parts
                .into_iter()
                .map(|p| String::from_utf8_lossy(&p).into_owned())
                .collect(),
            None => Vec::new(),
        };
        let bytes = world.bcast(0, serde_json::to_vec(&all_hostnames)?)?;
        let all_hostnames: Vec<String> = serde_json::from_slice(&bytes)?;

        let color = all_hostnames
            .iter()
            .position(|h| *h == hostname)
            .expect("own hostname missing from gather") as u64;
        let local = world.split(color, world.rank() as u64)?;
        let level = world.split(local.rank() as u64, world.rank() as u64)?;

        let cntl_prefix = config
            .cntl_base
            .join(config.username()?)
            .join(format!("scr.{}", config.jobid()?));

        let halt_file = cntl_prefix.join(HALT_FILE_NAME);
        let flush_file = cntl_prefix.join(FLUSH_FILE_NAME);
        let nodes_file = cntl_prefix.join(NODES_FILE_NAME);
        let map_file = cntl_prefix.join(format!("filemap_{}.scrinfo", local.rank()));
        let master_map_file = cntl_prefix.join(MASTER_FILEMAP_NAME);
        let transfer_file = cntl_prefix.join(TRANSFER_FILE_NAME);

        Ok(Self {
            config,
            world,
            local,
            level,
            hostname,
            page_size,
            cntl_prefix,
            halt_file,
            flush_file,
            nodes_file,
            map_file,
            master_map_file,
            transfer_file,
        })
    }

    pub fn my_rank_world(&self) -> usize {
        self.world.rank()
    }

    pub fn ranks_world(&self) -> usize {
        self.world.size()
    }

    pub fn my_rank_local(&self) -> usize {
        self.local.rank()
    }

    pub fn am_node_master(&self) -> bool {
        self.local.rank() == 0
    }

    /// Message-exchange buffer size, aligned down to the page size.
    pub fn mpi_buf_size(&self) -> usize {
        let size = self.config.mpi_buf_size;
        if size >= self.page_size {
            size - (size % self.page_size)
        } else {
            size.max(1)
        }
    }

    /// Unrecoverable condition on the critical path: tear down the run.
    pub fn abort(&self, msg: &str) -> ! {
        self.world.abort(msg)
    }
}
