//! Scalable checkpoint/restart for tightly-coupled parallel jobs.
//!
//! Each rank of a fixed-size group periodically writes opaque state files;
//! the library keeps them on node-local cache storage with a redundancy
//! scheme (LOCAL, PARTNER or XOR parity), occasionally drains completed
//! checkpoints to a shared parallel file system, and on restart rebuilds
//! the most recent viable checkpoint from cache before falling back to the
//! parallel file system.
//!
//! The five-call lifecycle lives on [`Scr`]: `init`, `need_checkpoint`,
//! `start_checkpoint` / `route_file` / `complete_checkpoint`, `finalize`.

use anyhow::Error;

pub mod cache;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod exchange;
pub mod fetch;
pub mod fileio;
pub mod flush;
pub mod flush_async;
pub mod halt;
pub mod index;
pub mod rebuild;
pub mod redundancy;
pub mod scatter;
pub mod summary;
pub mod swap;

pub use config::Config;
pub use context::Context;
pub use descriptor::CkptDesc;
pub use engine::Scr;

pub use scr_api_types::{CheckpointId, CopyType, FileKind, FlushLocation, Rank};
pub use scr_cache::{Filemap, Meta};
pub use scr_comm::{Communicator, LocalComm};
pub use scr_hash::Hash;

/// Error of the public lifecycle API.
///
/// `Fatal` marks conditions under which the run as a whole cannot continue
/// (message-passing failure, unrecoverable I/O on the critical path); the
/// top-level lifecycle converts it into a runtime-wide abort. Everything
/// else is an ordinary failure the caller may handle.
#[derive(thiserror::Error, Debug)]
pub enum ScrError {
    #[error("fatal: {0}")]
    Fatal(#[source] Error),

    #[error(transparent)]
    Other(#[from] Error),
}

impl ScrError {
    pub fn fatal(err: Error) -> Self {
        ScrError::Fatal(err)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ScrError::Fatal(_))
    }
}

pub type ScrResult<T> = Result<T, ScrError>;
