//! On-node persistent state for the scr library.
//!
//! Everything in this crate is local to one node: the filemap (the
//! authoritative record of which files this node holds for which
//! (checkpoint, rank) pairs), the per-file sidecar metadata, the
//! flush-location file, the halt file and the nodes file.

pub mod filemap;
pub mod flushfile;
pub mod haltfile;
pub mod meta;
pub mod nodesfile;

pub use filemap::Filemap;
pub use flushfile::FlushFile;
pub use haltfile::HaltFile;
pub use meta::Meta;
