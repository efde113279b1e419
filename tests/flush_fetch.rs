//! Flush to the parallel file system and fetch back from it, including the
//! index-driven fallback when the current link points at a corrupt
//! checkpoint.

mod common;

use std::path::Path;
use std::sync::Arc;

use scr::index::Index;
use scr::summary;
use scr::{Communicator, CopyType, Hash, Scr};

use common::{base_config, run_world, unique_root, write_routed};

const RANKS: usize = 2;

fn config_for(root: &Path, rank: usize) -> scr::Config {
    let mut config = base_config(root, &format!("node{}", rank));
    config.copy_type = CopyType::Local;
    config
}

#[test]
fn sync_flush_writes_summary_and_link() {
    let root = unique_root("flush");

    let root_t = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let mut config = config_for(&root_t, rank);
        config.flush = 1; // flush every checkpoint
        config.crc_on_flush = true;

        let mut engine = Scr::init(comm, config).unwrap();
        engine.start_checkpoint().unwrap();
        write_routed(&mut engine, &format!("rank_{}.ckpt", rank), 1000 + rank, rank as u8);
        assert!(engine.complete_checkpoint(true).unwrap());
        engine.finalize().unwrap();
    });

    // the current link points at a directory whose summary lists every
    // rank's file with its size
    let current = root.join("pfs").join("scr.current");
    let target = std::fs::read_link(&current).unwrap();
    let dir = root.join("pfs").join(&target);

    let (summary_hash, id) = summary::read(&dir, RANKS).unwrap();
    assert_eq!(id, 1);
    let ckpt = summary_hash.get_kv(summary::KEY_CKPT, "1").unwrap();
    for rank in 0..RANKS {
        let file = ckpt
            .get_kv(summary::KEY_RANK, &rank.to_string())
            .and_then(|h| h.get_kv(summary::KEY_FILE, &format!("rank_{}.ckpt", rank)))
            .unwrap_or_else(|| panic!("rank {} missing from summary", rank));
        assert_eq!(file.get_u64(summary::KEY_SIZE), Some(1000 + rank as u64));
        assert!(file.get_crc32(summary::KEY_CRC).is_some());

        // and the bytes themselves are on the parallel file system
        let data = std::fs::read(dir.join(format!("rank_{}.ckpt", rank))).unwrap();
        assert_eq!(data.len(), 1000 + rank);
    }

    let index = Index::read(&root.join("pfs")).unwrap();
    assert_eq!(
        index.most_recent_complete(None).map(|(id, _)| id),
        Some(1)
    );

    let _ = std::fs::remove_dir_all(&root);
}

/// Build one fake flushed checkpoint directory under the prefix.
fn plant_checkpoint(prefix: &Path, id: u64, complete: bool, failed: bool, corrupt: bool) -> String {
    let dirname = format!("scr.2026-01-01.job1.{}", id);
    let dir = prefix.join(&dirname);
    std::fs::create_dir_all(&dir).unwrap();

    let mut data = Hash::new();
    for rank in 0..RANKS {
        let name = format!("rank_{}.ckpt", rank);
        std::fs::write(dir.join(&name), vec![id as u8; 256]).unwrap();
        let file_hash = data
            .set_kv(summary::KEY_RANK, rank.to_string())
            .set_kv(summary::KEY_FILE, name);
        file_hash.set_value_u64(summary::KEY_SIZE, 256);
    }
    summary::write(&dir, id, RANKS, true, &data).unwrap();

    if corrupt {
        std::fs::write(dir.join("summary.scr"), b"not a summary").unwrap();
    }

    let mut index = Index::read(prefix).unwrap();
    index.add_checkpoint_dir(id, &dirname);
    index.mark_flushed(id, &dirname);
    index.set_complete(id, &dirname, complete);
    if failed {
        index.mark_failed(id, &dirname);
    }
    index.write().unwrap();

    dirname
}

#[test]
fn fetch_falls_back_through_the_index() {
    let root = unique_root("fetch");
    let prefix = root.join("pfs");

    plant_checkpoint(&prefix, 100, true, false, false);
    plant_checkpoint(&prefix, 101, true, true, false);
    let dir102 = plant_checkpoint(&prefix, 102, true, false, true);

    std::os::unix::fs::symlink(&dir102, prefix.join("scr.current")).unwrap();

    let root_t = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let mut config = config_for(&root_t, rank);
        config.fetch = true;
        config.crc_on_flush = false;

        let engine = Scr::init(comm, config).unwrap();

        // 102 is corrupt, 101 is flagged failed: 100 wins
        assert_eq!(engine.checkpoint_id(), 100);

        let files = engine.filemap().list_files(100, rank);
        assert_eq!(files.len(), 1);
        let data = std::fs::read(&files[0]).unwrap();
        assert_eq!(data, vec![100u8; 256]);
    });

    // the current link was rewritten to the winner and 102 is now failed
    let target = std::fs::read_link(prefix.join("scr.current")).unwrap();
    assert_eq!(target, Path::new("scr.2026-01-01.job1.100"));

    let index = Index::read(&prefix).unwrap();
    assert_eq!(index.most_recent_complete(None).map(|(id, _)| id), Some(100));

    let _ = std::fs::remove_dir_all(&root);
}
