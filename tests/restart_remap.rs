//! Restart with re-homed ranks: world rank 0 of the first run comes back as
//! world rank 2 and vice versa. After the filemap scatter and the file
//! distribution every rank must own exactly its own files again.

mod common;

use std::path::Path;
use std::sync::Arc;

use scr::{Communicator, CopyType, Scr};

use common::{base_config, run_world, unique_root, write_routed};

const RANKS: usize = 4;

/// First run: ranks 0,1 on node0 and 2,3 on node1.
fn hostname_run_a(rank: usize) -> String {
    format!("node{}", rank / 2)
}

/// Second run: ranks 0 and 2 have traded places.
fn hostname_run_b(rank: usize) -> String {
    match rank {
        0 => "node1".to_owned(),
        2 => "node0".to_owned(),
        r => format!("node{}", r / 2),
    }
}

fn config_for(root: &Path, hostname: String) -> scr::Config {
    let mut config = base_config(root, &hostname);
    config.copy_type = CopyType::Partner;
    config.hop_distance = 1;
    // keep several checkpoints alive across the restart
    config.cache_size = 8;
    config
}

#[test]
fn restart_with_remapped_ranks() {
    let root = unique_root("remap");

    let root_a = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let config = config_for(&root_a, hostname_run_a(rank));
        let mut engine = Scr::init(comm, config).unwrap();

        for ckpt in 1..=3u8 {
            engine.start_checkpoint().unwrap();
            write_routed(
                &mut engine,
                &format!("rank_{}.ckpt", rank),
                512,
                rank as u8 * 16 + ckpt,
            );
            assert!(engine.complete_checkpoint(true).unwrap());
        }
    });

    let root_b = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let config = config_for(&root_b, hostname_run_b(rank));
        let engine = Scr::init(comm, config).unwrap();

        // the newest checkpoint came back whole
        assert_eq!(engine.checkpoint_id(), 3);

        // my filemap lists exactly my own files (plus my partner's copies),
        // and my own payload survived the re-homing byte for byte
        let map = engine.filemap();
        let mine = map.list_files(3, rank);
        let own: Vec<_> = mine
            .iter()
            .filter(|f| f.file_name().unwrap().to_string_lossy() == format!("rank_{}.ckpt", rank))
            .collect();
        assert_eq!(own.len(), 1, "rank {} does not own its file: {:?}", rank, mine);

        let data = std::fs::read(own[0]).unwrap();
        assert_eq!(data.len(), 512);
        assert!(data.iter().all(|&b| b == rank as u8 * 16 + 3));

        // everything the filemap promises is on disk
        for file in map.list_files(3, rank) {
            assert!(file.is_file(), "missing {:?}", file);
        }
    });

    let _ = std::fs::remove_dir_all(&root);
}
