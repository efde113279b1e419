//! PARTNER redundancy across two nodes of three ranks: every rank ends up
//! holding its partner's copy, and losing one rank's originals still
//! restarts cleanly from the surviving replica.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use scr::{CheckpointId, Communicator, CopyType, Scr};

use common::{base_config, run_world, unique_root, write_routed};

const RANKS: usize = 6;

fn hostname_of(rank: usize) -> String {
    // ranks 0-2 on node0, ranks 3-5 on node1
    format!("node{}", rank / 3)
}

fn config_for(root: &Path, rank: usize) -> scr::Config {
    let mut config = base_config(root, &hostname_of(rank));
    config.copy_type = CopyType::Partner;
    config.hop_distance = 1;
    config.crc_on_copy = true;
    config
}

fn checkpoint_dir(root: &Path, rank: usize, id: CheckpointId) -> PathBuf {
    root.join("nodes")
        .join(hostname_of(rank))
        .join("cache")
        .join("tester")
        .join("scr.job1")
        .join("index.0")
        .join(format!("checkpoint.{}", id))
}

#[test]
fn partner_copy_and_restart() {
    let root = unique_root("partner");

    let root_a = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let config = config_for(&root_a, rank);
        let mut engine = Scr::init(comm, config).unwrap();

        engine.start_checkpoint().unwrap();
        write_routed(&mut engine, &format!("rank_{}.ckpt", rank), 4096, rank as u8);
        // a zero-byte member exercises the short-message sentinel
        write_routed(&mut engine, &format!("rank_{}.empty", rank), 0, 0);
        assert!(engine.complete_checkpoint(true).unwrap());

        // own two files plus the partner's two replicas
        let map = engine.filemap();
        assert_eq!(map.num_files(1, rank), 2);
        let partner_ranks: Vec<_> = map
            .list_ranks_by_checkpoint(1)
            .into_iter()
            .filter(|&r| r != rank)
            .collect();
        assert_eq!(partner_ranks.len(), 1);
        let partner = partner_ranks[0];
        assert_eq!(map.num_files(1, partner), 2);
        assert_eq!(map.num_expected_files(1, partner), Some(2));

        // the partner lives on the other node
        let tag = map.get_tag(1, partner, "PARTNER").unwrap();
        assert_ne!(tag, hostname_of(rank));

        // replica bytes match the partner's payload
        let copy = checkpoint_dir(&root_a, rank, 1).join(format!("rank_{}.ckpt", partner));
        let data = std::fs::read(&copy).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|&b| b == partner as u8));
        let empty = checkpoint_dir(&root_a, rank, 1).join(format!("rank_{}.empty", partner));
        assert_eq!(std::fs::metadata(&empty).unwrap().len(), 0);
    });

    // lose rank 1's original files (keep the replica on the other node)
    let dir = checkpoint_dir(&root, 1, 1);
    for name in ["rank_1.ckpt", "rank_1.ckpt.scr", "rank_1.empty", "rank_1.empty.scr"] {
        std::fs::remove_file(dir.join(name)).unwrap();
    }

    let root_b = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let config = config_for(&root_b, rank);
        let engine = Scr::init(comm, config).unwrap();
        assert_eq!(engine.checkpoint_id(), 1);

        let path = checkpoint_dir(&root_b, rank, 1).join(format!("rank_{}.ckpt", rank));
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|&b| b == rank as u8));
    });

    let _ = std::fs::remove_dir_all(&root);
}
