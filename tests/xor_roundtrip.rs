//! Four ranks in one XOR set: encode a checkpoint, destroy one member's
//! files and parity, restart, and verify the rebuild restores every byte.

mod common;

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use scr::redundancy::read_xor_header;
use scr::{CheckpointId, Communicator, CopyType, Scr};

use common::{base_config, run_world, unique_root, write_routed};

const RANKS: usize = 4;

fn config_for(root: &std::path::Path, rank: usize) -> scr::Config {
    // one rank per node so the set spans four nodes
    let mut config = base_config(root, &format!("node{}", rank));
    config.copy_type = CopyType::Xor;
    config.set_size = RANKS;
    config.crc_on_copy = true;
    config
}

fn data_files(rank: usize) -> [(String, usize, u8); 2] {
    [
        (format!("rank_{}_a", rank), 1024, rank as u8),
        (format!("rank_{}_b", rank), 2048, rank as u8 + 0x10),
    ]
}

fn checkpoint_dir(root: &std::path::Path, rank: usize, id: CheckpointId) -> PathBuf {
    root.join("nodes")
        .join(format!("node{}", rank))
        .join("cache")
        .join("tester")
        .join("scr.job1")
        .join("index.0")
        .join(format!("checkpoint.{}", id))
}

#[test]
fn xor_encode_and_rebuild() {
    let root = unique_root("xor");
    let root_for_threads = root.clone();

    // first run: take one checkpoint
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let config = config_for(&root_for_threads, rank);
        let mut engine = Scr::init(comm, config).unwrap();

        engine.start_checkpoint().unwrap();
        for (name, len, fill) in data_files(rank) {
            write_routed(&mut engine, &name, len, fill);
        }
        assert!(engine.complete_checkpoint(true).unwrap());

        // two data files plus one parity chunk, expected count included
        let map = engine.filemap();
        let files = map.list_files(1, rank);
        assert_eq!(files.len(), 3);
        assert_eq!(map.num_expected_files(1, rank), Some(3));

        // parity payload is ceil(3072 / 3) bytes past the header
        let chunk = files
            .iter()
            .find(|f| f.extension().map(|e| e == "xor").unwrap_or(false))
            .expect("parity chunk missing");
        let mut fd = File::open(chunk).unwrap();
        let (_header, payload_off) = read_xor_header(&mut fd).unwrap();
        let total = std::fs::metadata(chunk).unwrap().len();
        assert_eq!(total - payload_off, 1024);
    });

    // kill rank 2's files, parity and sidecars, but leave its filemap
    let dir = checkpoint_dir(&root, 2, 1);
    let mut removed = 0;
    for entry in std::fs::read_dir(&dir).unwrap() {
        let entry = entry.unwrap();
        std::fs::remove_file(entry.path()).unwrap();
        removed += 1;
    }
    assert!(removed >= 3, "expected to remove rank 2's files");

    // second run: same mapping, the set rebuilds the missing member
    let root_for_threads = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let config = config_for(&root_for_threads, rank);
        let engine = Scr::init(comm, config).unwrap();
        assert_eq!(engine.checkpoint_id(), 1);

        for (name, len, fill) in data_files(rank) {
            let path = checkpoint_dir(&root_for_threads, rank, 1).join(&name);
            let data = std::fs::read(&path).unwrap();
            assert_eq!(data.len(), len, "wrong size for {}", name);
            assert!(data.iter().all(|&b| b == fill), "wrong bytes in {}", name);
        }
    });

    let _ = std::fs::remove_dir_all(&root);
}
