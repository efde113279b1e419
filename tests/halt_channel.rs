//! Operator-driven halt: a checkpoints-remaining budget in the halt file
//! stops the run after that many checkpoints, flushing the last one first.

mod common;

use std::sync::Arc;

use scr::summary;
use scr::{Communicator, CopyType, Hash, Scr};

use common::{base_config, run_world, unique_root, write_routed};

const RANKS: usize = 2;

#[test]
fn checkpoint_budget_halts_the_run() {
    let root = unique_root("halt");

    // operator allows exactly one more checkpoint (rank 0 reads node0's
    // halt file)
    let halt_file = root
        .join("nodes")
        .join("node0")
        .join("cntl")
        .join("tester")
        .join("scr.job1")
        .join("halt.scrinfo");
    std::fs::create_dir_all(halt_file.parent().unwrap()).unwrap();
    let mut halt = Hash::new();
    halt.set_value_u64("CHECKPOINTS", 1);
    halt.write(&halt_file).unwrap();

    let root_t = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let mut config = base_config(&root_t, &format!("node{}", rank));
        config.copy_type = CopyType::Local;
        config.flush = 1;

        let mut engine = Scr::init(comm, config).unwrap();
        assert!(!engine.halted());

        // the budget allows this one
        assert!(engine.need_checkpoint().unwrap());
        engine.start_checkpoint().unwrap();
        write_routed(&mut engine, &format!("rank_{}.ckpt", rank), 128, rank as u8);
        assert!(engine.complete_checkpoint(true).unwrap());

        // the budget is exhausted now; the halt path flushed and marked us
        assert!(engine.halted());
    });

    // the halting path pushed checkpoint 1 to the parallel file system
    let prefix = root.join("pfs");
    let target = std::fs::read_link(prefix.join("scr.current")).unwrap();
    let (_, id) = summary::read(&prefix.join(&target), RANKS).unwrap();
    assert_eq!(id, 1);

    // and the halt file records why the job went down
    let halt = Hash::read(&halt_file).unwrap();
    assert_eq!(halt.get_value("EXIT_REASON"), Some("NO_CHECKPOINTS_LEFT"));
    assert_eq!(halt.get_u64("CHECKPOINTS"), Some(0));

    let _ = std::fs::remove_dir_all(&root);
}
