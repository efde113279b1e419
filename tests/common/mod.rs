//! Shared harness for the integration tests: an in-process world of ranks
//! on threads, per-"node" control and cache directories under one temp
//! root, and a minimal stand-in for the external transfer agent.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use scr::flush_async::{
    COMMAND_RUN, COMMAND_STOP, KEY_COMMAND, KEY_DESTINATION, KEY_FILES, KEY_SIZE, KEY_STATE,
    KEY_WRITTEN, STATE_STOP,
};
use scr::{Communicator, Config, Hash, LocalComm};

/// Fresh temp root with a shared `pfs` directory.
pub fn unique_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("scr-it-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("pfs")).unwrap();
    dir
}

/// Run `f(rank, comm)` on `n` threads sharing one in-process world.
pub fn run_world<F>(n: usize, f: F)
where
    F: Fn(usize, Arc<dyn Communicator>) + Send + Sync + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let f = Arc::new(f);
    let handles: Vec<_> = LocalComm::world(n)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let f = Arc::clone(&f);
            std::thread::Builder::new()
                .name(format!("rank{}", rank))
                .spawn(move || f(rank, comm))
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Configuration for one rank living on the simulated node `hostname`.
/// Control and cache bases are node-scoped subdirectories of `root`, the
/// prefix is the shared `pfs` directory.
pub fn base_config(root: &Path, hostname: &str) -> Config {
    let mut config = Config::default();
    config.username = Some("tester".to_owned());
    config.jobid = Some("job1".to_owned());
    config.hostname = Some(hostname.to_owned());
    config.cntl_base = root.join("nodes").join(hostname).join("cntl");
    config.cache_base = root.join("nodes").join(hostname).join("cache");
    config.prefix = root.join("pfs");
    config.mpi_buf_size = 4096;
    config.file_buf_size = 4096;
    config.cache_size = 2;
    config.flush = 0;
    config.fetch = false;
    config.distribute = true;
    config.exit_on_halt = false;
    config
}

/// Transfer file of the node `hostname` under `root`.
pub fn transfer_file(root: &Path, hostname: &str) -> PathBuf {
    root.join("nodes")
        .join(hostname)
        .join("cntl")
        .join("tester")
        .join("scr.job1")
        .join("transfer.scrinfo")
}

/// Minimal transfer agent: echoes the protocol states and, when asked,
/// starts moving files a fixed delay after the RUN command appears.
pub struct Agent {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Agent {
    pub fn spawn(transfer_file: PathBuf, progress_after: Option<Duration>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let mut run_since: Option<Instant> = None;
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
                if !transfer_file.exists() {
                    continue;
                }
                let mut locked = match Hash::lock_open_read(&transfer_file) {
                    Ok(locked) => locked,
                    Err(_) => continue,
                };

                match locked.hash.get_value(KEY_COMMAND) {
                    Some(COMMAND_STOP) => {
                        run_since = None;
                        locked.hash.set_value(KEY_STATE, STATE_STOP);
                    }
                    Some(COMMAND_RUN) => {
                        locked.hash.set_value(KEY_STATE, "RUN");
                        let since = *run_since.get_or_insert_with(Instant::now);

                        let make_progress = progress_after
                            .map(|delay| since.elapsed() >= delay)
                            .unwrap_or(false);
                        if make_progress {
                            move_files(&mut locked.hash);
                        }
                    }
                    _ => {}
                }

                locked.write_close_unlock().unwrap();
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

fn move_files(hash: &mut Hash) {
    let files: Vec<String> = match hash.get(KEY_FILES) {
        Some(files) => files.keys().map(|k| k.to_owned()).collect(),
        None => return,
    };
    for file in files {
        let entry = hash.get(KEY_FILES).and_then(|h| h.get(&file)).unwrap();
        let written = entry.get_u64(KEY_WRITTEN).unwrap_or(0);
        let size = entry.get_u64(KEY_SIZE).unwrap_or(0);
        let dest = entry.get_value(KEY_DESTINATION).map(|d| d.to_owned());
        if written >= size {
            continue;
        }
        if let Some(dest) = dest {
            std::fs::copy(&file, &dest).unwrap();
            hash.set(KEY_FILES)
                .set(file)
                .set_value_u64(KEY_WRITTEN, size);
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Write `len` bytes of `fill` through the checkpoint router.
pub fn write_routed(engine: &mut scr::Scr, name: &str, len: usize, fill: u8) -> PathBuf {
    let path = engine.route_file(Path::new(name)).unwrap();
    std::fs::write(&path, vec![fill; len]).unwrap();
    path
}
