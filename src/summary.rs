//! Per-checkpoint summary blob on the parallel file system.
//!
//! Version 5 is a hash: `VERSION`, `CKPT → id → {RANKS, COMPLETE, RANK → r
//! → FILE → name → {SIZE, CRC?, COMPLETE?}}`. Older runs left a textual
//! `scr_summary.txt`; the legacy reader parses it into the same shape.

use std::path::Path;

use anyhow::{bail, format_err, Error};

use scr_api_types::{CheckpointId, SUMMARY_FILE_NAME, SUMMARY_FILE_NAME_V4, SUMMARY_FILE_VERSION};
use scr_hash::Hash;

pub const KEY_VERSION: &str = "VERSION";
pub const KEY_CKPT: &str = "CKPT";
pub const KEY_RANKS: &str = "RANKS";
pub const KEY_RANK: &str = "RANK";
pub const KEY_FILE: &str = "FILE";
pub const KEY_SIZE: &str = "SIZE";
pub const KEY_CRC: &str = "CRC";
pub const KEY_COMPLETE: &str = "COMPLETE";
pub const KEY_NOFETCH: &str = "NOFETCH";

/// Write the summary for a checkpoint directory. `data` holds the merged
/// per-rank file hashes (`RANK → r → FILE → ...`).
pub fn write(
    dir: &Path,
    id: CheckpointId,
    ranks: usize,
    all_complete: bool,
    data: &Hash,
) -> Result<(), Error> {
    let mut summary = Hash::new();
    summary.set_value_u64(KEY_VERSION, SUMMARY_FILE_VERSION);

    let ckpt_hash = summary.set_kv(KEY_CKPT, id.to_string());
    ckpt_hash.set_value_u64(KEY_RANKS, ranks as u64);
    ckpt_hash.merge(data);
    ckpt_hash.set_value_u64(KEY_COMPLETE, all_complete as u64);

    summary.write(dir.join(SUMMARY_FILE_NAME))
}

fn read_v5(dir: &Path) -> Result<Hash, Error> {
    Hash::read(dir.join(SUMMARY_FILE_NAME))
}

/// Parse a version 1-4 textual summary into the version 5 hash shape.
fn read_v4_to_v5(dir: &Path, ranks_world: usize) -> Result<Hash, Error> {
    let path = dir.join(SUMMARY_FILE_NAME_V4);
    let data = std::fs::read_to_string(&path)
        .map_err(|err| format_err!("unable to read legacy summary {:?} - {}", path, err))?;
    let mut lines = data.lines();

    let first = lines
        .next()
        .ok_or_else(|| format_err!("legacy summary {:?} is empty", path))?;

    let mut version = 1u64;
    let mut num_records = ranks_world;
    let mut fields = first.split_whitespace();
    if fields.next() == Some("Version:") {
        version = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| format_err!("bad version line in {:?}", path))?;
    }

    if version > 1 {
        if version >= 3 {
            let rows = lines
                .next()
                .ok_or_else(|| format_err!("missing record count in {:?}", path))?;
            num_records = rows
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| format_err!("bad record count in {:?}", path))?;
        }
        // column header line
        lines.next();
    }

    if num_records == 0 {
        bail!("no file records found in {:?}, corrupt or incomplete", path);
    }

    let mut summary = Hash::new();
    summary.set_value_u64(KEY_VERSION, SUMMARY_FILE_VERSION);

    let mut all_complete = true;
    let mut all_ranks: Option<u64> = None;
    let mut all_ckpt: Option<u64> = None;

    for i in 0..num_records {
        let line = lines
            .next()
            .ok_or_else(|| format_err!("early EOF in {:?}: read {} of {} records", path, i, num_records))?;
        let cols: Vec<&str> = line.split_whitespace().collect();

        // v1: rank scr ranks pattern ckpt complete exp_size match size file
        // v2+: rank scr ranks ckpt complete exp_size match size file crc_set crc
        let rank: u64;
        let ranks: u64;
        let ckpt: u64;
        let complete: u64;
        let exp_size: u64;
        let filename: &str;
        let crc: Option<u32>;
        if version == 1 {
            if cols.len() != 10 {
                bail!("invalid record {} in {:?}", i, path);
            }
            rank = cols[0].parse()?;
            ranks = cols[2].parse()?;
            ckpt = cols[4].parse()?;
            complete = cols[5].parse()?;
            exp_size = cols[6].parse()?;
            filename = cols[9];
            crc = None;
        } else {
            if cols.len() != 11 {
                bail!("invalid record {} in {:?}", i, path);
            }
            rank = cols[0].parse()?;
            ranks = cols[2].parse()?;
            ckpt = cols[3].parse()?;
            complete = cols[4].parse()?;
            exp_size = cols[5].parse()?;
            filename = cols[8];
            let crc_computed: u64 = cols[9].parse()?;
            crc = if crc_computed != 0 {
                let v = cols[10].strip_prefix("0x").unwrap_or(cols[10]);
                Some(u32::from_str_radix(v, 16)?)
            } else {
                None
            };
        }

        if rank as usize >= ranks_world {
            bail!("invalid rank {} in a job with {} tasks in {:?}", rank, ranks_world, path);
        }
        if *all_ckpt.get_or_insert(ckpt) != ckpt {
            bail!("mixed checkpoint ids in {:?}", path);
        }
        if *all_ranks.get_or_insert(ranks) != ranks {
            bail!("mixed rank counts in {:?}", path);
        }

        let base = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_owned());

        let file_hash = summary
            .set_kv(KEY_CKPT, ckpt.to_string())
            .set_kv(KEY_RANK, rank.to_string())
            .set_kv(KEY_FILE, base);
        file_hash.set_value_u64(KEY_SIZE, exp_size);
        if let Some(crc) = crc {
            file_hash.set_crc32(KEY_CRC, crc);
        }
        if complete == 0 {
            all_complete = false;
            file_hash.set_value_u64(KEY_COMPLETE, 0);
        }
    }

    if let Some(ckpt) = all_ckpt {
        let ckpt_hash = summary.set_kv(KEY_CKPT, ckpt.to_string());
        ckpt_hash.set_value_u64(KEY_COMPLETE, all_complete as u64);
        ckpt_hash.set_value_u64(KEY_RANKS, all_ranks.unwrap_or(0));
    }

    Ok(summary)
}

/// Read and validate the summary in `dir`: version supported, exactly one
/// checkpoint, marked complete, rank count matching the current world.
pub fn read(dir: &Path, ranks_world: usize) -> Result<(Hash, CheckpointId), Error> {
    let summary = match read_v5(dir) {
        Ok(hash) => hash,
        Err(_) => read_v4_to_v5(dir, ranks_world)
            .map_err(|err| format_err!("reading summary in {:?} - {}", dir, err))?,
    };

    if summary.get_u64(KEY_VERSION) != Some(SUMMARY_FILE_VERSION) {
        bail!("unsupported summary version in {:?}", dir);
    }

    let ckpt_root = summary
        .get(KEY_CKPT)
        .ok_or_else(|| format_err!("summary in {:?} lists no checkpoint", dir))?;
    if ckpt_root.len() != 1 {
        bail!("summary in {:?} lists more than one checkpoint", dir);
    }

    let ckpt_str = ckpt_root.first_key().expect("nonempty hash").to_owned();
    let id: CheckpointId = ckpt_str
        .parse()
        .map_err(|_| format_err!("bad checkpoint id '{}' in summary", ckpt_str))?;
    let ckpt_hash = ckpt_root.get(&ckpt_str).expect("key vanished");

    if ckpt_hash.get_u64(KEY_COMPLETE) != Some(1) {
        bail!("checkpoint {} in {:?} is not marked complete", id, dir);
    }

    let ranks = ckpt_hash
        .get_u64(KEY_RANKS)
        .ok_or_else(|| format_err!("summary in {:?} lacks a rank count", dir))?;
    if ranks as usize != ranks_world {
        bail!(
            "checkpoint {} was written by {} ranks but this run has {}",
            id,
            ranks,
            ranks_world
        );
    }

    Ok((summary, id))
}

#[cfg(test)]
mod test {
    use super::*;

    fn tempdir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("scr-summary-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn v5_round_trip() {
        let dir = tempdir("v5");

        let mut data = Hash::new();
        let file_hash = data
            .set_kv(KEY_RANK, "0")
            .set_kv(KEY_FILE, "rank_0.ckpt");
        file_hash.set_value_u64(KEY_SIZE, 4096);
        file_hash.set_crc32(KEY_CRC, 0xabcd);

        write(&dir, 12, 2, true, &data).unwrap();
        let (summary, id) = read(&dir, 2).unwrap();
        assert_eq!(id, 12);
        let size = summary
            .get_kv(KEY_CKPT, "12")
            .and_then(|h| h.get_kv(KEY_RANK, "0"))
            .and_then(|h| h.get_kv(KEY_FILE, "rank_0.ckpt"))
            .and_then(|h| h.get_u64(KEY_SIZE));
        assert_eq!(size, Some(4096));

        // wrong world size must fail
        assert!(read(&dir, 4).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn incomplete_summary_rejected() {
        let dir = tempdir("incomplete");
        let data = Hash::new();
        write(&dir, 3, 2, false, &data).unwrap();
        assert!(read(&dir, 2).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn legacy_text_reader() {
        let dir = tempdir("v4");
        let text = "Version: 4\n\
                    Rows: 2\n\
                    Rank SCR Ranks Ckpt Complete ExpSize Match Size File CrcSet Crc\n\
                    0 1 2 7 1 1024 1 1024 /old/path/rank_0.ckpt 1 0xdeadbeef\n\
                    1 1 2 7 1 2048 1 2048 rank_1.ckpt 0 0x0\n";
        std::fs::write(dir.join(SUMMARY_FILE_NAME_V4), text).unwrap();

        let (summary, id) = read(&dir, 2).unwrap();
        assert_eq!(id, 7);
        let ckpt = summary.get_kv(KEY_CKPT, "7").unwrap();
        assert_eq!(ckpt.get_u64(KEY_COMPLETE), Some(1));
        let file = ckpt
            .get_kv(KEY_RANK, "0")
            .and_then(|h| h.get_kv(KEY_FILE, "rank_0.ckpt"))
            .unwrap();
        assert_eq!(file.get_u64(KEY_SIZE), Some(1024));
        assert_eq!(file.get_crc32(KEY_CRC), Some(0xdeadbeef));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
