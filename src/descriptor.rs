//! Redundancy descriptors: which scheme protects a checkpoint and how the
//! participating group is wired.
//!
//! A descriptor is immutable per checkpoint. It round-trips through a hash
//! so the filemap can persist it; rebuilding from that hash (collectively)
//! reconstructs the group communicator on a restarted run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use scr_api_types::{CheckpointId, CopyType, Rank};
use scr_cache::Filemap;
use scr_comm::{alltrue, Communicator, ReduceOp};
use scr_hash::Hash;

use crate::context::Context;

pub const KEY_ENABLED: &str = "ENABLED";
pub const KEY_INDEX: &str = "INDEX";
pub const KEY_INTERVAL: &str = "INTERVAL";
pub const KEY_BASE: &str = "BASE";
pub const KEY_DIRECTORY: &str = "DIRECTORY";
pub const KEY_TYPE: &str = "TYPE";
pub const KEY_GROUPS: &str = "GROUPS";
pub const KEY_GROUP_ID: &str = "GROUP_ID";
pub const KEY_GROUP_SIZE: &str = "GROUP_SIZE";
pub const KEY_GROUP_RANK: &str = "GROUP_RANK";
pub const KEY_HOP_DISTANCE: &str = "DISTANCE";
pub const KEY_SET_SIZE: &str = "SIZE";

pub struct CkptDesc {
    pub enabled: bool,
    pub index: usize,
    pub interval: u64,
    pub base: PathBuf,
    /// Cache directory of this descriptor:
    /// `<base>/<user>/scr.<jobid>/index.<index>`
    pub directory: PathBuf,
    pub copy_type: CopyType,
    pub hop_distance: usize,
    pub set_size: usize,

    /// Group communicator; the ranks cooperating on one redundancy instance.
    pub comm: Arc<dyn Communicator>,
    /// Number of groups across the world.
    pub groups: usize,
    /// World rank of group member 0; globally unique group identifier.
    pub group_id: Rank,
    /// My rank within the group.
    pub my_rank: usize,
    /// Group size.
    pub ranks: usize,

    pub lhs_rank: usize,
    pub lhs_rank_world: Rank,
    pub lhs_hostname: String,
    pub rhs_rank: usize,
    pub rhs_rank_world: Rank,
    pub rhs_hostname: String,
}

/// Ring partners at `dist` hops within `comm`: shift hostnames and world
/// ranks both directions.
fn set_partners(
    ctx: &Context,
    comm: &dyn Communicator,
    dist: usize,
) -> Result<(usize, Rank, String, usize, Rank, String), Error> {
    let ranks = comm.size();
    let dist = dist % ranks.max(1);
    let my_rank = comm.rank();
    let lhs = (my_rank + ranks - dist) % ranks;
    let rhs = (my_rank + dist) % ranks;

    // shift hostnames to the right, then to the left
    let lhs_hostname = comm
        .sendrecv(Some((rhs, ctx.hostname.as_bytes())), Some(lhs))?
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let rhs_hostname = comm
        .sendrecv(Some((lhs, ctx.hostname.as_bytes())), Some(rhs))?
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();

    let my_world = (ctx.my_rank_world() as u64).to_le_bytes();
    let lhs_rank_world = comm
        .sendrecv(Some((rhs, &my_world)), Some(lhs))?
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()) as usize)
        .unwrap_or(0);
    let rhs_rank_world = comm
        .sendrecv(Some((lhs, &my_world)), Some(rhs))?
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()) as usize)
        .unwrap_or(0);

    Ok((
        lhs,
        lhs_rank_world,
        lhs_hostname,
        rhs,
        rhs_rank_world,
        rhs_hostname,
    ))
}

impl CkptDesc {
    /// Serialize for storage in the filemap. Communicator wiring is not
    /// stored; GROUP_ID/GROUP_RANK suffice to rebuild it.
    pub fn store_to_hash(&self) -> Hash {
        let mut hash = Hash::new();
        hash.set_value_u64(KEY_ENABLED, self.enabled as u64);
        hash.set_value_u64(KEY_INDEX, self.index as u64);
        hash.set_value_u64(KEY_INTERVAL, self.interval);
        hash.set_value(KEY_BASE, self.base.to_string_lossy());
        hash.set_value(KEY_DIRECTORY, self.directory.to_string_lossy());
        hash.set_value(KEY_TYPE, self.copy_type.as_str());
        hash.set_value_u64(KEY_GROUPS, self.groups as u64);
        hash.set_value_u64(KEY_GROUP_ID, self.group_id as u64);
        hash.set_value_u64(KEY_GROUP_SIZE, self.ranks as u64);
        hash.set_value_u64(KEY_GROUP_RANK, self.my_rank as u64);
        hash.set_value_u64(KEY_HOP_DISTANCE, self.hop_distance as u64);
        hash.set_value_u64(KEY_SET_SIZE, self.set_size as u64);
        hash
    }

    /// Build a descriptor from its config (or filemap) hash. Collective over
    /// the world: splits communicators and exchanges partner info.
    pub fn create_from_hash(ctx: &Context, index: usize, hash: &Hash) -> Result<CkptDesc, Error> {
        let mut enabled = hash.get_u64(KEY_ENABLED).map(|v| v != 0).unwrap_or(true);

        let index = hash.get_u64(KEY_INDEX).map(|v| v as usize).unwrap_or(index);
        let interval = hash.get_u64(KEY_INTERVAL).unwrap_or(1);

        // cache paths are node-relative: the same string names different
        // physical storage on every node, so the live descriptor always
        // resolves them against the local configuration (the stored values
        // are kept in the hash for bookkeeping)
        let base = ctx.config.cache_base.clone();
        let directory = base
            .join(ctx.config.username()?)
            .join(format!("scr.{}", ctx.config.jobid()?))
            .join(format!("index.{}", index));

        let hop_distance = hash
            .get_u64(KEY_HOP_DISTANCE)
            .map(|v| v as usize)
            .unwrap_or(ctx.config.hop_distance)
            .max(1);
        let set_size = hash
            .get_u64(KEY_SET_SIZE)
            .map(|v| v as usize)
            .unwrap_or(ctx.config.set_size)
            .max(2);

        let mut copy_type: CopyType = hash
            .get_value(KEY_TYPE)
            .ok_or_else(|| format_err!("descriptor {} has no copy type", index))?
            .parse()?;

        // all ranks on one node leaves nothing to protect against node loss
        if ctx.local.size() == ctx.world.size() && copy_type != CopyType::Local {
            if ctx.my_rank_world() == 0 {
                log::info!(
                    "forcing copy type to LOCAL in descriptor {} (single-node run)",
                    index
                );
            }
            copy_type = CopyType::Local;
        }

        // build the group communicator
        let comm: Arc<dyn Communicator> = match (
            hash.get_u64(KEY_GROUP_ID),
            hash.get_u64(KEY_GROUP_RANK),
        ) {
            (Some(group_id), Some(group_rank)) => {
                // restarted run: rebuild the previous group wiring
                ctx.world.split(group_id, group_rank)?
            }
            _ => match copy_type {
                CopyType::Local => ctx
                    .world
                    .split(ctx.my_rank_world() as u64, 0)?,
                CopyType::Partner => ctx
                    .level
                    .split(0, ctx.level.rank() as u64)?,
                CopyType::Xor => {
                    let rel_rank = ctx.level.rank() / hop_distance;
                    let mod_rank = ctx.level.rank() % hop_distance;
                    let split_id = (rel_rank / set_size) * hop_distance + mod_rank;
                    ctx.level
                        .split(split_id as u64, ctx.my_rank_world() as u64)?
                }
            },
        };

        let my_rank = comm.rank();
        let ranks = comm.size();
        let group_id = comm.global_rank(0);

        let group_master = (my_rank == 0) as i64;
        let groups = ctx.world.allreduce_i64(group_master, ReduceOp::Sum)? as usize;

        let (mut lhs_rank, mut lhs_rank_world, mut lhs_hostname) = (0, 0, String::new());
        let (mut rhs_rank, mut rhs_rank_world, mut rhs_hostname) = (0, 0, String::new());
        match copy_type {
            CopyType::Partner => {
                let p = set_partners(ctx, comm.as_ref(), hop_distance)?;
                (lhs_rank, lhs_rank_world, lhs_hostname) = (p.0, p.1, p.2);
                (rhs_rank, rhs_rank_world, rhs_hostname) = (p.3, p.4, p.5);
            }
            CopyType::Xor => {
                let p = set_partners(ctx, comm.as_ref(), 1)?;
                (lhs_rank, lhs_rank_world, lhs_hostname) = (p.0, p.1, p.2);
                (rhs_rank, rhs_rank_world, rhs_hostname) = (p.3, p.4, p.5);
            }
            CopyType::Local => {}
        }

        // partner on my own node defeats the redundancy scheme
        if matches!(copy_type, CopyType::Partner | CopyType::Xor)
            && (lhs_hostname.is_empty()
                || rhs_hostname.is_empty()
                || lhs_hostname == ctx.hostname
                || rhs_hostname == ctx.hostname)
        {
            enabled = false;
            log::error!(
                "no valid partner for descriptor {} (lhs {:?}, rhs {:?}), disabling; too few nodes?",
                index,
                lhs_hostname,
                rhs_hostname
            );
        }

        // if anyone disabled this descriptor, everyone must
        if !alltrue(ctx.world.as_ref(), enabled)? {
            enabled = false;
        }

        Ok(CkptDesc {
            enabled,
            index,
            interval,
            base,
            directory,
            copy_type,
            hop_distance,
            set_size,
            comm,
            groups,
            group_id,
            my_rank,
            ranks,
            lhs_rank,
            lhs_rank_world,
            lhs_hostname,
            rhs_rank,
            rhs_rank_world,
            rhs_hostname,
        })
    }

    /// Rebuild the descriptor stored in the filemap for `(ckpt, rank)`.
    /// Collective.
    pub fn create_from_filemap(
        ctx: &Context,
        map: &Filemap,
        ckpt: CheckpointId,
        rank: Rank,
    ) -> Result<CkptDesc, Error> {
        let hash = map
            .get_desc(ckpt, rank)
            .ok_or_else(|| format_err!("no descriptor in filemap for checkpoint {} rank {}", ckpt, rank))?;
        Self::create_from_hash(ctx, 0, &hash)
    }

    /// Build the full descriptor list from the config hash; fails when any
    /// descriptor cannot be constructed.
    pub fn create_list(ctx: &Context, ckptdesc_hash: &Hash) -> Result<Vec<CkptDesc>, Error> {
        let mut descs = Vec::new();
        let indices: Vec<String> = ckptdesc_hash.keys().map(|k| k.to_owned()).collect();
        for key in indices {
            let index: usize = key
                .parse()
                .map_err(|_| format_err!("bad descriptor index '{}'", key))?;
            let sub = ckptdesc_hash.get(&key).expect("descriptor key vanished");
            descs.push(Self::create_from_hash(ctx, index, sub)?);
        }
        if descs.is_empty() {
            bail!("no checkpoint descriptors defined");
        }
        descs.sort_by_key(|d| d.index);
        Ok(descs)
    }
}

/// Select the descriptor for a checkpoint id: enabled, with the highest
/// interval that divides the id evenly. Pure in `id` for a fixed list.
pub fn ckptdesc_get(descs: &[CkptDesc], id: CheckpointId) -> Option<&CkptDesc> {
    let mut best: Option<&CkptDesc> = None;
    for desc in descs {
        if desc.enabled
            && id % desc.interval == 0
            && best.map(|b| b.interval < desc.interval).unwrap_or(true)
        {
            best = Some(desc);
        }
    }
    best
}

/// Look up a single descriptor field straight from the filemap; building the
/// whole descriptor is overkill when only the base or directory is needed.
fn val_from_filemap(map: &Filemap, ckpt: CheckpointId, rank: Rank, key: &str) -> Option<String> {
    map.get_desc(ckpt, rank)?.get_value(key).map(|v| v.to_owned())
}

pub fn base_from_filemap(map: &Filemap, ckpt: CheckpointId, rank: Rank) -> Option<PathBuf> {
    val_from_filemap(map, ckpt, rank, KEY_BASE).map(PathBuf::from)
}

pub fn dir_from_filemap(map: &Filemap, ckpt: CheckpointId, rank: Rank) -> Option<PathBuf> {
    val_from_filemap(map, ckpt, rank, KEY_DIRECTORY).map(PathBuf::from)
}
