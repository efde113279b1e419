//! Halt channel: decide when the job should stop taking checkpoints and
//! shut down.
//!
//! Rank 0 owns the evaluation; everyone else learns the verdict through a
//! broadcast. The halt file itself is shared with operator tooling, so all
//! updates go through [`HaltFile::sync_and_decrement`] under its lock.

use anyhow::Error;

use scr_cache::haltfile::{
    HaltFile, KEY_CHECKPOINTS, KEY_EXIT_AFTER, KEY_EXIT_BEFORE, KEY_EXIT_REASON, KEY_SECONDS,
};
use scr_comm::Communicator;
use scr_hash::Hash;

use crate::context::Context;

/// Oracle for the seconds left in the job allocation; `None` disables the
/// time-limit halt criterion.
pub trait SecondsRemaining: Send + Sync {
    fn seconds_remaining(&self) -> Option<i64>;
}

/// Default oracle: no scheduler integration, time-limit halts disabled.
pub struct NoOracle;

impl SecondsRemaining for NoOracle {
    fn seconds_remaining(&self) -> Option<i64> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltMode {
    /// The caller will act on the verdict (flush and terminate).
    TestAndHalt,
    /// Probe only, e.g. from `need_checkpoint`.
    TestButDontHalt,
}

/// Record a halt reason in the halt file (rank 0 only).
pub fn halt(ctx: &Context, halt_hash: &mut Hash, reason: &str) -> Result<(), Error> {
    halt_hash.set_value(KEY_EXIT_REASON, reason);
    HaltFile::new(&ctx.halt_file).sync_and_decrement(halt_hash, 0)
}

/// Evaluate the halt conditions. Collective: rank 0 reads the halt file
/// (decrementing the checkpoints-left counter by `decrement`) and the
/// verdict is broadcast. In `TestAndHalt` mode the firing condition is also
/// recorded back into the halt file as the exit reason.
pub fn check_halt_and_decrement(
    ctx: &Context,
    halt_hash: &mut Hash,
    oracle: &dyn SecondsRemaining,
    mode: HaltMode,
    decrement: u64,
) -> Result<bool, Error> {
    let mut need_to_halt = false;

    if ctx.my_rank_world() == 0 {
        let now = proxmox_time::epoch_i64();

        HaltFile::new(&ctx.halt_file).sync_and_decrement(halt_hash, decrement)?;

        let halt_seconds = halt_hash.get_i64(KEY_SECONDS).unwrap_or(0);
        if halt_seconds > 0 {
            if let Some(remaining) = oracle.seconds_remaining() {
                if (0..=halt_seconds).contains(&remaining) {
                    if mode == HaltMode::TestAndHalt {
                        log::warn!(
                            "job exiting: seconds remaining {} <= halt seconds {}",
                            remaining,
                            halt_seconds
                        );
                        halt(ctx, halt_hash, "TIME_LIMIT")?;
                    }
                    need_to_halt = true;
                }
            }
        }

        if let Some(reason) = halt_hash.get_value(KEY_EXIT_REASON) {
            if !reason.is_empty() {
                let reason = reason.to_owned();
                if mode == HaltMode::TestAndHalt {
                    log::warn!("job exiting: reason: {}", reason);
                    halt(ctx, halt_hash, &reason)?;
                }
                need_to_halt = true;
            }
        }

        if let Some(left) = halt_hash.get_u64(KEY_CHECKPOINTS) {
            if left == 0 {
                if mode == HaltMode::TestAndHalt {
                    log::warn!("job exiting: no more checkpoints remaining");
                    halt(ctx, halt_hash, "NO_CHECKPOINTS_LEFT")?;
                }
                need_to_halt = true;
            }
        }

        if let Some(exit_before) = halt_hash.get_i64(KEY_EXIT_BEFORE) {
            if now >= exit_before - halt_seconds {
                if mode == HaltMode::TestAndHalt {
                    log::warn!("job exiting: past exit-before time");
                    halt(ctx, halt_hash, "EXIT_BEFORE_TIME")?;
                }
                need_to_halt = true;
            }
        }

        if let Some(exit_after) = halt_hash.get_i64(KEY_EXIT_AFTER) {
            if now >= exit_after {
                if mode == HaltMode::TestAndHalt {
                    log::warn!("job exiting: past exit-after time");
                    halt(ctx, halt_hash, "EXIT_AFTER_TIME")?;
                }
                need_to_halt = true;
            }
        }
    }

    let verdict = ctx
        .world
        .bcast(0, (need_to_halt as i64).to_le_bytes().to_vec())?;
    Ok(i64::from_le_bytes(verdict.try_into().unwrap()) != 0)
}
