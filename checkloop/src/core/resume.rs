//! Resume tie-break over a task's stored checkpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::core::checkpoint::{Checkpoint, Trigger};

/// Pick the checkpoint `checkpoint_resume` restores from.
///
/// Only unexpired checkpoints count, and of a session series only its head:
/// once the head expires the whole series is gone. A pause is superseded by
/// any later session checkpoint (`trigger = iteration`) of the same task. The
/// newest unsuperseded pause wins; without one, the newest live checkpoint is
/// returned.
pub fn select_resume_checkpoint(
    checkpoints: &[Checkpoint],
    now: DateTime<Utc>,
) -> Option<&Checkpoint> {
    let mut heads: BTreeMap<&str, u64> = BTreeMap::new();
    for checkpoint in checkpoints {
        if let Some(iteration_id) = checkpoint.iteration_id.as_deref() {
            let head = heads.entry(iteration_id).or_insert(checkpoint.sequence);
            *head = (*head).max(checkpoint.sequence);
        }
    }
    let live: Vec<&Checkpoint> = checkpoints
        .iter()
        .filter(|checkpoint| !checkpoint.is_expired(now))
        .filter(|checkpoint| match checkpoint.iteration_id.as_deref() {
            Some(iteration_id) => heads.get(iteration_id) == Some(&checkpoint.sequence),
            None => true,
        })
        .collect();

    let latest_session_write = live
        .iter()
        .filter(|checkpoint| checkpoint.trigger == Trigger::Iteration)
        .map(|checkpoint| checkpoint.sequence)
        .max();

    let pause = live
        .iter()
        .filter(|checkpoint| checkpoint.is_pause())
        .filter(|checkpoint| latest_session_write.is_none_or(|seq| checkpoint.sequence > seq))
        .max_by_key(|checkpoint| checkpoint.sequence);

    pause
        .or_else(|| live.iter().max_by_key(|checkpoint| checkpoint.sequence))
        .copied()
}
