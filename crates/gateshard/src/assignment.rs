use std::collections::BTreeSet;
use std::fmt;

use crate::error::ClusterError;
use crate::gateway::GatewayInfo;
use crate::instance::Instance;

/// Hard cap on the total partition count.
pub const MAX_SHARD_NUM: u32 = 10_000;

/// The set of partition ids this node owns, plus the total partition count
/// for the current epoch and the gateway info the sessions will connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub shard_ids: BTreeSet<u32>,
    pub shard_num: u32,
    pub ap: GatewayInfo,
}

impl Assignment {
    /// Two assignments are equivalent iff their id sets are equal and the
    /// total partition count matches. The gateway url is deliberately not
    /// part of the comparison: a url-only change does not re-partition.
    pub fn is_equivalent(&self, other: &Assignment) -> bool {
        self.shard_num == other.shard_num && self.shard_ids == other.shard_ids
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.shard_ids, self.shard_num)
    }
}

/// Locate the local instance in the member list: returns
/// `(self_idx, valid_count)` counting only valid members and preserving the
/// input order, or `None` when self is absent. The directory contract
/// guarantees lexicographic key order, which makes the index consistent
/// across the fleet.
pub(crate) fn locate_self(members: &[Instance], self_id: &str) -> Option<(u32, u32)> {
    let mut valid = 0u32;
    let mut self_idx = None;
    for ins in members {
        if !ins.is_valid() {
            tracing::debug!(instance = %ins, "skipping invalid instance");
            continue;
        }
        if ins.id == self_id {
            self_idx = Some(valid);
        }
        valid += 1;
    }
    self_idx.map(|idx| (idx, valid))
}

/// Total partition count for this epoch: the larger of the gateway's
/// minimum and the operator hint, capped at [`MAX_SHARD_NUM`].
fn shard_total(ap_shards: u32, min_shard_hint: u32) -> Result<u32, ClusterError> {
    if ap_shards == 0 {
        return Err(ClusterError::Assignment {
            reason: "gateway reported zero shards".to_string(),
        });
    }
    let total = ap_shards.max(min_shard_hint);
    if total > MAX_SHARD_NUM {
        return Err(ClusterError::Assignment {
            reason: format!("shard total {total} exceeds the {MAX_SHARD_NUM} cap"),
        });
    }
    Ok(total)
}

/// Partition ids for the node at `self_idx` of `valid_count` members,
/// assigned round-robin by index: one id per full round, plus one extra for
/// the first `total % valid_count` indices.
pub(crate) fn assign_shards(
    self_idx: u32,
    valid_count: u32,
    min_shard_hint: u32,
    ap: GatewayInfo,
) -> Result<Assignment, ClusterError> {
    let total = shard_total(ap.shards, min_shard_hint)?;
    let mut shard_ids = BTreeSet::new();
    let rounds = total / valid_count;
    for i in 0..rounds {
        shard_ids.insert(i * valid_count + self_idx);
    }
    // Strict `>`: only indices below the remainder take a tail partition.
    if total % valid_count > self_idx {
        shard_ids.insert(rounds * valid_count + self_idx);
    }
    let assignment = Assignment {
        shard_ids,
        shard_num: total,
        ap,
    };
    tracing::debug!(assignment = %assignment, "computed shard assignment");
    Ok(assignment)
}

/// Compute the local assignment from a member snapshot. Returns `Ok(None)`
/// when the local instance is absent from the list (the node idles).
pub fn compute_assignment(
    members: &[Instance],
    self_id: &str,
    min_shard_hint: u32,
    ap: GatewayInfo,
) -> Result<Option<Assignment>, ClusterError> {
    match locate_self(members, self_id) {
        None => Ok(None),
        Some((self_idx, valid_count)) => {
            assign_shards(self_idx, valid_count, min_shard_hint, ap).map(Some)
        }
    }
}
