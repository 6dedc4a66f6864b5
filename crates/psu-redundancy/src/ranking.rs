//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Rank assignment and rotation arithmetic.
//!
//! Nothing in this module touches hardware; callers write the resulting ranks.

use std::collections::HashSet;

use psu_common::config::RankingMode;
use tracing::{info, warn};

use crate::policy::SharedPolicy;
use crate::power_supply::{PowerSupply, PsuDescriptor};

/// Outcome of a ranking pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankPass {
    /// Ranks were recomputed from health in registry order.
    Assigned { ranked: usize, switched_mode: bool },
    /// Operator ranks stand; no PSU is faulted.
    Unchanged,
}

/// Recompute ranks for the current registry.
///
/// Under operator ranking a single faulted PSU moves the policy to
/// platform-managed ranking for the rest of the session, after which the
/// platform assignment runs exactly once.
pub fn re_rank(psus: &mut [PowerSupply], policy: &SharedPolicy) -> RankPass {
    let mut switched_mode = false;
    if policy.ranking_mode() == RankingMode::OperatorAssigned {
        let Some(faulted) = psus.iter().find(|psu| !psu.is_normal()) else {
            return RankPass::Unchanged;
        };
        info!(
            psu = faulted.name(),
            health = %faulted.health(),
            "faulted supply under operator ranking; switching to platform-managed"
        );
        switched_mode = policy.switch_to_platform_managed();
    }
    let ranked = assign_platform_ranks(psus);
    RankPass::Assigned {
        ranked,
        switched_mode,
    }
}

/// Give Normal PSUs ranks `1..=k` in registry order and every other PSU 0.
pub fn assign_platform_ranks(psus: &mut [PowerSupply]) -> usize {
    let mut next: usize = 1;
    for psu in psus.iter_mut() {
        if !psu.is_normal() {
            psu.rank = 0;
            continue;
        }
        match u8::try_from(next) {
            Ok(rank) => {
                psu.rank = rank;
                next += 1;
            }
            Err(_) => {
                warn!(psu = psu.name(), "rank space exhausted; leaving supply unranked");
                psu.rank = 0;
            }
        }
    }
    next - 1
}

/// Ranks a platform-managed pass would give `descriptors`, in order.
pub fn platform_preview(descriptors: &[PsuDescriptor]) -> Vec<u8> {
    let mut psus = descriptors
        .iter()
        .cloned()
        .map(PowerSupply::from_descriptor)
        .collect::<Vec<_>>();
    assign_platform_ranks(&mut psus);
    psus.iter().map(PowerSupply::rank).collect()
}

/// Next rotation position for `rank` when `good_count` PSUs are healthy.
pub fn rotated_rank(rank: u8, good_count: usize) -> u8 {
    let next = usize::from(rank) + 1;
    if next > good_count {
        1
    } else {
        u8::try_from(next).unwrap_or(1)
    }
}

/// Advance every nonzero rank by one position, wrapping at the healthy count.
///
/// Returns the number of PSUs whose rank moved. Nothing rotates when no PSU
/// is healthy.
pub fn rotate_ranks(psus: &mut [PowerSupply]) -> usize {
    let good_count = psus.iter().filter(|psu| psu.is_normal()).count();
    if good_count == 0 {
        return 0;
    }
    let mut rotated = 0;
    for psu in psus.iter_mut().filter(|psu| psu.rank != 0) {
        psu.rank = rotated_rank(psu.rank, good_count);
        rotated += 1;
    }
    rotated
}

/// True when the nonzero ranks are exactly `1..=k` for `k` Normal PSUs.
pub fn ranks_contiguous(psus: &[PowerSupply]) -> bool {
    let good_count = psus.iter().filter(|psu| psu.is_normal()).count();
    let mut live = psus
        .iter()
        .map(PowerSupply::rank)
        .filter(|rank| *rank != 0)
        .map(usize::from)
        .collect::<Vec<_>>();
    live.sort_unstable();
    live.len() == good_count && live.iter().enumerate().all(|(index, rank)| *rank == index + 1)
}

/// Rejections for an operator-supplied rank list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RankOrderError {
    #[error("rank order can only be assigned while ranking is operator-assigned")]
    NotOperatorAssigned,
    #[error("rank order lists {len} entries but only {psus} supplies are known")]
    TooLong { len: usize, psus: usize },
    #[error("rank {rank} exceeds the {max} known supplies")]
    OutOfRange { rank: u8, max: usize },
    #[error("rank {0} assigned more than once")]
    Duplicate(u8),
}

/// Check an operator rank list against a registry of `psu_count` supplies.
pub fn validate_rank_order(order: &[u8], psu_count: usize) -> Result<(), RankOrderError> {
    if order.len() > psu_count {
        return Err(RankOrderError::TooLong {
            len: order.len(),
            psus: psu_count,
        });
    }
    let mut seen = HashSet::new();
    for &rank in order.iter().filter(|rank| **rank != 0) {
        if usize::from(rank) > psu_count {
            return Err(RankOrderError::OutOfRange {
                rank,
                max: psu_count,
            });
        }
        if !seen.insert(rank) {
            return Err(RankOrderError::Duplicate(rank));
        }
    }
    Ok(())
}

/// Apply a validated rank list by registry position. Supplies beyond the
/// list and supplies that are not Normal end up unranked.
pub fn apply_rank_order(psus: &mut [PowerSupply], order: &[u8]) {
    for (index, psu) in psus.iter_mut().enumerate() {
        let requested = order.get(index).copied().unwrap_or(0);
        psu.rank = if psu.is_normal() { requested } else { 0 };
    }
}
