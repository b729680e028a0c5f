//! Tier-partitioned, weighted-lottery candidate selection shared by the
//! per-provider credential pool and the higher-level provider resolver.
//!
//! This module is pure: it never touches the network, the KV store or the
//! database. Callers hand it an already-filtered candidate list (group,
//! health and quota filtering happen upstream) and get back either a single
//! winner or a full ordered shortlist, plus the `ProviderChainItem` entries
//! that document each admission/rejection/selection decision.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed vocabulary for `ProviderChainItem::reason`, per DESIGN §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainReason {
    InitialSelection,
    SessionReuse,
    RetrySuccess,
    RetryFailed,
    RequestSuccess,
    SystemError,
    ConcurrentLimitFailed,
    Http2Fallback,
    ClientErrorNonRetryable,
}

/// One entry in the decision log attached to a request, eventually
/// persisted as the `providerChain` JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderChainItem {
    pub provider_id: String,
    pub name: String,
    pub reason: ChainReason,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_context: Option<Value>,
}

impl ProviderChainItem {
    pub fn new(provider_id: impl Into<String>, name: impl Into<String>, reason: ChainReason) -> Self {
        Self {
            provider_id: provider_id.into(),
            name: name.into(),
            reason,
            timestamp: time::OffsetDateTime::now_utc(),
            decision_context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.decision_context = Some(context);
        self
    }
}

/// A provider already past group/health/quota filtering, carrying the three
/// fields the tier-and-lottery step (DESIGN §4.1 step 6) needs.
#[derive(Debug, Clone)]
pub struct ResolverCandidate {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub weight: u32,
    pub cost_multiplier: f64,
}

pub struct WeightedResolver;

impl WeightedResolver {
    /// Partitions `candidates` by ascending `priority` and runs a weighted
    /// lottery within the lowest-priority tier. Ties on the lottery draw
    /// itself don't occur (weights are discrete buckets); the ordering
    /// returned for same-priority/same-weight candidates is stable
    /// (ascending `cost_multiplier`, then ascending `id`) so callers can use
    /// it as the deterministic fallback order, e.g. in tests with a seeded
    /// RNG of weight 0 spread.
    pub fn pick_one<R: Rng + ?Sized>(
        candidates: &[ResolverCandidate],
        excluded: &HashSet<String>,
        rng: &mut R,
    ) -> Option<ResolverCandidate> {
        let tier = Self::lowest_priority_tier(candidates, excluded)?;
        Self::weighted_lottery(&tier, rng)
    }

    /// Builds an ordered shortlist of up to `max_len` candidates by
    /// repeatedly drawing a winner, excluding it, and redrawing from the
    /// remaining pool (DESIGN §4.1 step 7, "backfill").
    pub fn shortlist<R: Rng + ?Sized>(
        candidates: &[ResolverCandidate],
        already_tried: &HashSet<String>,
        max_len: usize,
        rng: &mut R,
    ) -> Vec<ResolverCandidate> {
        let mut excluded = already_tried.clone();
        let mut out = Vec::with_capacity(max_len);
        while out.len() < max_len {
            let Some(winner) = Self::pick_one(candidates, &excluded, rng) else {
                break;
            };
            excluded.insert(winner.id.clone());
            out.push(winner);
        }
        out
    }

    fn lowest_priority_tier(
        candidates: &[ResolverCandidate],
        excluded: &HashSet<String>,
    ) -> Option<Vec<ResolverCandidate>> {
        let survivors: Vec<&ResolverCandidate> = candidates
            .iter()
            .filter(|c| !excluded.contains(&c.id))
            .collect();
        let min_priority = survivors.iter().map(|c| c.priority).min()?;
        Some(
            survivors
                .into_iter()
                .filter(|c| c.priority == min_priority)
                .cloned()
                .collect(),
        )
    }

    /// Probability of candidate p = weight_p / sum(weight). Deterministic
    /// tie-break (cost_multiplier asc, then id asc) decides the boundary
    /// candidate on ties and is also used for the zero-total-weight
    /// degenerate case.
    fn weighted_lottery<R: Rng + ?Sized>(
        tier: &[ResolverCandidate],
        rng: &mut R,
    ) -> Option<ResolverCandidate> {
        if tier.is_empty() {
            return None;
        }
        let total_weight: u64 = tier.iter().map(|c| c.weight.max(1) as u64).sum();
        if total_weight == 0 {
            return Self::tie_break(tier).cloned();
        }
        let mut ordered: Vec<&ResolverCandidate> = tier.iter().collect();
        ordered.sort_by(|a, b| {
            a.cost_multiplier
                .partial_cmp(&b.cost_multiplier)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let draw = rng.random_range(0..total_weight);
        let mut acc: u64 = 0;
        for cand in ordered {
            acc += cand.weight.max(1) as u64;
            if draw < acc {
                return Some(cand.clone());
            }
        }
        Self::tie_break(tier).cloned()
    }

    fn tie_break(tier: &[ResolverCandidate]) -> Option<&ResolverCandidate> {
        tier.iter().min_by(|a, b| {
            a.cost_multiplier
                .partial_cmp(&b.cost_multiplier)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
    }
}

/// Convenience used by callers that just need a timestamped log entry
/// without constructing `ProviderChainItem` fields by hand.
pub fn chain_item(
    provider_id: impl Into<String>,
    name: impl Into<String>,
    reason: ChainReason,
) -> ProviderChainItem {
    ProviderChainItem::new(provider_id, name, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cand(id: &str, priority: i32, weight: u32, cost_multiplier: f64) -> ResolverCandidate {
        ResolverCandidate {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            weight,
            cost_multiplier,
        }
    }

    #[test]
    fn lowest_priority_tier_wins_over_higher_tiers() {
        let candidates = vec![cand("a", 1, 1, 1.0), cand("b", 0, 1, 1.0)];
        let mut rng = StdRng::seed_from_u64(1);
        let picked = WeightedResolver::pick_one(&candidates, &HashSet::new(), &mut rng).unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn weighted_lottery_converges_to_weight_ratio() {
        let candidates = vec![cand("a", 0, 1, 2.0), cand("b", 0, 1, 1.0)];
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..10_000 {
            let picked = WeightedResolver::pick_one(&candidates, &HashSet::new(), &mut rng).unwrap();
            *counts.entry(picked.id).or_insert(0u32) += 1;
        }
        let b = *counts.get("b").unwrap_or(&0) as f64;
        // Equal weights -> each picked roughly half the time.
        assert!((b / 10_000.0 - 0.5).abs() < 0.05, "b ratio was {}", b / 10_000.0);
    }

    #[test]
    fn excluded_candidates_are_never_picked() {
        let candidates = vec![cand("a", 0, 1, 1.0), cand("b", 0, 1, 1.0)];
        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let picked = WeightedResolver::pick_one(&candidates, &excluded, &mut rng).unwrap();
            assert_eq!(picked.id, "b");
        }
    }

    #[test]
    fn shortlist_backfills_until_exhausted() {
        let candidates = vec![cand("a", 0, 1, 1.0), cand("b", 0, 1, 1.0), cand("c", 1, 1, 1.0)];
        let mut rng = StdRng::seed_from_u64(3);
        let list = WeightedResolver::shortlist(&candidates, &HashSet::new(), 5, &mut rng);
        let ids: HashSet<_> = list.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn zero_weight_tier_falls_back_to_deterministic_tie_break() {
        let candidates = vec![cand("z", 0, 0, 3.0), cand("a", 0, 0, 1.0)];
        let mut rng = StdRng::seed_from_u64(9);
        let picked = WeightedResolver::pick_one(&candidates, &HashSet::new(), &mut rng).unwrap();
        assert_eq!(picked.id, "a");
    }
}
