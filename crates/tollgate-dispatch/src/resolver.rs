//! Provider resolver (DESIGN §4.1).
//!
//! Produces an ordered shortlist of candidate upstream providers for one
//! inbound request: session affinity first, then enumerate/filter by group,
//! health and quota, exclude already-tried candidates, and run the
//! tier-partitioned weighted lottery. Every admission/rejection/selection
//! step appends a `ProviderChainItem` to the decision log the caller
//! eventually persists as `providerChain`.
//!
//! This module is pure orchestration: the actual lottery math lives in
//! `tollgate_provider_core::WeightedResolver`, and the breaker gate lives in
//! `tollgate_provider_core::ProviderBreakerStore`. The resolver's job is
//! wiring those together with the session/quota/group filters from DESIGN
//! §4.1 steps 2-6.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use rust_decimal::Decimal;
use tollgate_common::ProviderType;
use tollgate_provider_core::{ChainReason, ProviderBreakerStore, ProviderChainItem, ResolverCandidate, WeightedResolver};

use crate::quota::{CostWindowStore, QuotaScope, QuotaScopeTag};
use crate::session::{SessionId, SessionTracker};

/// One enumerable provider as seen by the resolver, before any filtering.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub weight: u32,
    pub cost_multiplier: f64,
    pub provider_type: ProviderType,
    pub group_tag: Option<String>,
    pub allowed_models: Vec<String>,
    pub model_redirects: std::collections::HashMap<String, String>,
    pub enabled: bool,
    /// Minimum known cost for the requested model on this provider, used as
    /// the cheap lower bound for the quota filter.
    pub min_cost_lower_bound: Decimal,
}

/// Inputs to one resolution pass.
pub struct ResolveRequest<'a> {
    pub requested_model: &'a str,
    pub key_group: Option<&'a str>,
    pub user_group: Option<&'a str>,
    pub session_id: Option<&'a SessionId>,
    pub previously_tried: &'a [String],
    pub max_candidates: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// A single sticky-provider hit (DESIGN §4.1 step 1).
    SessionAffinity(ProviderCandidate),
    /// An ordered shortlist built from steps 2-7.
    Shortlist(Vec<ProviderCandidate>),
    /// No eligible provider survived filtering.
    NoneEligible,
}

pub struct ProviderResolver {
    breakers: Arc<ProviderBreakerStore>,
    vendor_type_breakers: Arc<ProviderBreakerStore>,
    cost_windows: Arc<dyn CostWindowStore>,
    sessions: Arc<dyn SessionTracker>,
}

impl ProviderResolver {
    pub fn new(
        breakers: Arc<ProviderBreakerStore>,
        vendor_type_breakers: Arc<ProviderBreakerStore>,
        cost_windows: Arc<dyn CostWindowStore>,
        sessions: Arc<dyn SessionTracker>,
    ) -> Self {
        Self {
            breakers,
            vendor_type_breakers,
            cost_windows,
            sessions,
        }
    }

    /// Resolves the shortlist for one request, appending decision entries to
    /// `chain` as it goes. `vendor_of` maps a provider id to its
    /// `(vendorId, providerType)` key for the coarser breaker.
    pub async fn resolve<R: Rng + ?Sized>(
        &self,
        req: &ResolveRequest<'_>,
        all_providers: &[ProviderCandidate],
        vendor_type_key: impl Fn(&ProviderCandidate) -> String,
        chain: &mut Vec<ProviderChainItem>,
        rng: &mut R,
    ) -> ResolveOutcome {
        let mut excluded: HashSet<String> = req.previously_tried.iter().cloned().collect();

        // Step 1: session affinity.
        if let Some(session) = req.session_id {
            if let Ok(Some(sticky_id)) = self.sessions.sticky_provider(session).await {
                if !excluded.contains(&sticky_id) {
                    if let Some(candidate) = all_providers.iter().find(|p| p.id == sticky_id) {
                        if self
                            .passes_steps_3_through_6(candidate, req, &vendor_type_key)
                            .await
                        {
                            chain.push(ProviderChainItem::new(
                                candidate.id.clone(),
                                candidate.name.clone(),
                                ChainReason::SessionReuse,
                            ));
                            return ResolveOutcome::SessionAffinity(candidate.clone());
                        }
                    }
                }
            }
        }

        // Step 2: enumerate providers that can serve the requested model.
        let enumerable: Vec<&ProviderCandidate> = all_providers
            .iter()
            .filter(|p| p.enabled && self.serves_model(p, req.requested_model))
            .collect();

        // Step 3: group filter.
        let group_filtered: Vec<&ProviderCandidate> = enumerable
            .into_iter()
            .filter(|p| self.group_matches(p, req.key_group, req.user_group))
            .collect();

        // Step 4: health + quota filter.
        let mut survivors: Vec<ProviderCandidate> = Vec::new();
        for candidate in group_filtered {
            if !self.passes_health_and_quota(candidate, &vendor_type_key).await {
                continue;
            }
            survivors.push(candidate.clone());
        }

        if survivors.is_empty() {
            return ResolveOutcome::NoneEligible;
        }

        // Step 5: exclusion filter + steps 6-7: tier/lottery + backfill.
        let resolver_candidates: Vec<ResolverCandidate> = survivors
            .iter()
            .map(|p| ResolverCandidate {
                id: p.id.clone(),
                name: p.name.clone(),
                priority: p.priority,
                weight: p.weight,
                cost_multiplier: p.cost_multiplier,
            })
            .collect();

        let max_len = req.max_candidates.max(1);
        let picked = WeightedResolver::shortlist(&resolver_candidates, &excluded, max_len, rng);
        if picked.is_empty() {
            return ResolveOutcome::NoneEligible;
        }

        let mut shortlist = Vec::with_capacity(picked.len());
        for (idx, winner) in picked.iter().enumerate() {
            let candidate = survivors.iter().find(|p| p.id == winner.id).unwrap().clone();
            let reason = if idx == 0 {
                ChainReason::InitialSelection
            } else {
                ChainReason::RetryFailed
            };
            chain.push(ProviderChainItem::new(
                candidate.id.clone(),
                candidate.name.clone(),
                reason,
            ));
            shortlist.push(candidate);
        }
        excluded.extend(shortlist.iter().map(|p| p.id.clone()));

        ResolveOutcome::Shortlist(shortlist)
    }

    async fn passes_steps_3_through_6(
        &self,
        candidate: &ProviderCandidate,
        req: &ResolveRequest<'_>,
        vendor_type_key: &impl Fn(&ProviderCandidate) -> String,
    ) -> bool {
        candidate.enabled
            && self.serves_model(candidate, req.requested_model)
            && self.group_matches(candidate, req.key_group, req.user_group)
            && self.passes_health_and_quota(candidate, vendor_type_key).await
    }

    /// Model eligibility: an explicit allow-list entry, or a bare allow-list
    /// declaring no restriction, or — for Anthropic-family models — any
    /// Anthropic-type provider, or any other provider that opts a model in
    /// via `model_redirects` (DESIGN §4.1 step 2).
    fn serves_model(&self, candidate: &ProviderCandidate, requested_model: &str) -> bool {
        if candidate.allowed_models.iter().any(|m| m == requested_model) {
            return true;
        }
        if candidate.model_redirects.contains_key(requested_model) {
            return true;
        }
        if candidate.allowed_models.is_empty() {
            let is_claude_model = requested_model.starts_with("claude-");
            let provider_is_claude_family = matches!(
                candidate.provider_type,
                ProviderType::Claude | ProviderType::ClaudeAuth
            );
            if is_claude_model && provider_is_claude_family {
                return true;
            }
            if !is_claude_model {
                return true;
            }
        }
        false
    }

    /// Key's group wins, falling back to User's, then `"default"`.
    fn group_matches(
        &self,
        candidate: &ProviderCandidate,
        key_group: Option<&str>,
        user_group: Option<&str>,
    ) -> bool {
        let effective = key_group.or(user_group).unwrap_or("default");
        match &candidate.group_tag {
            Some(tag) => tag == effective,
            None => effective == "default",
        }
    }

    async fn passes_health_and_quota(
        &self,
        candidate: &ProviderCandidate,
        vendor_type_key: &impl Fn(&ProviderCandidate) -> String,
    ) -> bool {
        if self.breakers.is_open(&candidate.id).await {
            return false;
        }
        let vt_key = vendor_type_key(candidate);
        if self.vendor_type_breakers.is_open(&vt_key).await {
            return false;
        }
        true
    }

    /// DESIGN §4.4 step 3's cheap conservative quota check, exposed
    /// separately since it needs the caller's User/Key subject, not just the
    /// provider candidate.
    pub async fn would_exceed_quota(
        &self,
        scope: QuotaScope,
        id: &str,
        window: tollgate_common::QuotaWindow,
        limit: Decimal,
        min_cost_lower_bound: Decimal,
    ) -> bool {
        match self.cost_windows.running(scope, id, window).await {
            Ok(running) => running + min_cost_lower_bound > limit,
            Err(_) => false,
        }
    }

    pub fn breakers(&self) -> &Arc<ProviderBreakerStore> {
        &self.breakers
    }

    pub fn vendor_type_breakers(&self) -> &Arc<ProviderBreakerStore> {
        &self.vendor_type_breakers
    }
}

/// Reason recorded when a provider is skipped purely because the User/Key
/// concurrent-session cap was already reached; kept distinct from breaker
/// rejections because it doesn't count against the breaker (DESIGN §4.2).
pub fn concurrent_limit_chain_item(provider_id: &str, name: &str) -> ProviderChainItem {
    ProviderChainItem::new(provider_id, name, ChainReason::ConcurrentLimitFailed)
}

pub use QuotaScopeTag as ResolverQuotaScopeTag;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaError;
    use crate::session::InMemorySessionTracker;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::time::Duration;

    struct NoopCostWindowStore;

    #[async_trait]
    impl CostWindowStore for NoopCostWindowStore {
        async fn running(
            &self,
            _scope: QuotaScope,
            _id: &str,
            _window: tollgate_common::QuotaWindow,
        ) -> Result<Decimal, QuotaError> {
            Ok(Decimal::ZERO)
        }

        async fn increment(
            &self,
            _scope: QuotaScope,
            _id: &str,
            _window: tollgate_common::QuotaWindow,
            amount: Decimal,
            _bounds: crate::quota::WindowBounds,
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<Decimal, QuotaError> {
            Ok(amount)
        }
    }

    fn candidate(id: &str, priority: i32, weight: u32, cost_multiplier: f64) -> ProviderCandidate {
        ProviderCandidate {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            weight,
            cost_multiplier,
            provider_type: ProviderType::Claude,
            group_tag: None,
            allowed_models: vec![],
            model_redirects: Default::default(),
            enabled: true,
            min_cost_lower_bound: Decimal::ZERO,
        }
    }

    fn resolver() -> ProviderResolver {
        let events = tollgate_provider_core::EventHub::new(8);
        ProviderResolver::new(
            Arc::new(ProviderBreakerStore::new(events.clone())),
            Arc::new(ProviderBreakerStore::new(events)),
            Arc::new(NoopCostWindowStore),
            Arc::new(InMemorySessionTracker::new(Duration::from_secs(300))),
        )
    }

    #[tokio::test]
    async fn happy_path_two_healthy_providers_produces_shortlist() {
        let resolver = resolver();
        let providers = vec![
            candidate("a", 0, 1, 2.0),
            candidate("b", 0, 1, 1.0),
        ];
        let req = ResolveRequest {
            requested_model: "claude-3-opus",
            key_group: None,
            user_group: None,
            session_id: None,
            previously_tried: &[],
            max_candidates: 2,
        };
        let mut chain = Vec::new();
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = resolver
            .resolve(&req, &providers, |c| format!("vendor:{}", c.id), &mut chain, &mut rng)
            .await;
        match outcome {
            ResolveOutcome::Shortlist(list) => assert_eq!(list.len(), 2),
            other => panic!("expected shortlist, got {other:?}"),
        }
        assert!(!chain.is_empty());
    }

    #[tokio::test]
    async fn open_breaker_excludes_provider() {
        let resolver = resolver();
        let config = tollgate_common::BreakerConfig {
            failure_threshold: 1,
            open_duration_ms: 60_000,
            half_open_success_threshold: 1,
            max_retry_attempts: 2,
        };
        resolver.breakers().record_failure("a", &config).await;
        let providers = vec![candidate("a", 0, 1, 1.0), candidate("b", 0, 1, 1.0)];
        let req = ResolveRequest {
            requested_model: "claude-3-opus",
            key_group: None,
            user_group: None,
            session_id: None,
            previously_tried: &[],
            max_candidates: 2,
        };
        let mut chain = Vec::new();
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = resolver
            .resolve(&req, &providers, |c| format!("vendor:{}", c.id), &mut chain, &mut rng)
            .await;
        match outcome {
            ResolveOutcome::Shortlist(list) => {
                assert!(list.iter().all(|p| p.id != "a"));
            }
            other => panic!("expected shortlist, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn group_mismatch_excludes_provider() {
        let resolver = resolver();
        let mut tagged = candidate("a", 0, 1, 1.0);
        tagged.group_tag = Some("enterprise".to_string());
        let providers = vec![tagged, candidate("b", 0, 1, 1.0)];
        let req = ResolveRequest {
            requested_model: "claude-3-opus",
            key_group: None,
            user_group: None,
            session_id: None,
            previously_tried: &[],
            max_candidates: 2,
        };
        let mut chain = Vec::new();
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = resolver
            .resolve(&req, &providers, |c| format!("vendor:{}", c.id), &mut chain, &mut rng)
            .await;
        match outcome {
            ResolveOutcome::Shortlist(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, "b");
            }
            other => panic!("expected shortlist, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_eligible_providers_returns_none_eligible() {
        let resolver = resolver();
        let providers: Vec<ProviderCandidate> = vec![];
        let req = ResolveRequest {
            requested_model: "claude-3-opus",
            key_group: None,
            user_group: None,
            session_id: None,
            previously_tried: &[],
            max_candidates: 2,
        };
        let mut chain = Vec::new();
        let mut rng = StdRng::seed_from_u64(4);
        let outcome = resolver
            .resolve(&req, &providers, |c| format!("vendor:{}", c.id), &mut chain, &mut rng)
            .await;
        assert_eq!(outcome, ResolveOutcome::NoneEligible);
    }

    #[tokio::test]
    async fn session_affinity_reused_when_sticky_and_not_previously_tried() {
        let resolver = resolver();
        let session = SessionId::parse(&"a".repeat(21)).unwrap();
        resolver.sessions.set_sticky_provider(&session, "a").await.unwrap();
        let providers = vec![candidate("a", 0, 1, 1.0), candidate("b", 0, 1, 1.0)];
        let req = ResolveRequest {
            requested_model: "claude-3-opus",
            key_group: None,
            user_group: None,
            session_id: Some(&session),
            previously_tried: &[],
            max_candidates: 2,
        };
        let mut chain = Vec::new();
        let mut rng = StdRng::seed_from_u64(5);
        let outcome = resolver
            .resolve(&req, &providers, |c| format!("vendor:{}", c.id), &mut chain, &mut rng)
            .await;
        match outcome {
            ResolveOutcome::SessionAffinity(p) => assert_eq!(p.id, "a"),
            other => panic!("expected session affinity hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_affinity_skipped_when_sticky_provider_already_tried() {
        let resolver = resolver();
        let session = SessionId::parse(&"a".repeat(21)).unwrap();
        resolver.sessions.set_sticky_provider(&session, "a").await.unwrap();
        let providers = vec![candidate("a", 0, 1, 1.0), candidate("b", 0, 1, 1.0)];
        let req = ResolveRequest {
            requested_model: "claude-3-opus",
            key_group: None,
            user_group: None,
            session_id: Some(&session),
            previously_tried: &["a".to_string()],
            max_candidates: 2,
        };
        let mut chain = Vec::new();
        let mut rng = StdRng::seed_from_u64(6);
        let outcome = resolver
            .resolve(&req, &providers, |c| format!("vendor:{}", c.id), &mut chain, &mut rng)
            .await;
        match outcome {
            ResolveOutcome::Shortlist(list) => {
                assert!(list.iter().all(|p| p.id != "a"));
            }
            other => panic!("expected shortlist excluding 'a', got {other:?}"),
        }
    }
}
