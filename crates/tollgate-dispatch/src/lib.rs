//! The request-dispatch pipeline's hard-engineering components: provider
//! resolution, session affinity, the rate-limit/quota guard, cost
//! attribution and the response rectifier.
//!
//! Every module here is pure application logic: no axum, no direct SQL, no
//! concrete HTTP client. Each trait boundary (`SessionStore`, `CostWindowStore`)
//! is implemented once against an in-memory map (used by the unit tests and
//! by single-process deployments) and once against Redis (the distributed KV
//! described in DESIGN §6), so the pipeline's semantics are testable without
//! a live Redis instance.

pub mod cost;
pub mod guards;
pub mod quota;
pub mod rectifier;
pub mod resolver;
pub mod session;

pub use cost::{ModelPrice, UsageTokens, compute_cost};
pub use guards::{ErrorRule, GuardError, MatchType, RequestFilterEngine, SensitiveWordGuard};
pub use quota::{QuotaDecision, QuotaGuard, QuotaRejection, QuotaScope, WindowBounds};
pub use rectifier::{normalize_utf8, rectify_sse_framing, rectify_truncated_json};
pub use resolver::{ProviderCandidate, ProviderResolver, ResolveOutcome};
pub use session::{SessionError, SessionId, SessionSource, SessionTracker};
