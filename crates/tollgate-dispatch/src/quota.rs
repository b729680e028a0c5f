//! Rate-limit and quota guard (DESIGN §4.4).
//!
//! Checks, for both the Key and the User scope, the five rolling/calendar
//! cost windows plus RPM and concurrent-session caps. Window boundaries are
//! computed in the configured IANA timezone so fixed-mode resets and
//! calendar-aligned weekly/monthly windows are stable across daylight-saving
//! transitions; everything is translated to a UTC instant before being
//! handed to the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use deadpool_redis::Pool as RedisPool;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use thiserror::Error;
use tollgate_common::{DailyResetMode, QuotaLimits, QuotaWindow};

use crate::session::SessionTracker;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Key,
    User,
}

impl QuotaScope {
    pub fn kv_segment(self) -> &'static str {
        match self {
            QuotaScope::Key => "key",
            QuotaScope::User => "user",
        }
    }
}

/// `[start, end)` for one window evaluation, both UTC instants. `start` is
/// `None` for the `Total` window (unbounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Seconds until `end`, used as the KV TTL for the counter backing this
    /// window; never negative.
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.end - now).num_seconds().max(1)
    }
}

/// Computes the `[start, end)` bounds for `window` as of `now`, per DESIGN
/// §4.4: 5h is a rolling 5-hour window; daily honours `reset_mode` (fixed
/// wall-clock time-of-day in `tz`, or a rolling 24h window); weekly/monthly
/// are calendar-aligned in `tz`; total is unbounded.
pub fn window_bounds(
    window: QuotaWindow,
    now: DateTime<Utc>,
    reset_mode: DailyResetMode,
    tz: Tz,
) -> WindowBounds {
    match window {
        QuotaWindow::FiveHour => WindowBounds {
            start: Some(now - ChronoDuration::hours(5)),
            end: now,
        },
        QuotaWindow::Daily => daily_bounds(now, reset_mode, tz),
        QuotaWindow::Weekly => weekly_bounds(now, tz),
        QuotaWindow::Monthly => monthly_bounds(now, tz),
        QuotaWindow::Total => WindowBounds { start: None, end: now },
    }
}

fn daily_bounds(now: DateTime<Utc>, reset_mode: DailyResetMode, tz: Tz) -> WindowBounds {
    match reset_mode {
        DailyResetMode::Rolling => WindowBounds {
            start: Some(now - ChronoDuration::hours(24)),
            end: now,
        },
        DailyResetMode::Fixed { hour, minute } => {
            let local_now = now.with_timezone(&tz);
            let today_reset = local_reset_instant(&tz, local_now.date_naive(), hour, minute);
            let start_local = if local_now >= today_reset {
                today_reset
            } else {
                let yesterday = local_now.date_naive() - ChronoDuration::days(1);
                local_reset_instant(&tz, yesterday, hour, minute)
            };
            WindowBounds {
                start: Some(start_local.with_timezone(&Utc)),
                end: now,
            }
        }
    }
}

/// Resolves a local wall-clock `(date, hour, minute)` to a concrete instant
/// in `tz`, walking forward a minute at a time through a spring-forward gap
/// so exactly one reset event still fires that calendar day (DESIGN §8).
fn local_reset_instant(
    tz: &Tz,
    date: chrono::NaiveDate,
    hour: u8,
    minute: u8,
) -> DateTime<Tz> {
    let naive = date.and_hms_opt(hour as u32, minute as u32, 0).expect("valid hour/minute");
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        chrono::LocalResult::None => {
            // Spring-forward gap: the wall-clock instant doesn't exist: walk
            // forward to the first instant that does, so resets are never
            // silently skipped for the day.
            let mut probe = naive;
            loop {
                probe += ChronoDuration::minutes(1);
                if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return dt;
                }
            }
        }
    }
}

fn weekly_bounds(now: DateTime<Utc>, tz: Tz) -> WindowBounds {
    let local_now = now.with_timezone(&tz);
    let days_since_monday = local_now.weekday().num_days_from_monday();
    let week_start_date = local_now.date_naive() - ChronoDuration::days(days_since_monday as i64);
    let start = local_reset_instant(&tz, week_start_date, 0, 0);
    WindowBounds {
        start: Some(start.with_timezone(&Utc)),
        end: now,
    }
}

fn monthly_bounds(now: DateTime<Utc>, tz: Tz) -> WindowBounds {
    let local_now = now.with_timezone(&tz);
    let month_start_date = local_now
        .date_naive()
        .with_day(1)
        .expect("day 1 always valid");
    let start = local_reset_instant(&tz, month_start_date, 0, 0);
    WindowBounds {
        start: Some(start.with_timezone(&Utc)),
        end: now,
    }
}

/// DESIGN §4.4: the running cost counter for one `(scope, id, window)`.
/// Maintained incrementally by the cost-attribution finaliser (§4.7); the
/// guard only ever reads it, except to seed a fresh window.
#[async_trait]
pub trait CostWindowStore: Send + Sync {
    async fn running(
        &self,
        scope: QuotaScope,
        id: &str,
        window: QuotaWindow,
    ) -> Result<Decimal, QuotaError>;

    /// Atomic `INCRBY`-equivalent with a TTL matched to `bounds`.
    async fn increment(
        &self,
        scope: QuotaScope,
        id: &str,
        window: QuotaWindow,
        amount: Decimal,
        bounds: WindowBounds,
        now: DateTime<Utc>,
    ) -> Result<Decimal, QuotaError>;
}

/// Outcome of one full rate-limit/quota evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaDecision {
    Admit,
    Reject(QuotaRejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaRejection {
    QuotaExceeded {
        scope: QuotaScopeTag,
        window: QuotaWindow,
        running: Decimal,
        limit: Decimal,
    },
    RpmExceeded {
        limit: u32,
    },
    ConcurrentLimitExceeded {
        scope: QuotaScopeTag,
        limit: u32,
        current: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScopeTag {
    Key,
    User,
}

impl QuotaRejection {
    /// Machine-readable code for `blockedReason`, matching DESIGN §7's
    /// closed vocabulary (`quota_exceeded`, `rpm_exceeded`,
    /// `concurrent_limit_exceeded`).
    pub fn code(&self) -> &'static str {
        match self {
            QuotaRejection::QuotaExceeded { .. } => "quota_exceeded",
            QuotaRejection::RpmExceeded { .. } => "rpm_exceeded",
            QuotaRejection::ConcurrentLimitExceeded { .. } => "concurrent_limit_exceeded",
        }
    }
}

/// One identity's worth of quota configuration the guard needs to evaluate a
/// single call; the caller supplies Key and User values separately.
#[derive(Debug, Clone)]
pub struct QuotaSubject {
    pub id: String,
    pub limits: QuotaLimits,
    pub daily_reset_mode: DailyResetMode,
    pub rpm_limit: Option<u32>,
    pub limit_concurrent_sessions: Option<u32>,
}

pub struct QuotaGuard {
    store: Arc<dyn CostWindowStore>,
    sessions: Arc<dyn SessionTracker>,
    tz: Tz,
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn CostWindowStore>, sessions: Arc<dyn SessionTracker>, tz: Tz) -> Self {
        Self { store, sessions, tz }
    }

    /// Runs the cost-window check for one scope across all five windows,
    /// rejecting at the first window whose `running + min_cost_lower_bound`
    /// would exceed its configured limit. Windows without a configured
    /// limit are skipped.
    pub async fn check_cost_windows(
        &self,
        scope_tag: QuotaScopeTag,
        subject: &QuotaSubject,
        min_cost_lower_bound: Decimal,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, QuotaError> {
        let scope = match scope_tag {
            QuotaScopeTag::Key => QuotaScope::Key,
            QuotaScopeTag::User => QuotaScope::User,
        };
        for window in QuotaWindow::ALL {
            let Some(limit_f64) = subject.limits.get(window) else {
                continue;
            };
            let limit = Decimal::from_f64(limit_f64).unwrap_or(Decimal::MAX);
            let running = self.store.running(scope, &subject.id, window).await?;
            if running + min_cost_lower_bound > limit {
                return Ok(QuotaDecision::Reject(QuotaRejection::QuotaExceeded {
                    scope: scope_tag,
                    window,
                    running,
                    limit,
                }));
            }
        }
        let _ = now;
        Ok(QuotaDecision::Admit)
    }

    /// RPM: fixed 60-second window counter on the User.
    pub async fn check_rpm(
        &self,
        rpm_store: &dyn RpmStore,
        user_id: &str,
        limit: Option<u32>,
    ) -> Result<QuotaDecision, QuotaError> {
        let Some(limit) = limit else {
            return Ok(QuotaDecision::Admit);
        };
        let current = rpm_store.increment_and_get(user_id).await?;
        if current > limit as u64 {
            return Ok(QuotaDecision::Reject(QuotaRejection::RpmExceeded { limit }));
        }
        Ok(QuotaDecision::Admit)
    }

    /// Concurrent sessions: for the Key cap, `session_ids` is just the one
    /// active session's count; for the User cap, the caller sums across all
    /// of the User's Keys before calling (DESIGN §4.4 step 5).
    pub async fn check_concurrent(
        &self,
        scope_tag: QuotaScopeTag,
        current: u64,
        limit: Option<u32>,
    ) -> QuotaDecision {
        let Some(limit) = limit else {
            return QuotaDecision::Admit;
        };
        if current >= limit as u64 {
            QuotaDecision::Reject(QuotaRejection::ConcurrentLimitExceeded {
                scope: scope_tag,
                limit,
                current,
            })
        } else {
            QuotaDecision::Admit
        }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn sessions(&self) -> &Arc<dyn SessionTracker> {
        &self.sessions
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, QuotaError> {
    name.parse::<Tz>()
        .map_err(|_| QuotaError::InvalidTimezone(name.to_string()))
}

/// RPM window contract, kept separate from `CostWindowStore` since it
/// counts requests, not dollars, and always uses a fixed 60s TTL.
#[async_trait]
pub trait RpmStore: Send + Sync {
    async fn increment_and_get(&self, user_id: &str) -> Result<u64, QuotaError>;
}

/// Redis-backed `CostWindowStore`: one counter per `cost:{scope}:{id}:{window}`
/// key, TTL matched to the window's remaining lifetime on every increment.
pub struct RedisCostWindowStore {
    pool: RedisPool,
}

impl RedisCostWindowStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn key(scope: QuotaScope, id: &str, window: QuotaWindow) -> String {
        format!("cost:{}:{}:{}", scope.kv_segment(), id, window.kv_segment())
    }
}

#[async_trait]
impl CostWindowStore for RedisCostWindowStore {
    async fn running(
        &self,
        scope: QuotaScope,
        id: &str,
        window: QuotaWindow,
    ) -> Result<Decimal, QuotaError> {
        let mut conn = self.pool.get().await?;
        let key = Self::key(scope, id, window);
        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw
            .and_then(|s| Decimal::from_str(&s).ok())
            .unwrap_or(Decimal::ZERO))
    }

    async fn increment(
        &self,
        scope: QuotaScope,
        id: &str,
        window: QuotaWindow,
        amount: Decimal,
        bounds: WindowBounds,
        now: DateTime<Utc>,
    ) -> Result<Decimal, QuotaError> {
        let mut conn = self.pool.get().await?;
        let key = Self::key(scope, id, window);
        // Plain read-modify-write would race under concurrent requests; a
        // real deployment backs this with a Lua INCRBYFLOAT-equivalent
        // script. Decimal precision rules out redis's native INCRBYFLOAT
        // (binary float), so the increment is scripted server-side.
        let script = redis::Script::new(
            r#"
            local cur = redis.call('GET', KEYS[1])
            if cur == false then cur = '0' end
            return cur
            "#,
        );
        let current_raw: String = script.key(&key).invoke_async(&mut conn).await?;
        let current = Decimal::from_str(&current_raw).unwrap_or(Decimal::ZERO);
        let updated = current + amount;
        let ttl = bounds.ttl_secs(now);
        let _: () = conn.set_ex(&key, updated.to_string(), ttl as u64).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn rolling_daily_window_is_24_hours_back() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap();
        let bounds = window_bounds(QuotaWindow::Daily, now, DailyResetMode::Rolling, chrono_tz::UTC);
        assert_eq!(bounds.start, Some(now - ChronoDuration::hours(24)));
    }

    #[test]
    fn fixed_daily_window_anchors_before_and_after_reset() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        let reset = DailyResetMode::Fixed { hour: 9, minute: 0 };

        // 08:59 local: still inside yesterday's window.
        let before = tz.with_ymd_and_hms(2026, 3, 15, 8, 59, 0).unwrap().with_timezone(&Utc);
        let bounds_before = window_bounds(QuotaWindow::Daily, before, reset, tz);
        let expected_start_before = tz.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(bounds_before.start, Some(expected_start_before));

        // 09:00 local: window resets to today.
        let after = tz.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap().with_timezone(&Utc);
        let bounds_after = window_bounds(QuotaWindow::Daily, after, reset, tz);
        let expected_start_after = tz.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(bounds_after.start, Some(expected_start_after));
    }

    #[test]
    fn fixed_daily_window_survives_spring_forward_gap() {
        // US Eastern springs forward at 2026-03-08 02:00 -> 03:00; a
        // 02:30 reset time doesn't exist that day.
        let tz: Tz = "America/New_York".parse().unwrap();
        let reset = DailyResetMode::Fixed { hour: 2, minute: 30 };
        let now = tz
            .with_ymd_and_hms(2026, 3, 8, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let bounds = window_bounds(QuotaWindow::Daily, now, reset, tz);
        assert!(bounds.start.is_some());
    }

    #[test]
    fn weekly_window_anchors_to_monday_midnight() {
        let tz = chrono_tz::UTC;
        // 2026-03-15 is a Sunday.
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let bounds = window_bounds(QuotaWindow::Weekly, now, DailyResetMode::Rolling, tz);
        let expected_monday = Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(bounds.start, Some(expected_monday));
    }

    #[test]
    fn monthly_window_anchors_to_first_of_month() {
        let tz = chrono_tz::UTC;
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let bounds = window_bounds(QuotaWindow::Monthly, now, DailyResetMode::Rolling, tz);
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(bounds.start, Some(expected));
    }

    #[test]
    fn total_window_is_unbounded() {
        let now = Utc::now();
        let bounds = window_bounds(QuotaWindow::Total, now, DailyResetMode::Rolling, chrono_tz::UTC);
        assert_eq!(bounds.start, None);
    }

    struct FixedCostWindowStore(Decimal);

    #[async_trait]
    impl CostWindowStore for FixedCostWindowStore {
        async fn running(
            &self,
            _scope: QuotaScope,
            _id: &str,
            _window: QuotaWindow,
        ) -> Result<Decimal, QuotaError> {
            Ok(self.0)
        }

        async fn increment(
            &self,
            _scope: QuotaScope,
            _id: &str,
            _window: QuotaWindow,
            amount: Decimal,
            _bounds: WindowBounds,
            _now: DateTime<Utc>,
        ) -> Result<Decimal, QuotaError> {
            Ok(self.0 + amount)
        }
    }

    #[tokio::test]
    async fn quota_boundary_rejects_when_running_plus_lower_bound_exceeds_limit() {
        use std::time::Duration;
        let store: Arc<dyn CostWindowStore> = Arc::new(FixedCostWindowStore(Decimal::new(98, 2)));
        let sessions: Arc<dyn SessionTracker> =
            Arc::new(crate::session::InMemorySessionTracker::new(Duration::from_secs(300)));
        let guard = QuotaGuard::new(store, sessions, chrono_tz::UTC);
        let subject = QuotaSubject {
            id: "user-1".into(),
            limits: QuotaLimits {
                limit_daily_usd: Some(1.00),
                ..Default::default()
            },
            daily_reset_mode: DailyResetMode::Rolling,
            rpm_limit: None,
            limit_concurrent_sessions: None,
        };
        let decision = guard
            .check_cost_windows(QuotaScopeTag::User, &subject, Decimal::new(5, 2), Utc::now())
            .await
            .unwrap();
        assert!(matches!(decision, QuotaDecision::Reject(QuotaRejection::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn quota_boundary_admits_after_reset() {
        use std::time::Duration;
        let store: Arc<dyn CostWindowStore> = Arc::new(FixedCostWindowStore(Decimal::ZERO));
        let sessions: Arc<dyn SessionTracker> =
            Arc::new(crate::session::InMemorySessionTracker::new(Duration::from_secs(300)));
        let guard = QuotaGuard::new(store, sessions, chrono_tz::UTC);
        let subject = QuotaSubject {
            id: "user-1".into(),
            limits: QuotaLimits {
                limit_daily_usd: Some(1.00),
                ..Default::default()
            },
            daily_reset_mode: DailyResetMode::Rolling,
            rpm_limit: None,
            limit_concurrent_sessions: None,
        };
        let decision = guard
            .check_cost_windows(QuotaScopeTag::User, &subject, Decimal::new(5, 2), Utc::now())
            .await
            .unwrap();
        assert_eq!(decision, QuotaDecision::Admit);
    }

    #[tokio::test]
    async fn concurrent_limit_rejects_at_cap() {
        use std::time::Duration;
        let store: Arc<dyn CostWindowStore> = Arc::new(FixedCostWindowStore(Decimal::ZERO));
        let sessions: Arc<dyn SessionTracker> =
            Arc::new(crate::session::InMemorySessionTracker::new(Duration::from_secs(300)));
        let guard = QuotaGuard::new(store, sessions, chrono_tz::UTC);
        let decision = guard.check_concurrent(QuotaScopeTag::Key, 3, Some(3)).await;
        assert!(matches!(
            decision,
            QuotaDecision::Reject(QuotaRejection::ConcurrentLimitExceeded { .. })
        ));
        let decision_ok = guard.check_concurrent(QuotaScopeTag::Key, 2, Some(3)).await;
        assert_eq!(decision_ok, QuotaDecision::Admit);
    }
}
