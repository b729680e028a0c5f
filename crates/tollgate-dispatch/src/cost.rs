//! Cost attribution (DESIGN §4.7).
//!
//! `cost = Σ tokens_i * unitPrice_i * provider.cost_multiplier`, rounded to
//! 15 decimal places. Prices may be tiered at a 200_000-token threshold,
//! expressed either as explicit "above-200k" prices (Gemini-style) or as a
//! multiplier on the base price (Claude 1M-context: input x2, output x1.5).
//! When both apply to the same component, the 1M-context multiplier wins.

use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

pub const TIER_THRESHOLD_TOKENS: i64 = 200_000;
const COST_SCALE: u32 = 15;

/// Per-token USD prices for one model, plus the two tiering mechanisms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    #[serde(default)]
    pub cache_creation_5m_cost_per_token: Decimal,
    #[serde(default)]
    pub cache_creation_1h_cost_per_token: Decimal,
    #[serde(default)]
    pub cache_read_cost_per_token: Decimal,
    /// Optional flat fee per request (e.g. some Gemini grounding surcharges).
    #[serde(default)]
    pub input_cost_per_request: Decimal,
    /// Explicit above-200k prices (Gemini-style tiering). `None` if the model
    /// has no above-threshold price table.
    #[serde(default)]
    pub above_200k: Option<AboveThresholdPrice>,
    /// Context-1M multiplier applied to input/output (and, for cache
    /// creation, the input multiplier) when the caller requests the 1M
    /// context window (Claude-style tiering).
    #[serde(default)]
    pub context_1m_multiplier: Option<Context1mMultiplier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AboveThresholdPrice {
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    #[serde(default)]
    pub cache_creation_5m_cost_per_token: Decimal,
    #[serde(default)]
    pub cache_creation_1h_cost_per_token: Decimal,
    #[serde(default)]
    pub cache_read_cost_per_token: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Context1mMultiplier {
    pub input_multiplier: Decimal,
    pub output_multiplier: Decimal,
}

/// Token counts reported by the upstream for one completed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTokens {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_5m_input_tokens: i64,
    pub cache_creation_1h_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl UsageTokens {
    /// The prompt-side token count used to decide which pricing tier
    /// applies: raw input tokens plus everything that shares the input tier
    /// (cache creation and cache read all price off the prompt side).
    fn tier_reference_tokens(&self) -> i64 {
        self.input_tokens
            + self.cache_creation_5m_input_tokens
            + self.cache_creation_1h_input_tokens
            + self.cache_read_input_tokens
    }
}

/// Computes the recorded cost for a completed request.
///
/// `context_1m_applied` mirrors the `MessageRequest.context1mApplied` flag:
/// when true and the price table declares a `context_1m_multiplier`, that
/// multiplier path is used for input/output/cache-creation pricing instead
/// of the `above_200k` explicit table, even if both are configured and the
/// usage crosses the 200k threshold.
pub fn compute_cost(
    usage: &UsageTokens,
    price: &ModelPrice,
    cost_multiplier: f64,
    context_1m_applied: bool,
) -> Decimal {
    let (input_price, output_price, cache_5m_price, cache_1h_price, cache_read_price) =
        if context_1m_applied {
            match &price.context_1m_multiplier {
                Some(m) => (
                    price.input_cost_per_token * m.input_multiplier,
                    price.output_cost_per_token * m.output_multiplier,
                    price.cache_creation_5m_cost_per_token * m.input_multiplier,
                    price.cache_creation_1h_cost_per_token * m.input_multiplier,
                    price.cache_read_cost_per_token * m.input_multiplier,
                ),
                None => base_or_tiered(usage, price),
            }
        } else {
            base_or_tiered(usage, price)
        };

    let multiplier = Decimal::from_f64(cost_multiplier).unwrap_or(Decimal::ONE);

    let raw = Decimal::from(usage.input_tokens) * input_price
        + Decimal::from(usage.output_tokens) * output_price
        + Decimal::from(usage.cache_creation_5m_input_tokens) * cache_5m_price
        + Decimal::from(usage.cache_creation_1h_input_tokens) * cache_1h_price
        + Decimal::from(usage.cache_read_input_tokens) * cache_read_price
        + price.input_cost_per_request;

    let mut total = raw * multiplier;
    total.rescale(COST_SCALE);
    total
}

fn base_or_tiered(usage: &UsageTokens, price: &ModelPrice) -> (Decimal, Decimal, Decimal, Decimal, Decimal) {
    match &price.above_200k {
        Some(tier) if usage.tier_reference_tokens() > TIER_THRESHOLD_TOKENS => (
            tier.input_cost_per_token,
            tier.output_cost_per_token,
            tier.cache_creation_5m_cost_per_token,
            tier.cache_creation_1h_cost_per_token,
            tier.cache_read_cost_per_token,
        ),
        _ => (
            price.input_cost_per_token,
            price.output_cost_per_token,
            price.cache_creation_5m_cost_per_token,
            price.cache_creation_1h_cost_per_token,
            price.cache_read_cost_per_token,
        ),
    }
}

/// Cheap conservative lower bound for one call against `price`, used by the
/// rate-limit guard to reject before a single token has actually been
/// consumed (DESIGN §4.4 step 3: `1 * input_cost_per_token`).
pub fn min_cost_lower_bound(price: &ModelPrice) -> Decimal {
    if price.input_cost_per_token > Decimal::ZERO {
        price.input_cost_per_token
    } else if price.output_cost_per_token > Decimal::ZERO {
        price.output_cost_per_token
    } else {
        Decimal::new(1, COST_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat_price() -> ModelPrice {
        ModelPrice {
            input_cost_per_token: dec!(0.000003),
            output_cost_per_token: dec!(0.000015),
            cache_creation_5m_cost_per_token: dec!(0.00000375),
            cache_creation_1h_cost_per_token: dec!(0.000006),
            cache_read_cost_per_token: dec!(0.0000003),
            input_cost_per_request: Decimal::ZERO,
            above_200k: None,
            context_1m_multiplier: None,
        }
    }

    #[test]
    fn base_formula_matches_spec_example() {
        let usage = UsageTokens {
            input_tokens: 1000,
            output_tokens: 500,
            ..Default::default()
        };
        let price = flat_price();
        let cost = compute_cost(&usage, &price, 1.0, false);
        let expected = Decimal::from(1000) * price.input_cost_per_token
            + Decimal::from(500) * price.output_cost_per_token;
        assert_eq!(cost, expected.round_dp(15));
    }

    #[test]
    fn cost_multiplier_scales_total() {
        let usage = UsageTokens {
            input_tokens: 1000,
            output_tokens: 0,
            ..Default::default()
        };
        let price = flat_price();
        let base = compute_cost(&usage, &price, 1.0, false);
        let doubled = compute_cost(&usage, &price, 2.0, false);
        assert_eq!(doubled, (base * dec!(2)).round_dp(15));
    }

    #[test]
    fn above_200k_tier_applies_past_threshold() {
        let mut price = flat_price();
        price.above_200k = Some(AboveThresholdPrice {
            input_cost_per_token: dec!(0.000006),
            output_cost_per_token: dec!(0.00003),
            cache_creation_5m_cost_per_token: dec!(0.0000075),
            cache_creation_1h_cost_per_token: dec!(0.000012),
            cache_read_cost_per_token: dec!(0.0000006),
        });
        let usage = UsageTokens {
            input_tokens: 250_000,
            output_tokens: 100,
            ..Default::default()
        };
        let cost = compute_cost(&usage, &price, 1.0, false);
        let tier = price.above_200k.as_ref().unwrap();
        let expected = Decimal::from(250_000) * tier.input_cost_per_token
            + Decimal::from(100) * tier.output_cost_per_token;
        assert_eq!(cost, expected.round_dp(15));
    }

    #[test]
    fn context_1m_multiplier_wins_over_above_200k_when_both_configured() {
        let mut price = flat_price();
        price.above_200k = Some(AboveThresholdPrice {
            input_cost_per_token: dec!(0.000006),
            output_cost_per_token: dec!(0.00003),
            cache_creation_5m_cost_per_token: dec!(0.0000075),
            cache_creation_1h_cost_per_token: dec!(0.000012),
            cache_read_cost_per_token: dec!(0.0000006),
        });
        price.context_1m_multiplier = Some(Context1mMultiplier {
            input_multiplier: dec!(2.0),
            output_multiplier: dec!(1.5),
        });
        let usage = UsageTokens {
            input_tokens: 250_000,
            output_tokens: 1000,
            ..Default::default()
        };
        let cost = compute_cost(&usage, &price, 1.0, true);
        let expected = Decimal::from(250_000) * (price.input_cost_per_token * dec!(2.0))
            + Decimal::from(1000) * (price.output_cost_per_token * dec!(1.5));
        assert_eq!(cost, expected.round_dp(15));
    }

    #[test]
    fn below_threshold_usage_ignores_above_200k_tier() {
        let mut price = flat_price();
        price.above_200k = Some(AboveThresholdPrice {
            input_cost_per_token: dec!(0.000006),
            output_cost_per_token: dec!(0.00003),
            cache_creation_5m_cost_per_token: Decimal::ZERO,
            cache_creation_1h_cost_per_token: Decimal::ZERO,
            cache_read_cost_per_token: Decimal::ZERO,
        });
        let usage = UsageTokens {
            input_tokens: 100,
            output_tokens: 100,
            ..Default::default()
        };
        let cost = compute_cost(&usage, &price, 1.0, false);
        let expected = Decimal::from(100) * price.input_cost_per_token
            + Decimal::from(100) * price.output_cost_per_token;
        assert_eq!(cost, expected.round_dp(15));
    }
}
