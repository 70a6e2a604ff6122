//! Cost calculation for gateway requests.
//!
//! Two flavors: a pre-dispatch estimate used for budget reservations,
//! derived from the prompt size and the requested max output tokens, and
//! the actual cost computed from provider-reported usage after the call.

use tracing::{debug, warn};

use super::pricing::PricingTable;
use super::types::TokenUsage;

/// Rough characters-per-token ratio used for the pre-dispatch input
/// estimate when no tokenizer is available.
const CHARS_PER_TOKEN: usize = 4;

/// Calculator over a pricing table.
pub struct CostCalculator {
    table: PricingTable,
}

impl CostCalculator {
    pub fn new(table: PricingTable) -> Self {
        Self { table }
    }

    /// Estimate the worst-case cost of a request before dispatch: the
    /// approximate prompt tokens as input plus the full requested output
    /// budget.
    pub fn estimate(&self, model: &str, prompt_chars: usize, max_tokens: u32) -> f64 {
        let tokens_in = approx_tokens(prompt_chars);
        self.cost_for(model, tokens_in, max_tokens)
    }

    /// Actual cost from provider-reported usage.
    pub fn actual(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.cost_for(model, usage.tokens_in, usage.tokens_out)
    }

    /// Whether pricing is available for a model.
    pub fn has_pricing(&self, model: &str) -> bool {
        self.table.has_pricing(model)
    }

    fn cost_for(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        let Some(pricing) = self.table.get(model) else {
            warn!(model = %model, "No pricing data for model, costing as 0.0");
            return 0.0;
        };

        let input_cost = (f64::from(tokens_in) / 1_000_000.0) * pricing.input_per_million;
        let output_cost = (f64::from(tokens_out) / 1_000_000.0) * pricing.output_per_million;
        let cost = input_cost + output_cost;

        debug!(
            model = %model,
            tokens_in,
            tokens_out,
            cost_usd = %format!("${cost:.6}"),
            "Calculated request cost"
        );

        cost
    }
}

/// Approximate token count for a piece of text.
pub fn approx_tokens(chars: usize) -> u32 {
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> CostCalculator {
        CostCalculator::new(PricingTable::with_defaults())
    }

    #[test]
    fn test_actual_cost_gpt4o() {
        let usage = TokenUsage {
            tokens_in: 1000,
            tokens_out: 500,
        };
        let cost = calculator().actual("gpt-4o", &usage);

        // (1000/1M * $2.50) + (500/1M * $10.00) = $0.0025 + $0.005 = $0.0075
        assert!((cost - 0.0075).abs() < 1e-9);
    }

    #[test]
    fn test_actual_cost_gemini() {
        let usage = TokenUsage {
            tokens_in: 10_000,
            tokens_out: 2_000,
        };
        let cost = calculator().actual("gemini-2.5-flash", &usage);

        // (10000/1M * $0.075) + (2000/1M * $0.30) = $0.00075 + $0.0006
        assert!((cost - 0.00135).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_uses_full_output_budget() {
        let calc = calculator();
        // 4000 chars ~ 1000 input tokens; 500 output tokens requested.
        let estimate = calc.estimate("gpt-4o", 4000, 500);
        let actual = calc.actual(
            "gpt-4o",
            &TokenUsage {
                tokens_in: 1000,
                tokens_out: 500,
            },
        );
        assert!((estimate - actual).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let cost = calculator().actual(
            "unknown-model",
            &TokenUsage {
                tokens_in: 1000,
                tokens_out: 500,
            },
        );
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_approx_tokens_rounds_up() {
        assert_eq!(approx_tokens(0), 0);
        assert_eq!(approx_tokens(1), 1);
        assert_eq!(approx_tokens(4), 1);
        assert_eq!(approx_tokens(5), 2);
        assert_eq!(approx_tokens(4000), 1000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Cost is non-negative, finite, and monotone in token counts
            /// for every priced model.
            #[test]
            fn prop_cost_sane_and_monotone(
                model in prop::sample::select(vec![
                    "gpt-4o", "gpt-4-turbo", "o1", "o3-mini",
                    "gemini-2.5-flash", "gemini-2.5-pro",
                ]),
                tokens_in in 0u32..1_000_000,
                tokens_out in 0u32..1_000_000,
            ) {
                let calc = calculator();
                let usage = TokenUsage { tokens_in, tokens_out };
                let cost = calc.actual(model, &usage);

                prop_assert!(cost >= 0.0);
                prop_assert!(cost.is_finite());

                let more = TokenUsage {
                    tokens_in: tokens_in + 1,
                    tokens_out: tokens_out + 1,
                };
                prop_assert!(calc.actual(model, &more) >= cost);
            }
        }
    }
}
