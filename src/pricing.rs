//! Model pricing table and cost computation.
//!
//! The Cost Ledger and every savings-estimating stage (guard, cache, prefix
//! optimizer) compute cost through [`cost`], which never returns zero for an
//! unrecognized model - it falls back to a conservative flat rate instead.

use std::collections::HashMap;

/// Per-million-token pricing for a single model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingEntry {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Discounted rate for cached input tokens. Defaults to half the
    /// regular input rate when a model doesn't publish one.
    pub cached_input_per_million: Option<f64>,
    /// Context window size, used by the Prefix Optimizer to flag overflow.
    pub context_window: Option<u32>,
}

impl PricingEntry {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            cached_input_per_million: None,
            context_window: None,
        }
    }

    pub fn with_cached_input(mut self, cached_input_per_million: f64) -> Self {
        self.cached_input_per_million = Some(cached_input_per_million);
        self
    }

    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = Some(context_window);
        self
    }

    fn cached_rate(&self) -> f64 {
        self.cached_input_per_million
            .unwrap_or(self.input_per_million * 0.5)
    }
}

/// Fallback pricing applied to any model with no table entry. Chosen to be
/// non-zero and roughly mid-tier so cost-without-shield comparisons for
/// unknown models still mean something.
pub const FALLBACK_PRICING: PricingEntry = PricingEntry {
    input_per_million: 0.15,
    output_per_million: 0.60,
    cached_input_per_million: None,
    context_window: None,
};

/// Maps model identifiers to pricing, with a guaranteed fallback entry.
#[derive(Debug, Clone)]
pub struct ModelPricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl Default for ModelPricingTable {
    fn default() -> Self {
        Self::with_common_models()
    }
}

impl ModelPricingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A pricing table preloaded with widely used models, useful for tests
    /// and as a sane default before the caller supplies its own table.
    pub fn with_common_models() -> Self {
        let mut table = Self::new();
        table.insert(
            "gpt-4o",
            PricingEntry::new(2.50, 10.00)
                .with_cached_input(1.25)
                .with_context_window(128_000),
        );
        table.insert(
            "gpt-4o-mini",
            PricingEntry::new(0.15, 0.60)
                .with_cached_input(0.075)
                .with_context_window(128_000),
        );
        table.insert(
            "claude-3-5-sonnet-20241022",
            PricingEntry::new(3.00, 15.00)
                .with_cached_input(0.30)
                .with_context_window(200_000),
        );
        table.insert(
            "claude-3-haiku-20240307",
            PricingEntry::new(0.25, 1.25)
                .with_cached_input(0.03)
                .with_context_window(200_000),
        );
        table
    }

    pub fn insert(&mut self, model: impl Into<String>, entry: PricingEntry) -> &mut Self {
        self.entries.insert(model.into(), entry);
        self
    }

    pub fn get(&self, model: &str) -> PricingEntry {
        self.entries.get(model).copied().unwrap_or(FALLBACK_PRICING)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.entries.contains_key(model)
    }
}

/// Compute the actual cost of a call: `input_tokens` includes
/// `cached_tokens`, which are billed at the cached rate instead of the
/// regular input rate.
pub fn cost(table: &ModelPricingTable, model: &str, input_tokens: u32, output_tokens: u32, cached_tokens: u32) -> f64 {
    let entry = table.get(model);
    let cached_tokens = cached_tokens.min(input_tokens);
    let regular_input = (input_tokens - cached_tokens) as f64;
    let cached_input = cached_tokens as f64;
    let output = output_tokens as f64;

    (regular_input / 1_000_000.0) * entry.input_per_million
        + (cached_input / 1_000_000.0) * entry.cached_rate()
        + (output / 1_000_000.0) * entry.output_per_million
}

#[cfg(test)]
mod pricing_tests {
    use super::*;

    // UNIT UNDER TEST: ModelPricingTable and cost()
    // BUSINESS RESPONSIBILITY: cost computation must never silently produce
    //   zero for an unrecognized model, and cached tokens must be billed at
    //   the discounted rate rather than the full input rate.
    // TEST COVERAGE:
    //   - unknown model falls back to non-zero pricing
    //   - cached tokens reduce cost relative to all-regular tokens
    //   - cached_tokens is clamped to input_tokens

    #[test]
    fn unknown_model_uses_nonzero_fallback_pricing() {
        // Arrange
        let table = ModelPricingTable::new();

        // Act
        let c = cost(&table, "totally-unknown-model", 1_000_000, 0, 0);

        // Assert
        assert!((c - 0.15).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_are_cheaper_than_regular_tokens() {
        // Arrange
        let table = ModelPricingTable::with_common_models();

        // Act
        let all_regular = cost(&table, "gpt-4o", 1000, 0, 0);
        let all_cached = cost(&table, "gpt-4o", 1000, 0, 1000);

        // Assert
        assert!(all_cached < all_regular);
    }

    #[test]
    fn cached_tokens_beyond_input_tokens_are_clamped() {
        // Arrange
        let table = ModelPricingTable::with_common_models();

        // Act
        let clamped = cost(&table, "gpt-4o", 100, 0, 1000);
        let exact = cost(&table, "gpt-4o", 100, 0, 100);

        // Assert
        assert!((clamped - exact).abs() < 1e-9);
    }
}
