//! Model pricing table.
//!
//! Prices are in USD per 1M tokens (input/output). A set of well-known
//! models ships as defaults; deployments override or extend the table from
//! the `[provider.pricing]` configuration section.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pricing for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per 1M input tokens in USD.
    pub input_per_million: f64,
    /// Cost per 1M output tokens in USD.
    pub output_per_million: f64,
}

/// Model name -> pricing lookup.
#[derive(Debug, Clone)]
pub struct PricingTable {
    pricing: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Table pre-populated with well-known model pricing.
    pub fn with_defaults() -> Self {
        let mut pricing = HashMap::new();

        // OpenAI-compatible backends
        pricing.insert(
            "gpt-4o".to_string(),
            ModelPricing {
                input_per_million: 2.50,
                output_per_million: 10.00,
            },
        );
        pricing.insert(
            "gpt-4-turbo".to_string(),
            ModelPricing {
                input_per_million: 10.00,
                output_per_million: 30.00,
            },
        );
        pricing.insert(
            "o1".to_string(),
            ModelPricing {
                input_per_million: 15.00,
                output_per_million: 60.00,
            },
        );
        pricing.insert(
            "o3-mini".to_string(),
            ModelPricing {
                input_per_million: 1.10,
                output_per_million: 4.40,
            },
        );

        // Gemini (Google)
        pricing.insert(
            "gemini-2.5-flash".to_string(),
            ModelPricing {
                input_per_million: 0.075,
                output_per_million: 0.30,
            },
        );
        pricing.insert(
            "gemini-2.5-pro".to_string(),
            ModelPricing {
                input_per_million: 1.25,
                output_per_million: 5.00,
            },
        );
        pricing.insert(
            "gemini-2.0-flash".to_string(),
            ModelPricing {
                input_per_million: 0.075,
                output_per_million: 0.30,
            },
        );

        Self { pricing }
    }

    /// An empty table (for tests and fully explicit configurations).
    pub fn empty() -> Self {
        Self {
            pricing: HashMap::new(),
        }
    }

    /// Insert or overwrite entries from configuration.
    pub fn extend(&mut self, entries: &HashMap<String, ModelPricing>) {
        for (model, pricing) in entries {
            self.pricing.insert(model.clone(), *pricing);
        }
    }

    /// Pricing for a specific model.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing.get(model)
    }

    /// Whether pricing exists for a model.
    pub fn has_pricing(&self, model: &str) -> bool {
        self.pricing.contains_key(model)
    }

    /// All models with pricing data.
    pub fn models(&self) -> Vec<&str> {
        self.pricing.keys().map(String::as_str).collect()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
