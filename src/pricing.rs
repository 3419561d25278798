use once_cell::sync::Lazy;

use crate::tokens::TokenUsage;

/// USD per million tokens for one model family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
}

/// Known model pricing, longest-prefix matched so dated releases
/// (e.g. `claude-3-5-sonnet-20241022`) resolve to their family.
static PRICING: Lazy<Vec<(&'static str, ModelPricing)>> = Lazy::new(|| {
    vec![
        (
            "claude-opus-4",
            ModelPricing {
                input: 15.0,
                output: 75.0,
                cache_creation: 18.75,
                cache_read: 1.5,
            },
        ),
        (
            "claude-sonnet-4",
            ModelPricing {
                input: 3.0,
                output: 15.0,
                cache_creation: 3.75,
                cache_read: 0.3,
            },
        ),
        (
            "claude-3-7-sonnet",
            ModelPricing {
                input: 3.0,
                output: 15.0,
                cache_creation: 3.75,
                cache_read: 0.3,
            },
        ),
        (
            "claude-3-5-sonnet",
            ModelPricing {
                input: 3.0,
                output: 15.0,
                cache_creation: 3.75,
                cache_read: 0.3,
            },
        ),
        (
            "claude-3-5-haiku",
            ModelPricing {
                input: 0.8,
                output: 4.0,
                cache_creation: 1.0,
                cache_read: 0.08,
            },
        ),
        (
            "claude-3-opus",
            ModelPricing {
                input: 15.0,
                output: 75.0,
                cache_creation: 18.75,
                cache_read: 1.5,
            },
        ),
        (
            "claude-3-haiku",
            ModelPricing {
                input: 0.25,
                output: 1.25,
                cache_creation: 0.3,
                cache_read: 0.03,
            },
        ),
    ]
});

/// Pricing for `model`, or `None` for unknown models (cost is then omitted
/// from lifecycle records rather than guessed).
pub fn get_pricing(model: &str) -> Option<ModelPricing> {
    let mut best: Option<(&str, ModelPricing)> = None;
    for (prefix, pricing) in PRICING.iter() {
        if model.starts_with(prefix) {
            match best {
                Some((current, _)) if current.len() >= prefix.len() => {}
                _ => best = Some((prefix, *pricing)),
            }
        }
    }
    best.map(|(_, pricing)| pricing)
}

/// Cost in USD for `usage` under `pricing`
pub fn compute_cost(usage: &TokenUsage, pricing: &ModelPricing) -> f64 {
    (usage.input_tokens as f64 * pricing.input
        + usage.output_tokens as f64 * pricing.output
        + usage.cache_creation_input_tokens as f64 * pricing.cache_creation
        + usage.cache_read_input_tokens as f64 * pricing.cache_read)
        / 1_000_000.0
}
