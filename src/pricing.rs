//! Cost calculation from token usage and per-model pricing.
//!
//! Prices are per million tokens across four categories: base input,
//! 5-minute cache writes, cache reads, and output, with long-context
//! multipliers that kick in when any step's input exceeds the model's
//! threshold. Cache tokens are a subset of input tokens in the provider's
//! usage report, so base input cost is computed on
//! `input − cache_write − cache_read` to avoid double counting.

use crate::types::StepUsage;
use serde::{Deserialize, Serialize};

/// Pricing data for a single model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub model_id: &'static str,
    pub display_name: &'static str,
    pub input_per_mtok: f64,
    pub cache_write_5m_per_mtok: f64,
    pub cache_write_1h_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub output_per_mtok: f64,
    pub long_context_input_multiplier: f64,
    pub long_context_output_multiplier: f64,
    /// 0 means the model has no long-context pricing tier
    pub long_context_threshold: u64,
}

/// Bundled pricing table. Versioned API names resolve by substring match,
/// longest id first, so keep ids in their base form here.
const PRICING: &[ModelPricing] = &[
    ModelPricing {
        model_id: "claude-sonnet-4-5",
        display_name: "Claude Sonnet 4.5",
        input_per_mtok: 3.0,
        cache_write_5m_per_mtok: 3.75,
        cache_write_1h_per_mtok: 6.0,
        cache_read_per_mtok: 0.30,
        output_per_mtok: 15.0,
        long_context_input_multiplier: 2.0,
        long_context_output_multiplier: 1.5,
        long_context_threshold: 200_000,
    },
    ModelPricing {
        model_id: "claude-sonnet-4",
        display_name: "Claude Sonnet 4",
        input_per_mtok: 3.0,
        cache_write_5m_per_mtok: 3.75,
        cache_write_1h_per_mtok: 6.0,
        cache_read_per_mtok: 0.30,
        output_per_mtok: 15.0,
        long_context_input_multiplier: 2.0,
        long_context_output_multiplier: 1.5,
        long_context_threshold: 200_000,
    },
    ModelPricing {
        model_id: "claude-opus-4-1",
        display_name: "Claude Opus 4.1",
        input_per_mtok: 15.0,
        cache_write_5m_per_mtok: 18.75,
        cache_write_1h_per_mtok: 30.0,
        cache_read_per_mtok: 1.50,
        output_per_mtok: 75.0,
        long_context_input_multiplier: 1.0,
        long_context_output_multiplier: 1.0,
        long_context_threshold: 0,
    },
    ModelPricing {
        model_id: "claude-opus-4",
        display_name: "Claude Opus 4",
        input_per_mtok: 15.0,
        cache_write_5m_per_mtok: 18.75,
        cache_write_1h_per_mtok: 30.0,
        cache_read_per_mtok: 1.50,
        output_per_mtok: 75.0,
        long_context_input_multiplier: 1.0,
        long_context_output_multiplier: 1.0,
        long_context_threshold: 0,
    },
    ModelPricing {
        model_id: "claude-haiku-4-5",
        display_name: "Claude Haiku 4.5",
        input_per_mtok: 1.0,
        cache_write_5m_per_mtok: 1.25,
        cache_write_1h_per_mtok: 2.0,
        cache_read_per_mtok: 0.10,
        output_per_mtok: 5.0,
        long_context_input_multiplier: 1.0,
        long_context_output_multiplier: 1.0,
        long_context_threshold: 0,
    },
    ModelPricing {
        model_id: "claude-3-7-sonnet",
        display_name: "Claude Sonnet 3.7",
        input_per_mtok: 3.0,
        cache_write_5m_per_mtok: 3.75,
        cache_write_1h_per_mtok: 6.0,
        cache_read_per_mtok: 0.30,
        output_per_mtok: 15.0,
        long_context_input_multiplier: 1.0,
        long_context_output_multiplier: 1.0,
        long_context_threshold: 0,
    },
    ModelPricing {
        model_id: "claude-3-5-haiku",
        display_name: "Claude Haiku 3.5",
        input_per_mtok: 0.80,
        cache_write_5m_per_mtok: 1.0,
        cache_write_1h_per_mtok: 1.6,
        cache_read_per_mtok: 0.08,
        output_per_mtok: 4.0,
        long_context_input_multiplier: 1.0,
        long_context_output_multiplier: 1.0,
        long_context_threshold: 0,
    },
];

/// Detailed cost breakdown for an agent run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_write_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,

    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_creation_tokens: u64,
    pub total_cache_read_tokens: u64,

    pub model_id: String,
    pub long_context_applied: bool,
    pub currency: String,
}

/// Resolve an API model name to its pricing entry: exact match first, then
/// longest-substring match so "claude-sonnet-4-5-20250929" resolves to
/// "claude-sonnet-4-5" rather than "claude-sonnet-4".
pub fn resolve_model_pricing(model_name: &str) -> Option<&'static ModelPricing> {
    if let Some(exact) = PRICING.iter().find(|p| p.model_id == model_name) {
        return Some(exact);
    }

    let mut candidates: Vec<&ModelPricing> = PRICING
        .iter()
        .filter(|p| model_name.contains(p.model_id))
        .collect();
    candidates.sort_by_key(|p| std::cmp::Reverse(p.model_id.len()));

    if candidates.is_empty() {
        log::warn!("unknown model for cost calculation: {model_name}");
    }
    candidates.first().copied()
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Total cost for a run, summed over per-step usage.
///
/// Long-context pricing applies when any single step's input tokens exceed
/// the model's threshold. Returns `None` for models without pricing data.
pub fn calculate_run_cost(usage_history: &[StepUsage], model_name: &str) -> Option<CostBreakdown> {
    let pricing = resolve_model_pricing(model_name)?;

    if usage_history.is_empty() {
        return Some(CostBreakdown {
            model_id: pricing.model_id.to_string(),
            currency: "USD".to_string(),
            ..Default::default()
        });
    }

    let total_input: u64 = usage_history.iter().map(|s| s.input_tokens).sum();
    let total_output: u64 = usage_history.iter().map(|s| s.output_tokens).sum();
    let total_cache_write: u64 = usage_history
        .iter()
        .map(|s| s.cache_creation_input_tokens)
        .sum();
    let total_cache_read: u64 = usage_history
        .iter()
        .map(|s| s.cache_read_input_tokens)
        .sum();

    let long_context = pricing.long_context_threshold > 0
        && usage_history
            .iter()
            .any(|s| s.input_tokens > pricing.long_context_threshold);

    let input_multiplier = if long_context {
        pricing.long_context_input_multiplier
    } else {
        1.0
    };
    let output_multiplier = if long_context {
        pricing.long_context_output_multiplier
    } else {
        1.0
    };

    // Cache tokens are a subset of input tokens in the usage report.
    let base_input = total_input.saturating_sub(total_cache_write + total_cache_read);

    let mtok = 1_000_000.0;
    let input_cost = (base_input as f64 / mtok) * pricing.input_per_mtok * input_multiplier;
    let output_cost = (total_output as f64 / mtok) * pricing.output_per_mtok * output_multiplier;
    // Cache writes use the 5-minute TTL rate, the API default.
    let cache_write_cost =
        (total_cache_write as f64 / mtok) * pricing.cache_write_5m_per_mtok * input_multiplier;
    let cache_read_cost =
        (total_cache_read as f64 / mtok) * pricing.cache_read_per_mtok * input_multiplier;

    Some(CostBreakdown {
        input_cost: round6(input_cost),
        output_cost: round6(output_cost),
        cache_write_cost: round6(cache_write_cost),
        cache_read_cost: round6(cache_read_cost),
        total_cost: round6(input_cost + output_cost + cache_write_cost + cache_read_cost),
        total_input_tokens: total_input,
        total_output_tokens: total_output,
        total_cache_creation_tokens: total_cache_write,
        total_cache_read_tokens: total_cache_read,
        model_id: pricing.model_id.to_string(),
        long_context_applied: long_context,
        currency: "USD".to_string(),
    })
}
