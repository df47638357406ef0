//! Prompt-cache placement.
//!
//! Boundaries grow geometrically (ratio √2) from a per-tier granule. Walking
//! the history with a running token estimate, each message whose running total
//! first crosses a boundary becomes a candidate; the last `max_markers`
//! candidates get a cache marker after their content.

use std::f64::consts::SQRT_2;

use serde::Serialize;

use switchyard_core::config::{CacheConfig, ModelTier};
use switchyard_core::types::{ContentBlock, Message, ToolResultContent};

const CHARS_PER_TOKEN: f64 = 8.0;
const DOCUMENT_BYTES_PER_TOKEN: f64 = 3.0;
const IMAGE_BYTES_PER_TOKEN: f64 = 750.0;

/// Where cache markers go for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CachePlan {
    pub cache_system: bool,
    pub cache_tools: bool,
    /// Message indices followed by a marker, ascending.
    pub message_marks: Vec<usize>,
}

/// Infer a tier from the model id when the catalog has none.
pub fn tier_for_model(model_id: &str) -> ModelTier {
    let id = model_id.to_ascii_lowercase();
    if id.contains("opus") {
        ModelTier::Large
    } else if ["haiku", "lite", "micro", "mini"]
        .iter()
        .any(|k| id.contains(k))
    {
        ModelTier::Compact
    } else {
        ModelTier::Standard
    }
}

/// Smallest cacheable prefix, in tokens.
pub fn granule(tier: ModelTier) -> u64 {
    match tier {
        ModelTier::Large => 4096,
        ModelTier::Standard => 2048,
        ModelTier::Compact => 1024,
    }
}

/// Boundaries `granule × √2^k`, ascending, up to `ceiling`.
pub fn thresholds(granule: u64, ceiling: u64) -> Vec<f64> {
    let mut out = Vec::new();
    if granule == 0 {
        return out;
    }
    let mut k: i32 = 0;
    loop {
        // Even powers are exact powers of two.
        let mut t = granule as f64 * 2f64.powi(k / 2);
        if k % 2 == 1 {
            t *= SQRT_2;
        }
        if t > ceiling as f64 {
            break;
        }
        out.push(t);
        k += 1;
    }
    out
}

fn text_tokens(chars: usize) -> f64 {
    chars as f64 / CHARS_PER_TOKEN
}

/// Estimated token cost of one block.
pub fn estimate_block_tokens(block: &ContentBlock) -> f64 {
    match block {
        ContentBlock::Text { text } => text_tokens(text.chars().count()),
        ContentBlock::Reasoning { text, .. } => text_tokens(text.chars().count()),
        ContentBlock::ToolUse { name, input, .. } => {
            text_tokens(name.chars().count() + input.to_string().chars().count())
        }
        ContentBlock::ToolResult { content, .. } => content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text(t) => text_tokens(t.chars().count()),
                ToolResultContent::Json(v) => text_tokens(v.to_string().chars().count()),
            })
            .sum(),
        ContentBlock::Document { source, .. } => source.byte_len() as f64 / DOCUMENT_BYTES_PER_TOKEN,
        ContentBlock::Image { source, .. } => source.byte_len() as f64 / IMAGE_BYTES_PER_TOKEN,
        ContentBlock::CachePoint => 0.0,
    }
}

pub fn estimate_message_tokens(message: &Message) -> f64 {
    message.content.iter().map(estimate_block_tokens).sum()
}

/// Compute the cache plan. Pure and deterministic.
///
/// `tier` comes from the catalog; `None` falls back to [`tier_for_model`].
pub fn plan_cache(
    messages: &[Message],
    model_id: &str,
    tier: Option<ModelTier>,
    supports_cache: bool,
    settings: &CacheConfig,
) -> CachePlan {
    if !settings.enabled || !supports_cache {
        return CachePlan::default();
    }

    let tier = tier.unwrap_or_else(|| tier_for_model(model_id));
    let bounds = thresholds(granule(tier), settings.ceiling_tokens);

    let mut candidates = Vec::new();
    let mut total = 0.0;
    let mut next = 0;
    for (index, message) in messages.iter().enumerate() {
        total += estimate_message_tokens(message);
        let mut crossed = false;
        while next < bounds.len() && total >= bounds[next] {
            crossed = true;
            next += 1;
        }
        if crossed {
            candidates.push(index);
        }
    }

    let skip = candidates.len().saturating_sub(settings.max_markers);
    CachePlan {
        cache_system: true,
        cache_tools: true,
        message_marks: candidates.split_off(skip),
    }
}

/// Insert a cache marker after the content of each marked message.
pub fn apply_plan(messages: &mut [Message], plan: &CachePlan) {
    for &index in &plan.message_marks {
        if let Some(message) = messages.get_mut(index) {
            message.content.push(ContentBlock::CachePoint);
        }
    }
}
