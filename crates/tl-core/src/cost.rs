//! Display-only cost estimates from token usage.
//!
//! Prices are per million tokens and approximate. Nothing depends on these numbers being exact.

use serde::Deserialize;

use crate::record::LogRecord;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// Token usage reported on an assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Reads `message.usage`, if the record has one.
    pub fn from_record(record: &LogRecord) -> Option<Self> {
        record
            .payload
            .get("usage")
            .filter(|usage| usage.is_object())
            .and_then(|usage| serde_json::from_value(usage.clone()).ok())
    }

    #[allow(clippy::cast_precision_loss)]
    fn cost(&self, price: &Pricing) -> f64 {
        (self.input_tokens as f64 * price.input
            + self.output_tokens as f64 * price.output
            + self.cache_creation_input_tokens as f64 * price.cache_write
            + self.cache_read_input_tokens as f64 * price.cache_read)
            / TOKENS_PER_UNIT
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pricing {
    input: f64,
    output: f64,
    cache_write: f64,
    cache_read: f64,
}

const OPUS: Pricing = Pricing {
    input: 15.0,
    output: 75.0,
    cache_write: 18.75,
    cache_read: 1.5,
};

const SONNET: Pricing = Pricing {
    input: 3.0,
    output: 15.0,
    cache_write: 3.75,
    cache_read: 0.3,
};

const HAIKU: Pricing = Pricing {
    input: 0.8,
    output: 4.0,
    cache_write: 1.0,
    cache_read: 0.08,
};

/// Picks a price table by model family. Unknown models are priced as sonnet.
fn pricing_for(model: Option<&str>) -> Pricing {
    let model = model.unwrap_or_default().to_ascii_lowercase();
    if model.contains("opus") {
        OPUS
    } else if model.contains("haiku") {
        HAIKU
    } else {
        SONNET
    }
}

/// Estimated cost in USD for one model/usage pair.
pub fn estimate(model: Option<&str>, usage: &Usage) -> f64 {
    usage.cost(&pricing_for(model))
}

/// Estimated cost of a record, `0.0` when it carries no usage.
pub fn record_cost(record: &LogRecord) -> f64 {
    Usage::from_record(record).map_or(0.0, |usage| estimate(record.model(), &usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::thread::tests::record;

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn prices_by_model_family() {
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..Usage::default()
        };
        assert_close(estimate(Some("claude-opus-4-20250514"), &usage), 90.0);
        assert_close(estimate(Some("claude-sonnet-4-20250514"), &usage), 18.0);
        assert_close(estimate(Some("claude-3-5-haiku-20241022"), &usage), 4.8);
        assert_close(estimate(None, &usage), 18.0);
    }

    #[test]
    fn cache_tokens_are_priced_separately() {
        let usage = Usage {
            cache_creation_input_tokens: 1_000_000,
            cache_read_input_tokens: 1_000_000,
            ..Usage::default()
        };
        assert_close(estimate(Some("sonnet"), &usage), 4.05);
    }

    #[test]
    fn record_without_usage_costs_nothing() {
        let with_usage = record(
            r#"{"type":"assistant","uuid":"a1","sessionId":"s1","timestamp":"2025-03-01T10:00:00Z","message":{"model":"claude-opus-4","content":"hi","usage":{"input_tokens":1000,"output_tokens":100}}}"#,
        );
        assert_close(record_cost(&with_usage), 0.0225);

        let without = record(
            r#"{"type":"user","uuid":"u1","sessionId":"s1","timestamp":"2025-03-01T10:00:00Z","message":{"content":"hi"}}"#,
        );
        assert_close(record_cost(&without), 0.0);
    }
}
