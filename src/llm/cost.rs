//! Cost accounting for LLM usage.
//!
//! Per-call prices come from [`ModelPricing`]; the shared [`CostTracker`]
//! aggregates spend across every agent of a batch run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Micro-dollars per dollar. Integer accounting keeps concurrent sums exact.
const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Price of a model in dollars per one million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per 1M prompt tokens.
    #[serde(default)]
    pub input_per_1m: f64,
    /// Dollars per 1M completion tokens.
    #[serde(default)]
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn new(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
        }
    }

    /// Dollar cost of a single call.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// A single usage record for an LLM API call.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    /// Instance the call was made for, if any.
    pub instance_id: Option<String>,
}

/// Summary of tracked spend.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub total_cost: f64,
    pub total_calls: u64,
    pub by_model: HashMap<String, f64>,
}

/// Thread-safe aggregate of LLM spend.
pub struct CostTracker {
    spent_micros: AtomicU64,
    calls: AtomicU64,
    cost_by_model: RwLock<HashMap<String, u64>>,
    usage_history: RwLock<Vec<UsageRecord>>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            spent_micros: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            cost_by_model: RwLock::new(HashMap::new()),
            usage_history: RwLock::new(Vec::new()),
        }
    }

    /// Record one call and return its dollar cost.
    pub fn record_usage(
        &self,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        pricing: &ModelPricing,
        instance_id: Option<&str>,
    ) -> f64 {
        let cost = pricing.cost(input_tokens, output_tokens);
        let micros = dollars_to_micros(cost);

        self.spent_micros.fetch_add(micros, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut by_model) = self.cost_by_model.write() {
            *by_model.entry(model.to_string()).or_insert(0) += micros;
        }

        if let Ok(mut history) = self.usage_history.write() {
            history.push(UsageRecord {
                timestamp: Utc::now(),
                model: model.to_string(),
                input_tokens,
                output_tokens,
                cost,
                instance_id: instance_id.map(str::to_string),
            });
        }

        tracing::debug!(
            model = model,
            input_tokens = input_tokens,
            output_tokens = output_tokens,
            cost = cost,
            "Recorded LLM usage"
        );
        cost
    }

    /// Total dollars spent so far.
    pub fn total_cost(&self) -> f64 {
        micros_to_dollars(self.spent_micros.load(Ordering::SeqCst))
    }

    /// Total number of recorded calls.
    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Usage records for a given instance.
    pub fn usage_for_instance(&self, instance_id: &str) -> Vec<UsageRecord> {
        self.usage_history
            .read()
            .map(|history| {
                history
                    .iter()
                    .filter(|r| r.instance_id.as_deref() == Some(instance_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn report(&self) -> CostReport {
        let by_model = self
            .cost_by_model
            .read()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), micros_to_dollars(*v)))
                    .collect()
            })
            .unwrap_or_default();
        CostReport {
            total_cost: self.total_cost(),
            total_calls: self.total_calls(),
            by_model,
        }
    }
}

fn dollars_to_micros(dollars: f64) -> u64 {
    (dollars * MICROS_PER_DOLLAR).round().max(0.0) as u64
}

fn micros_to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_cost() {
        let pricing = ModelPricing::new(3.0, 15.0);
        let cost = pricing.cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_free_model_costs_nothing() {
        let pricing = ModelPricing::default();
        assert_eq!(pricing.cost(50_000, 50_000), 0.0);
    }

    #[test]
    fn test_tracker_aggregates_calls() {
        let tracker = CostTracker::new();
        let pricing = ModelPricing::new(3.0, 15.0);

        tracker.record_usage("model-a", 1000, 500, &pricing, Some("inst-1"));
        tracker.record_usage("model-a", 1000, 500, &pricing, Some("inst-2"));
        tracker.record_usage("model-b", 2000, 0, &pricing, None);

        assert_eq!(tracker.total_calls(), 3);
        // 2 * (0.003 + 0.0075) + 0.006
        assert!((tracker.total_cost() - 0.027).abs() < 1e-6);

        let report = tracker.report();
        assert_eq!(report.by_model.len(), 2);
        assert!((report.by_model["model-b"] - 0.006).abs() < 1e-6);
        assert_eq!(tracker.usage_for_instance("inst-1").len(), 1);
    }

    #[test]
    fn test_small_calls_are_not_rounded_away() {
        let tracker = CostTracker::new();
        tracker.record_usage("m", 100, 10, &ModelPricing::new(3.0, 15.0), None);
        assert!(tracker.total_cost() > 0.0);
    }
}
