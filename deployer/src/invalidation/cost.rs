//! Tiered invalidation cost model
//!
//! Amounts are integer micro-USD so that tier arithmetic is exact.

use serde::{Deserialize, Serialize};

/// Tiered per-path pricing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostModel {
    /// Patterns billed at the base rate
    #[serde(default = "default_tier_threshold")]
    pub tier_threshold: usize,

    /// Rate for each pattern up to the threshold (R1)
    #[serde(default = "default_base_rate")]
    pub base_rate_micros: u64,

    /// Rate for each pattern beyond the threshold (R2 < R1)
    #[serde(default = "default_overage_rate")]
    pub overage_rate_micros: u64,
}

fn default_tier_threshold() -> usize {
    1_000
}

fn default_base_rate() -> u64 {
    5_000
}

fn default_overage_rate() -> u64 {
    4_000
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            tier_threshold: default_tier_threshold(),
            base_rate_micros: default_base_rate(),
            overage_rate_micros: default_overage_rate(),
        }
    }
}

impl CostModel {
    /// Cost of invalidating `pattern_count` patterns
    pub fn estimate(&self, pattern_count: usize) -> u64 {
        let base = pattern_count.min(self.tier_threshold) as u64;
        let overage = pattern_count.saturating_sub(self.tier_threshold) as u64;
        base * self.base_rate_micros + overage * self.overage_rate_micros
    }
}

/// Render micro-USD as dollars
pub fn format_usd(micros: u64) -> String {
    format!("${}.{:06}", micros / 1_000_000, micros % 1_000_000)
}
