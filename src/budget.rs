//! Output-length budgeting against a finite context window.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parameters of the output budget. Lengths are in characters, budgets in tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Output tokens requested for a prompt of up to `char_base` characters.
    pub base: u32,
    /// Reference prompt length beyond which the budget scales up.
    pub char_base: u32,
    /// Hard ceiling before the context-window clamp.
    pub max: u32,
    pub multiplier: f64,
    /// Floor applied after the multiplier.
    pub min_output: u32,
    pub char_per_token: f64,
    /// Assumed context window of every resource, in tokens.
    pub context_window: u32,
    pub safety_margin: u32,
    /// Minimal budget range used when the input alone fills the window.
    pub fallback_floor: u32,
    pub fallback_ceiling: u32,
    /// Hard caps keyed by stage name, `review`, or `translation_draft`.
    pub stage_caps: BTreeMap<String, u32>,
    /// Factor applied when the backend still rejects a request as too large.
    pub shrink_factor: f64,
    /// Below this the oversized request is abandoned.
    pub shrink_floor: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            base: 1_024,
            char_base: 1_000,
            max: 8_192,
            multiplier: 1.0,
            min_output: 1_024,
            char_per_token: 3.5,
            context_window: 32_768,
            safety_margin: 100,
            fallback_floor: 200,
            fallback_ceiling: 512,
            stage_caps: BTreeMap::new(),
            shrink_factor: 0.7,
            shrink_floor: 200,
        }
    }
}

impl BudgetConfig {
    /// Estimated input tokens for `prompt`.
    pub fn estimate_input_tokens(&self, prompt: &str) -> u32 {
        let div = if self.char_per_token > 0.0 {
            self.char_per_token
        } else {
            3.5
        };
        (prompt.chars().count() as f64 / div) as u32
    }

    /// Output tokens to request for `prompt`, capped by `cap_key` when a cap
    /// is configured for it.
    pub fn budget(&self, prompt: &str, cap_key: &str) -> u32 {
        let len = prompt.chars().count() as f64;

        // Scale with input length, never below base.
        let scale = if self.char_base > 0 {
            (len / self.char_base as f64).max(1.0)
        } else {
            1.0
        };
        let mut out = ((self.base as f64 * scale) as u32).max(self.base);

        if self.multiplier > 0.0 && (self.multiplier - 1.0).abs() > f64::EPSILON {
            out = (out as f64 * self.multiplier) as u32;
        }
        out = out.max(self.min_output);

        if self.max > 0 {
            out = out.min(self.max);
        }

        if self.context_window > 0 {
            let input = self.estimate_input_tokens(prompt);
            let limit = self.context_window.saturating_sub(self.safety_margin);
            if input.saturating_add(out) > limit {
                let available = self.context_window as i64 - input as i64 - self.safety_margin as i64;
                out = if available > 0 {
                    out.min(available as u32)
                } else {
                    out.min(self.fallback_ceiling).max(self.fallback_floor)
                };
            }
        }

        match self.stage_caps.get(cap_key) {
            Some(cap) if *cap > 0 => out.min(*cap),
            _ => out,
        }
    }

    /// Next budget after an oversized rejection, or `None` once below the floor.
    pub fn shrink(&self, current: u32) -> Option<u32> {
        let next = (current as f64 * self.shrink_factor).round() as u32;
        if next < self.shrink_floor || next >= current {
            None
        } else {
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BudgetConfig {
        BudgetConfig {
            base: 500,
            char_base: 1_000,
            max: 4_000,
            min_output: 500,
            context_window: 8_192,
            ..Default::default()
        }
    }

    #[test]
    fn short_prompts_get_base() {
        let cfg = config();
        assert_eq!(cfg.budget("", "syntactic"), 500);
        assert_eq!(cfg.budget(&"x".repeat(999), "syntactic"), 500);
    }

    #[test]
    fn budget_scales_then_clamps_to_max() {
        let cfg = config();
        assert_eq!(cfg.budget(&"x".repeat(2_000), "syntactic"), 1_000);
        assert_eq!(cfg.budget(&"x".repeat(3_000), "syntactic"), 1_500);
        assert_eq!(cfg.budget(&"x".repeat(9_000), "syntactic"), 4_000);
    }

    #[test]
    fn budget_is_monotonic_below_context_pressure() {
        let cfg = config();
        let mut last = 0;
        for len in (0..12_000).step_by(250) {
            let b = cfg.budget(&"x".repeat(len), "semantic");
            assert!(b >= last, "budget dropped at len {len}: {b} < {last}");
            last = b;
        }
    }

    #[test]
    fn stage_cap_wins_last() {
        let mut cfg = config();
        cfg.stage_caps.insert("review".into(), 300);
        for len in [0, 1_500, 5_000, 40_000] {
            let prompt = "y".repeat(len);
            assert!(cfg.budget(&prompt, "review") <= 300);
        }
        assert_eq!(cfg.budget("", "semantic"), 500);
    }

    #[test]
    fn context_window_clamps_output() {
        let cfg = config();
        // 21_000 chars / 3.5 = 6_000 input tokens; 8_192 - 6_000 - 100 = 2_092 left.
        assert_eq!(cfg.budget(&"z".repeat(21_000), "syntactic"), 2_092);
    }

    #[test]
    fn overfull_input_keeps_minimal_output() {
        let cfg = config();
        let b = cfg.budget(&"z".repeat(40_000), "syntactic");
        assert_eq!(b, 512);

        let small = BudgetConfig {
            base: 100,
            min_output: 100,
            max: 150,
            ..config()
        };
        assert_eq!(small.budget(&"z".repeat(40_000), "x"), 200);
    }

    #[test]
    fn multiplier_then_floor() {
        let cfg = BudgetConfig {
            multiplier: 0.5,
            min_output: 400,
            ..config()
        };
        assert_eq!(cfg.budget("", "x"), 400);
        assert_eq!(cfg.budget(&"x".repeat(4_000), "x"), 1_000);
    }

    #[test]
    fn shrink_walks_down_to_floor() {
        let cfg = config();
        let mut steps = vec![1_000];
        while let Some(next) = cfg.shrink(*steps.last().unwrap()) {
            steps.push(next);
        }
        assert_eq!(steps, vec![1_000, 700, 490, 343, 240]);
        assert!(cfg.shrink(240).is_none());
    }
}
