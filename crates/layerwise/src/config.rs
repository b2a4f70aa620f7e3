//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::env;

/// Knobs applied when a [`crate::Worker`] is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the optimizer pipeline before preparing storage.
    pub optimize: bool,
    /// Move constant host data into the storage manager instead of copying it.
    pub take_constant_ownership: bool,
    /// Flush subnormal constant values to zero as the last pipeline step.
    pub round_denormals: bool,
    /// Fixed-point bound of the folding/cleanup group.
    pub pre_max_iters: usize,
    /// Fixed-point bound of the fusion group.
    pub post_max_iters: usize,
    /// Log per-pass statistics at debug level.
    pub log_pass_stats: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            take_constant_ownership: false,
            round_denormals: false,
            pre_max_iters: 4,
            post_max_iters: 8,
            log_pass_stats: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the `LAYERWISE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlays whichever `LAYERWISE_*` variables are set on `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(optimize) = env::flag(env::OPTIMIZE) {
            self.optimize = optimize;
        }
        if let Some(round) = env::flag(env::ROUND_DENORMALS) {
            self.round_denormals = round;
        }
        if let Some(stats) = env::flag(env::PASS_STATS) {
            self.log_pass_stats = stats;
        }
        if let Some(iters) = env::positive_usize(env::PRE_ITERS) {
            self.pre_max_iters = iters;
        }
        if let Some(iters) = env::positive_usize(env::POST_ITERS) {
            self.post_max_iters = iters;
        }
        self
    }

    /// Configuration that executes the graph exactly as imported.
    pub fn unoptimized() -> Self {
        Self {
            optimize: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "round_denormals": true, "post_max_iters": 2 }"#).unwrap();
        assert!(config.optimize);
        assert!(config.round_denormals);
        assert_eq!(config.post_max_iters, 2);
        assert_eq!(config.pre_max_iters, EngineConfig::default().pre_max_iters);
    }

    #[test]
    fn env_overrides_replace_only_valid_values() {
        std::env::set_var("LAYERWISE_ROUND_DENORMALS", "on");
        std::env::set_var("LAYERWISE_PRE_ITERS", "0");
        std::env::set_var("LAYERWISE_POST_ITERS", "7");
        let config = EngineConfig::from_env();
        std::env::remove_var("LAYERWISE_ROUND_DENORMALS");
        std::env::remove_var("LAYERWISE_PRE_ITERS");
        std::env::remove_var("LAYERWISE_POST_ITERS");

        assert!(config.round_denormals);
        assert_eq!(config.pre_max_iters, EngineConfig::default().pre_max_iters);
        assert_eq!(config.post_max_iters, 7);
    }
}
