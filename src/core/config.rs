// SPDX-License-Identifier: GPL-2.0
//! Detector configuration.
//!
//! Every analysis variant switch and budget lives in [`DetectorConfig`],
//! which is handed to the pipeline constructor.

use crate::core::error::{AnalysisError, Result};
use crate::core::log::LogLevel;

/// Default maximum number of risky pairs kept per partition.
pub const DEFAULT_RISKY_PAIR_BUDGET: usize = 3000;

/// Default number of worklist operations one top-level alias query may spend.
pub const DEFAULT_CFL_QUERY_BUDGET: i64 = 1000;

/// Default maximum length of an enumerated calling-context path.
pub const DEFAULT_MAX_CTX_PATH_SIZE: usize = 100;

/// Default maximum number of enumerated context path pairs.
pub const DEFAULT_MAX_PATH_PAIR_COUNT: usize = 1000;

/// Default maximum diagnostics log size.
pub const DEFAULT_MAX_LOG_SIZE: usize = 4 * 1024 * 1024;

/// Calling-context discipline used by the context-sensitive alias analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Plain call strings enumerated from the program entry.
    Standard,
    /// Call strings rooted at an abstract spawn-site context.
    #[default]
    Hybrid,
    /// Skip the context-sensitive refinement entirely.
    Disabled,
}

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Maximum number of risky pairs per partition.
    pub risky_pair_budget: usize,
    /// Keep collecting risky pairs after the budget is hit.
    pub compute_all_risky_pairs: bool,
    /// Operations one top-level alias query may spend.
    pub cfl_query_budget: i64,
    /// Maximum length of an enumerated calling-context path.
    pub max_ctx_path_size: usize,
    /// Maximum number of enumerated context path pairs.
    pub max_path_pair_count: usize,
    /// Context discipline of the alias refinement.
    pub context_mode: ContextMode,
    /// Only propagate locks inside the acquiring function.
    ///
    /// Unsound when a callee is invoked from both locked and unlocked call
    /// sites; kept as an opt-in speed trade-off.
    pub intraprocedural_lockset: bool,
    /// Treat variable-index field projections as touching every field.
    pub handle_variant_gep: bool,
    /// Treat calls to `free` as writes to the freed object.
    pub handle_free: bool,
    /// Produce the annotation consumed by runtime check injection.
    pub annotate: bool,
    /// Print per-partition details and record soft warnings.
    pub detail: bool,
    /// Record phase timings and counters.
    pub collect_stats: bool,
    /// Diagnostics log level.
    pub log_level: LogLevel,
    /// Diagnostics log size.
    pub max_log_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            risky_pair_budget: DEFAULT_RISKY_PAIR_BUDGET,
            compute_all_risky_pairs: false,
            cfl_query_budget: DEFAULT_CFL_QUERY_BUDGET,
            max_ctx_path_size: DEFAULT_MAX_CTX_PATH_SIZE,
            max_path_pair_count: DEFAULT_MAX_PATH_PAIR_COUNT,
            context_mode: ContextMode::default(),
            intraprocedural_lockset: false,
            handle_variant_gep: true,
            handle_free: false,
            annotate: false,
            detail: false,
            collect_stats: false,
            log_level: LogLevel::Off,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

impl DetectorConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration used when results are annotated for runtime checking:
    /// every risky pair is kept regardless of the budget.
    pub fn for_annotation() -> Self {
        Self {
            compute_all_risky_pairs: true,
            annotate: true,
            ..Self::default()
        }
    }

    /// Set the risky pair budget.
    pub fn with_risky_pair_budget(mut self, budget: usize) -> Self {
        self.risky_pair_budget = budget;
        self
    }

    /// Set the per-query alias budget.
    pub fn with_cfl_query_budget(mut self, budget: i64) -> Self {
        self.cfl_query_budget = budget;
        self
    }

    /// Set the context discipline.
    pub fn with_context_mode(mut self, mode: ContextMode) -> Self {
        self.context_mode = mode;
        self
    }

    /// Enable or disable the intraprocedural lockset mode.
    pub fn with_intraprocedural_lockset(mut self, on: bool) -> Self {
        self.intraprocedural_lockset = on;
        self
    }

    /// Enable detailed reporting; also raises the log level to `Info`.
    pub fn with_detail(mut self, on: bool) -> Self {
        self.detail = on;
        if on && self.log_level < LogLevel::Info {
            self.log_level = LogLevel::Info;
        }
        self
    }

    /// Set the diagnostics log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Check the configuration for values no analysis can work with.
    pub fn validate(&self) -> Result<()> {
        if self.risky_pair_budget == 0 {
            return Err(AnalysisError::InvalidConfig(
                "risky pair budget must be positive".into(),
            ));
        }
        if self.cfl_query_budget <= 0 {
            return Err(AnalysisError::InvalidConfig(
                "alias query budget must be positive".into(),
            ));
        }
        if self.max_ctx_path_size == 0 || self.max_path_pair_count == 0 {
            return Err(AnalysisError::InvalidConfig(
                "context path limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.context_mode, ContextMode::Hybrid);
        assert_eq!(config.risky_pair_budget, DEFAULT_RISKY_PAIR_BUDGET);
        assert!(!config.compute_all_risky_pairs);
        assert!(config.validate().is_ok());

        let standard = DetectorConfig::new().with_context_mode(ContextMode::Standard);
        assert_eq!(standard.context_mode, ContextMode::Standard);
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        let config = DetectorConfig::default().with_cfl_query_budget(0);
        assert!(matches!(config.validate(), Err(AnalysisError::InvalidConfig(_))));

        let mut config = DetectorConfig::default();
        config.max_path_pair_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detail_raises_log_level() {
        let config = DetectorConfig::default().with_detail(true);
        assert!(config.log_level >= LogLevel::Info);
        assert!(DetectorConfig::for_annotation().compute_all_risky_pairs);
    }
}
