//! Engine-wide configuration.
//!
//! Loaded from JSON (every field optional) and then adjusted from the
//! environment:
//!
//! - `FASTLOAD_MAX_PARALLEL_TASKS` overrides `max_parallel_tasks`
//! - `FASTLOAD_PERF_LOGGING=1|true` enables per-phase timing traces

use std::path::Path;

use serde::Deserialize;

use crate::error::{LoadError, LoadResult};

const MAX_PARALLEL_ENV: &str = "FASTLOAD_MAX_PARALLEL_TASKS";
const PERF_LOGGING_ENV: &str = "FASTLOAD_PERF_LOGGING";

/// Check if per-phase timing traces are enabled via env var.
pub(crate) fn perf_logging_enabled() -> bool {
    std::env::var(PERF_LOGGING_ENV).is_ok_and(|v| v == "1" || v == "true")
}

/// Configuration for the image service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Maximum lifecycles in resolve/decode/transform at once.
    /// `None` derives the limit from available cores.
    pub max_parallel_tasks: Option<usize>,
    /// Extra pool threads for admission work (delays, stream init,
    /// placeholders) so it never competes with running lifecycles.
    pub admission_threads: usize,
    /// Share of the running slots preload requests may occupy.
    pub preload_slot_percent: usize,
    /// Delay applied before admitting a request, unless the request sets one.
    pub delay_ms: u64,
    /// Pixels per device-independent unit.
    pub display_scale: f32,
    /// Apply request transformations to placeholders as well.
    pub transform_placeholders: bool,
    pub fade_animation_enabled: bool,
    pub fade_animation_for_cached_images: bool,
    pub clear_memory_cache_on_out_of_memory: bool,
    /// Route success/error/finish callbacks through the dispatcher.
    pub execute_callbacks_on_ui_thread: bool,
    /// Capacity of the default memory cache.
    pub memory_cache_size_mb: usize,
    /// Decoded images larger than this are reported as out of memory.
    pub max_decoded_bytes: usize,
    pub verbose_performance_logging: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_parallel_tasks: None,
            admission_threads: 2,
            preload_slot_percent: 50,
            delay_ms: 0,
            display_scale: 1.0,
            transform_placeholders: true,
            fade_animation_enabled: true,
            fade_animation_for_cached_images: false,
            clear_memory_cache_on_out_of_memory: true,
            execute_callbacks_on_ui_thread: false,
            memory_cache_size_mb: 256,
            max_decoded_bytes: 256 * 1024 * 1024,
            verbose_performance_logging: false,
        }
    }
}

impl Configuration {
    /// Parse configuration from a JSON document.
    pub fn from_json_str(json: &str) -> LoadResult<Self> {
        let config: Configuration = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> LoadResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Apply `FASTLOAD_*` environment overrides.
    pub fn with_env_overrides(mut self) -> LoadResult<Self> {
        if let Ok(value) = std::env::var(MAX_PARALLEL_ENV) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                LoadError::Config(format!(
                    "{MAX_PARALLEL_ENV} must be a positive integer, got {value:?}"
                ))
            })?;
            self.max_parallel_tasks = Some(parsed);
        }
        if std::env::var(PERF_LOGGING_ENV).is_ok() {
            self.verbose_performance_logging = perf_logging_enabled();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> LoadResult<()> {
        if self.max_parallel_tasks == Some(0) {
            return Err(LoadError::Config("max_parallel_tasks must be > 0".into()));
        }
        if self.preload_slot_percent > 100 {
            return Err(LoadError::Config(
                "preload_slot_percent must be <= 100".into(),
            ));
        }
        if !(self.display_scale > 0.0) {
            return Err(LoadError::Config("display_scale must be > 0".into()));
        }
        Ok(())
    }

    /// Effective parallelism limit.
    pub fn effective_max_parallel_tasks(&self) -> usize {
        self.max_parallel_tasks.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
                .max(2)
        })
    }

    /// Running slots preload requests may occupy. At least one, so preloading
    /// always makes progress.
    pub fn preload_slot_limit(&self) -> usize {
        let max = self.effective_max_parallel_tasks();
        (max * self.preload_slot_percent / 100).max(1)
    }

    /// Convert device-independent units to pixels.
    pub fn dip_to_pixels(&self, dip: u32) -> u32 {
        (dip as f32 * self.display_scale).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert!(config.effective_max_parallel_tasks() >= 2);
        assert!(config.transform_placeholders);
        assert!(!config.fade_animation_for_cached_images);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            Configuration::from_json_str(r#"{"max_parallel_tasks": 3, "display_scale": 2.0}"#)
                .unwrap();
        assert_eq!(config.effective_max_parallel_tasks(), 3);
        assert_eq!(config.dip_to_pixels(50), 100);
        assert_eq!(config.preload_slot_percent, 50);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(Configuration::from_json_str("{not json").is_err());
        assert!(Configuration::from_json_str(r#"{"max_parallel_tasks": 0}"#).is_err());
        assert!(Configuration::from_json_str(r#"{"preload_slot_percent": 150}"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("fastload.json");
        std::fs::write(&path, r#"{"delay_ms": 15}"#).unwrap();

        let config = Configuration::from_file(&path).unwrap();
        assert_eq!(config.delay_ms, 15);
    }

    #[test]
    fn test_preload_slot_limit() {
        let mut config = Configuration {
            max_parallel_tasks: Some(8),
            ..Default::default()
        };
        assert_eq!(config.preload_slot_limit(), 4);

        config.max_parallel_tasks = Some(1);
        assert_eq!(config.preload_slot_limit(), 1);

        config.max_parallel_tasks = Some(3);
        config.preload_slot_percent = 0;
        assert_eq!(config.preload_slot_limit(), 1);
    }

    #[test]
    fn test_dip_rounding() {
        let config = Configuration {
            display_scale: 1.5,
            ..Default::default()
        };
        assert_eq!(config.dip_to_pixels(33), 50);
        assert_eq!(config.dip_to_pixels(0), 0);
    }
}
