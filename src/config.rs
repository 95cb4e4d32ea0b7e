// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::{DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL};

/// Overrides the archive location; used to isolate test runs
pub const PATH_ENV: &str = "STARTUP_CACHE_PATH";
pub const WRITE_DELAY_ENV: &str = "STARTUP_CACHE_WRITE_DELAY_MS";
pub const PREFETCH_ENV: &str = "STARTUP_CACHE_PREFETCH";
pub const COMPRESSION_LEVEL_ENV: &str = "STARTUP_CACHE_COMPRESSION_LEVEL";
pub const CHUNK_SIZE_ENV: &str = "STARTUP_CACHE_CHUNK_SIZE";

/// Default debounce before the write-back runs
pub const DEFAULT_WRITE_DELAY: Duration = Duration::from_secs(60);

/// Retained tables past this count are logged as suspicious
pub const DEFAULT_RETAINED_TABLE_WARN_THRESHOLD: usize = 10;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Resolved archive path
    pub path: PathBuf,
    pub write_delay: Duration,
    /// Warm the page cache after a successful load
    pub prefetch: bool,
    pub compression_level: i32,
    /// Uncompressed bytes fed to the encoder per call
    pub chunk_size: usize,
    pub retained_table_warn_threshold: usize,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_delay: DEFAULT_WRITE_DELAY,
            prefetch: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retained_table_warn_threshold: DEFAULT_RETAINED_TABLE_WARN_THRESHOLD,
        }
    }

    /// Defaults for `default_path`, with environment overrides applied
    pub fn from_env(default_path: impl Into<PathBuf>) -> Self {
        Self::from_lookup(default_path, |name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(default_path: impl Into<PathBuf>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new(default_path);
        Self {
            path: lookup(PATH_ENV)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            write_delay: lookup(WRITE_DELAY_ENV)
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_delay),
            prefetch: lookup(PREFETCH_ENV)
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.prefetch),
            compression_level: lookup(COMPRESSION_LEVEL_ENV)
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compression_level),
            chunk_size: lookup(CHUNK_SIZE_ENV)
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.chunk_size),
            retained_table_warn_threshold: defaults.retained_table_warn_threshold,
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.path.as_os_str().is_empty() {
            return Err("cache path cannot be empty".to_string());
        }

        if self.chunk_size == 0 {
            return Err(format!("{} must be at least 1", CHUNK_SIZE_ENV));
        }

        if !(1..=22).contains(&self.compression_level) {
            return Err(format!(
                "{} must be between 1 and 22, got {}",
                COMPRESSION_LEVEL_ENV, self.compression_level
            ));
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfig::from_lookup("/profile/startupCache.bin", lookup(&[]));
        assert_eq!(config.path, PathBuf::from("/profile/startupCache.bin"));
        assert_eq!(config.write_delay, Duration::from_secs(60));
        assert!(config.prefetch);
        assert_eq!(config.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = CacheConfig::from_lookup(
            "/profile/startupCache.bin",
            lookup(&[
                (PATH_ENV, "/tmp/isolated.bin"),
                (WRITE_DELAY_ENV, "250"),
                (PREFETCH_ENV, "off"),
                (COMPRESSION_LEVEL_ENV, "9"),
                (CHUNK_SIZE_ENV, "4096"),
            ]),
        );
        assert_eq!(config.path, PathBuf::from("/tmp/isolated.bin"));
        assert_eq!(config.write_delay, Duration::from_millis(250));
        assert!(!config.prefetch);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.chunk_size, 4096);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = CacheConfig::from_lookup(
            "default.bin",
            lookup(&[
                (PATH_ENV, ""),
                (WRITE_DELAY_ENV, "soon"),
                (PREFETCH_ENV, "maybe"),
            ]),
        );
        assert_eq!(config.path, PathBuf::from("default.bin"));
        assert_eq!(config.write_delay, DEFAULT_WRITE_DELAY);
        assert!(config.prefetch);
    }

    #[test]
    fn test_validate() {
        assert!(CacheConfig::new("").validate().is_err());
        assert!(CacheConfig::new("c.bin").with_chunk_size(0).validate().is_err());
        assert!(CacheConfig::new("c.bin")
            .with_compression_level(23)
            .validate()
            .is_err());
        assert!(CacheConfig::new("c.bin")
            .with_compression_level(1)
            .validate()
            .is_ok());
    }
}
