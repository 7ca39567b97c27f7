// src/config.rs
//! Bridge configuration. Every section has sane defaults; a JSON file only needs
//! the fields it overrides.
//!
//! ```json
//! { "compiler": { "max_retries": 5 }, "resolver": { "passthrough_prefixes": ["/Engine/", "/Plugin/"] } }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub compiler: CompilerConfig,
    pub resolver: ResolverConfig,
    pub watcher: WatcherConfig,
    pub binding: BindingConfig,
}

impl BridgeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("reading config {}", path.display())))?;
        Self::from_json_str(&text).map_err(|e| e.context(format!("parsing config {}", path.display())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Worker threads; 0 = available parallelism.
    pub worker_threads: usize,
    /// Retries after `BackendUnavailable` before giving up.
    pub max_retries: u32,
    /// First retry delay (ms), doubled per attempt.
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Compiled permutations kept in memory.
    pub cache_capacity: usize,
    /// Emit `#line` directives so backend errors point at the authored lines.
    pub accurate_errors: bool,
    /// Tag folded into every permutation key.
    pub compiler_version: String,
    /// Path or name of the `dxc` executable.
    pub dxc_path: PathBuf,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_retries: 3,
            retry_backoff_ms: 50,
            max_backoff_ms: 2_000,
            cache_capacity: 512,
            accurate_errors: true,
            compiler_version: "dxc-1".to_string(),
            dxc_path: PathBuf::from("dxc"),
        }
    }
}

impl CompilerConfig {
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Includes under these prefixes are host-provided and left verbatim.
    pub passthrough_prefixes: Vec<String>,
    /// Resolved blocks kept in the resolver cache.
    pub cache_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            passthrough_prefixes: vec!["/Engine/".to_string()],
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Debounce window for snippet file changes (ms).
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 150 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Constant-buffer layouts cached by binding table.
    pub layout_cache_capacity: usize,
    /// Clamp scalar values to their `Range` meta tag.
    pub clamp_to_range: bool,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            layout_cache_capacity: 64,
            clamp_to_range: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = BridgeConfig::from_json_str(r#"{ "compiler": { "max_retries": 7 } }"#).unwrap();
        assert_eq!(cfg.compiler.max_retries, 7);
        assert_eq!(cfg.compiler.retry_backoff_ms, 50);
        assert_eq!(cfg.resolver.passthrough_prefixes, vec!["/Engine/".to_string()]);
        assert_eq!(cfg.watcher.debounce_ms, 150);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(matches!(
            BridgeConfig::from_json_str("{ nope"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_effective_workers() {
        let mut cfg = CompilerConfig::default();
        assert!(cfg.effective_workers() >= 1);
        cfg.worker_threads = 2;
        assert_eq!(cfg.effective_workers(), 2);
    }
}
