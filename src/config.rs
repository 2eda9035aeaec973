//! Allocator budgets loaded from TOML
//!
//! ```toml
//! [arena]
//! capacity = 1048576
//!
//! [scratch]
//! capacity = 65536
//!
//! [heap]
//! capacity = 4194304
//! strategy = "best_fit"
//! ```
//!
//! Every table and field is optional; missing values fall back to 1 MiB
//! first-fit budgets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::arena::ArenaAllocator;
use crate::error::Result;
use crate::heap::{FitStrategy, HeapAllocator};
use crate::region::mib;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Long-lived bump allocations
    #[serde(default)]
    pub arena: ArenaConfig,

    /// Per-frame / per-task bump allocations, reset in bulk
    #[serde(default)]
    pub scratch: ScratchConfig,

    #[serde(default)]
    pub heap: HeapConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub strategy: FitStrategy,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            strategy: FitStrategy::default(),
        }
    }
}

fn default_capacity() -> usize {
    mib(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Read(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(msg) => write!(f, "Failed to read config: {}", msg),
            Self::Parse(msg) => write!(f, "Failed to parse config: {}", msg),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl MemoryConfig {
    /// Load and validate a config file
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let budgets = [
            ("arena", self.arena.capacity),
            ("scratch", self.scratch.capacity),
            ("heap", self.heap.capacity),
        ];
        match budgets.iter().find(|(_, capacity)| *capacity == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{}.capacity must be greater than zero", name))),
            None => Ok(()),
        }
    }

    pub fn build_arena(&self) -> Result<ArenaAllocator> {
        ArenaAllocator::try_new(self.arena.capacity)
    }

    pub fn build_scratch(&self) -> Result<ArenaAllocator> {
        ArenaAllocator::try_new(self.scratch.capacity)
    }

    pub fn build_heap(&self) -> Result<HeapAllocator> {
        HeapAllocator::try_new(self.heap.capacity, self.heap.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::kib;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MemoryConfig::from_toml_str("").unwrap();
        assert_eq!(config, MemoryConfig::default());
        assert_eq!(config.heap.capacity, mib(1));
        assert_eq!(config.heap.strategy, FitStrategy::FirstFit);
    }

    #[test]
    fn test_partial_tables() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [heap]
            strategy = "best_fit"

            [scratch]
            capacity = 65536
            "#,
        )
        .unwrap();

        assert_eq!(config.heap.strategy, FitStrategy::BestFit);
        assert_eq!(config.heap.capacity, mib(1));
        assert_eq!(config.scratch.capacity, kib(64));
        assert_eq!(config.arena.capacity, mib(1));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = MemoryConfig::from_toml_str("[arena]\ncapacity = 0\n").unwrap_err();
        assert_eq!(err, ConfigError::Invalid("arena.capacity must be greater than zero".to_string()));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = MemoryConfig::from_toml_str("[heap]\nstrategy = \"worst_fit\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = MemoryConfig::default();
        config.heap.strategy = FitStrategy::BestFit;
        config.arena.capacity = kib(256);

        let text = config.to_toml_string().unwrap();
        assert_eq!(MemoryConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file_builds_allocators() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[arena]\ncapacity = 8192\n\n[heap]\ncapacity = 4096\nstrategy = \"best_fit\"").unwrap();

        let config = MemoryConfig::from_file(file.path()).unwrap();
        let arena = config.build_arena().unwrap();
        let heap = config.build_heap().unwrap();
        let scratch = config.build_scratch().unwrap();

        assert_eq!(arena.capacity(), 8192);
        assert_eq!(heap.capacity(), 4096);
        assert_eq!(heap.strategy(), FitStrategy::BestFit);
        assert_eq!(scratch.capacity(), mib(1));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MemoryConfig::from_file(dir.path().join("memory.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
