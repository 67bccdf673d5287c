//! Persistence configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! consolidation_period = 10
//! verify_checksums = true
//!
//! [backend]
//! kind = "sqlite"
//! path = ".strata/strata.db"
//!
//! [[link_rules]]
//! kind = "plan_element"
//! forward_field = "task"
//! back_field = "plan_element"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PersistenceError, Result, ResultExt};
use crate::repair::LinkRule;

/// Default number of deltas between consolidations
pub const DEFAULT_CONSOLIDATION_PERIOD: u32 = 10;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Consolidate when the next delta number is a multiple of this. 0 disables consolidation.
    pub consolidation_period: u32,

    /// Verify each delta's payload checksum on read
    pub verify_checksums: bool,

    /// Back-pointer rules applied after rehydration
    pub link_rules: Vec<LinkRule>,

    /// Where deltas live
    pub backend: BackendConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            consolidation_period: DEFAULT_CONSOLIDATION_PERIOD,
            verify_checksums: true,
            link_rules: vec![LinkRule::plan_element_task()],
            backend: BackendConfig::default(),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// One directory per agent under `root`
    File { root: PathBuf },
    /// One database shared by all agents
    Sqlite { path: PathBuf },
    Memory,
    Noop,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::File {
            root: PathBuf::from(".strata"),
        }
    }
}

impl PersistenceConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consolidation_period(mut self, period: u32) -> Self {
        self.consolidation_period = period;
        self
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Replace the link rules
    pub fn with_link_rules(mut self, rules: Vec<LinkRule>) -> Self {
        self.link_rules = rules;
        self
    }

    /// Add one link rule to the existing ones
    pub fn with_link_rule(mut self, rule: LinkRule) -> Self {
        self.link_rules.push(rule);
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config '{}'", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PersistenceError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.link_rules {
            if rule.kind.is_empty() || rule.forward_field.is_empty() || rule.back_field.is_empty() {
                return Err(PersistenceError::InvalidConfig(format!(
                    "link rule {:?} has an empty name",
                    rule
                )));
            }
        }
        match &self.backend {
            BackendConfig::File { root } if root.as_os_str().is_empty() => Err(
                PersistenceError::InvalidConfig("file backend root is empty".to_string()),
            ),
            BackendConfig::Sqlite { path } if path.as_os_str().is_empty() => Err(
                PersistenceError::InvalidConfig("sqlite backend path is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PersistenceConfig::default();
        assert_eq!(config.consolidation_period, 10);
        assert!(config.verify_checksums);
        assert_eq!(config.link_rules, vec![LinkRule::plan_element_task()]);
        assert_eq!(
            config.backend,
            BackendConfig::File {
                root: PathBuf::from(".strata")
            }
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PersistenceConfig::from_toml_str(
            r#"
            consolidation_period = 4

            [backend]
            kind = "sqlite"
            path = "/var/lib/strata/strata.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.consolidation_period, 4);
        assert!(config.verify_checksums);
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite {
                path: PathBuf::from("/var/lib/strata/strata.db")
            }
        );
    }

    #[test]
    fn test_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("strata.toml");
        let config = PersistenceConfig::new()
            .with_consolidation_period(3)
            .with_link_rule(LinkRule::new("order", "invoice", "order"))
            .with_backend(BackendConfig::Memory);

        config.to_file(&path).unwrap();
        assert_eq!(PersistenceConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let err = PersistenceConfig::from_toml_str(
            r#"
            [[link_rules]]
            kind = ""
            forward_field = "a"
            back_field = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidConfig(_)));
    }
}
