//! Fortress configuration and validation.
//!
//! Configuration is read from TOML or YAML (picked by file extension) and
//! validated before any patch is touched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gates::GateSpec;
use crate::rerank::RerankConfig;
use crate::sandbox::{Quota, SandboxConfig};

/// Default name of the per-repository control directory.
pub const DEFAULT_CONTROL_DIR: &str = ".patch-fortress";

/// File names looked up inside the control directory by [`FortressConfig::discover`].
const CONFIG_FILE_NAMES: &[&str] = &["config.toml", "config.yaml", "config.yml"];

/// Quotas above these values are accepted with a warning.
const LARGE_CPU_SECONDS: u64 = 600;
const LARGE_MEM_MB: u64 = 16 * 1024;
const LARGE_TIMEOUT_S: u64 = 3600;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for Quota {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.cpu_seconds == 0 {
            result.add_error("quota.cpu_seconds must be greater than 0");
        } else if self.cpu_seconds > LARGE_CPU_SECONDS {
            result.add_warning(format!(
                "quota.cpu_seconds is very large ({}s)",
                self.cpu_seconds
            ));
        }

        if self.mem_mb == 0 {
            result.add_error("quota.mem_mb must be greater than 0");
        } else if self.mem_mb > LARGE_MEM_MB {
            result.add_warning(format!("quota.mem_mb is very large ({} MiB)", self.mem_mb));
        }

        if self.timeout_s == 0 {
            result.add_error("quota.timeout_s must be greater than 0");
        } else if self.timeout_s > LARGE_TIMEOUT_S {
            result.add_warning(format!(
                "quota.timeout_s is very large ({}s)",
                self.timeout_s
            ));
        }

        if self.network_enabled {
            result.add_warning("quota.network_enabled is on; gates may reach the network");
        }

        result
    }
}

impl Validate for [GateSpec] {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut seen = HashSet::new();

        if self.is_empty() {
            result.add_warning("no gates configured; every applied diff will be committed");
        }

        for (index, gate) in self.iter().enumerate() {
            if gate.name.trim().is_empty() {
                result.add_error(format!("gate #{} has an empty name", index));
            } else if !seen.insert(gate.name.as_str()) {
                result.add_error(format!("duplicate gate name '{}'", gate.name));
            }

            if gate.command.first().map_or(true, |p| p.trim().is_empty()) {
                result.add_error(format!("gate '{}' has an empty command", gate.name));
            }
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.output_cap_bytes == 0 {
            result.add_error("sandbox.output_cap_bytes must be greater than 0");
        }
        if self.max_open_files < 16 {
            result.add_warning(format!(
                "sandbox.max_open_files is very low ({})",
                self.max_open_files
            ));
        }
        if let Some(tool) = self
            .blocked_network_tools
            .iter()
            .find(|t| t.is_empty() || t.contains('/'))
        {
            result.add_error(format!("invalid blocked network tool name '{}'", tool));
        }

        result
    }
}

impl Validate for RerankConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.parallelism == 0 {
            result.add_error("rerank.parallelism must be at least 1");
        }
        if self.max_candidates == Some(0) {
            result.add_error("rerank.max_candidates must be at least 1 when set");
        }
        if self.max_diff_lines == Some(0) {
            result.add_error("rerank.max_diff_lines must be at least 1 when set");
        }

        result
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FortressConfig {
    /// Quota applied to every gate command.
    #[serde(default)]
    pub quota: Quota,

    /// Ordered validation gates.
    #[serde(default = "GateSpec::default_pipeline")]
    pub gates: Vec<GateSpec>,

    /// Control directory relative to the repository root.
    #[serde(default = "default_control_dir")]
    pub control_dir: String,

    /// Whether a diff that fails to apply also writes a rollback lock.
    #[serde(default = "default_true")]
    pub lock_on_apply_failure: bool,

    /// Whether a passing patch is committed.
    #[serde(default = "default_true")]
    pub commit: bool,

    /// Commit message for passing patches.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Reranker settings.
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

fn default_control_dir() -> String {
    DEFAULT_CONTROL_DIR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_commit_message() -> String {
    "patch-fortress: apply guarded patch".to_string()
}

impl Default for FortressConfig {
    fn default() -> Self {
        Self {
            quota: Quota::default(),
            gates: GateSpec::default_pipeline(),
            control_dir: default_control_dir(),
            lock_on_apply_failure: true,
            commit: true,
            commit_message: default_commit_message(),
            rerank: RerankConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl FortressConfig {
    /// Sets the quota.
    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.quota = quota;
        self
    }

    /// Replaces the gate list.
    pub fn with_gates(mut self, gates: Vec<GateSpec>) -> Self {
        self.gates = gates;
        self
    }

    /// Sets the control directory.
    pub fn with_control_dir(mut self, control_dir: impl Into<String>) -> Self {
        self.control_dir = control_dir.into();
        self
    }

    /// Sets whether apply failures lock the repository.
    pub fn with_lock_on_apply_failure(mut self, lock: bool) -> Self {
        self.lock_on_apply_failure = lock;
        self
    }

    /// Sets whether passing patches are committed.
    pub fn with_commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Parses TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML config: {}", e)))
    }

    /// Parses YAML configuration.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid YAML config: {}", e)))
    }

    /// Loads configuration from `path`, choosing the format by extension.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?path, "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };
        tracing::debug!(path = ?path, gates = config.gates.len(), "config loaded");
        Ok(config)
    }

    /// Finds a config file in `<repo>/.patch-fortress/` or returns defaults.
    pub fn discover(repo: &Path) -> Result<Self> {
        match Self::discover_path(repo) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    fn discover_path(repo: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| repo.join(DEFAULT_CONTROL_DIR).join(name))
            .find(|p| p.is_file())
    }

    /// Validates and logs warnings; errors become [`Error::Config`].
    pub fn validated(self) -> Result<Self> {
        for warning in self.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }
        Ok(self)
    }
}

impl Validate for FortressConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.quota.validate());
        result.merge(self.gates.validate());
        result.merge(self.rerank.validate());
        result.merge(self.sandbox.validate());

        let control = Path::new(&self.control_dir);
        if self.control_dir.trim().is_empty() {
            result.add_error("control_dir must not be empty");
        } else if control.is_absolute()
            || control
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            result.add_error(format!(
                "control_dir '{}' must be a relative path inside the repository",
                self.control_dir
            ));
        }

        if self.commit && self.commit_message.trim().is_empty() {
            result.add_error("commit_message must not be empty when commit is enabled");
        }

        if !self.lock_on_apply_failure {
            result.add_warning("lock_on_apply_failure is off; malformed diffs will not lock");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let result = FortressConfig::default().validate();
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FortressConfig::default();
        assert_eq!(config.control_dir, ".patch-fortress");
        assert!(config.lock_on_apply_failure);
        assert!(config.commit);
        assert_eq!(config.gates.len(), 4);
        assert_eq!(config.quota, Quota::default());
    }

    #[test]
    fn zero_quota_fails() {
        let quota = Quota::default().with_timeout_s(0).with_cpu_seconds(0);
        let result = quota.validate();
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn large_quota_warns() {
        let quota = Quota::default().with_mem_mb(64 * 1024);
        let result = quota.validate();
        assert!(result.is_valid());
        assert!(result.warnings[0].contains("mem_mb"));
    }

    #[test]
    fn network_enabled_warns() {
        let result = Quota::default().with_network(true).validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("network")));
    }

    #[test]
    fn duplicate_and_empty_gates_fail() {
        let gates = vec![
            GateSpec::new("lint", ["npm", "run", "lint"]),
            GateSpec::new("lint", ["npm", "run", "lint"]),
            GateSpec::new("", ["true"]),
            GateSpec::new("build", Vec::<String>::new()),
        ];
        let result = gates.validate();
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().any(|e| e.contains("duplicate")));
        assert!(result.errors.iter().any(|e| e.contains("empty name")));
        assert!(result.errors.iter().any(|e| e.contains("empty command")));
    }

    #[test]
    fn control_dir_must_stay_inside_repo() {
        let config = FortressConfig::default().with_control_dir("../outside");
        assert!(!config.validate().is_valid());

        let config = FortressConfig::default().with_control_dir("/abs");
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn zero_parallelism_fails() {
        let mut config = FortressConfig::default();
        config.rerank.parallelism = 0;
        assert!(config.validated().is_err());
    }

    #[test]
    fn parses_toml_with_partial_fields() {
        let config = FortressConfig::from_toml_str(
            r#"
            lock_on_apply_failure = false

            [quota]
            timeout_s = 5

            [[gates]]
            name = "tests"
            command = ["cargo", "test"]
            "#,
        )
        .unwrap();

        assert!(!config.lock_on_apply_failure);
        assert_eq!(config.quota.timeout_s, 5);
        assert_eq!(config.quota.cpu_seconds, 10);
        assert_eq!(config.gates, vec![GateSpec::new("tests", ["cargo", "test"])]);
        assert_eq!(config.control_dir, ".patch-fortress");
    }

    #[test]
    fn parses_yaml() {
        let config = FortressConfig::from_yaml_str(
            "commit: false\nrerank:\n  parallelism: 3\n  max_candidates: 2\n",
        )
        .unwrap();
        assert!(!config.commit);
        assert_eq!(config.rerank.parallelism, 3);
        assert_eq!(config.rerank.max_candidates, Some(2));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = TempDir::new().unwrap();
        let toml_path = dir.path().join("fortress.toml");
        let yaml_path = dir.path().join("fortress.yml");
        std::fs::write(&toml_path, "control_dir = \".ctl\"\n").unwrap();
        std::fs::write(&yaml_path, "control_dir: .other\n").unwrap();

        assert_eq!(FortressConfig::load(&toml_path).unwrap().control_dir, ".ctl");
        assert_eq!(FortressConfig::load(&yaml_path).unwrap().control_dir, ".other");
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = FortressConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, FortressConfig::default());
    }

    #[test]
    fn load_rejects_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fortress.ini");
        std::fs::write(&path, "x").unwrap();
        assert!(matches!(FortressConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let result = FortressConfig::from_toml_str("quota = 3");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn discover_reads_control_dir_config() {
        let dir = TempDir::new().unwrap();
        let control = dir.path().join(DEFAULT_CONTROL_DIR);
        std::fs::create_dir_all(&control).unwrap();
        std::fs::write(control.join("config.toml"), "commit = false\n").unwrap();

        assert!(!FortressConfig::discover(dir.path()).unwrap().commit);
    }

    #[test]
    fn validation_result_into_result_ok_on_valid() {
        let mut result = ValidationResult::default();
        result.add_warning("just a warning");

        let warnings = result.into_result().unwrap();
        assert_eq!(warnings, vec!["just a warning".to_string()]);
    }

    #[test]
    fn validation_result_into_result_err_on_invalid() {
        let mut result = ValidationResult::default();
        result.add_error("fatal error");
        assert!(result.into_result().is_err());
    }
}
