use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Scheduler config ──────────────────────────────────────────

/// Step scheduler configuration, parsed from TOML or the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    /// Ceiling on a single attempt's run time. A step whose next grant
    /// exceeds this is failed permanently.
    #[serde(default = "default_max_permitted_run_time")]
    pub max_permitted_run_time_secs: u64,
    /// Most cores any one machine offers. 0 = no cap.
    #[serde(default = "default_max_machine_cores")]
    pub max_machine_cores: u32,
    /// How far back build time counts against a jobset's share.
    #[serde(default = "default_scheduling_window")]
    pub scheduling_window_secs: u64,
    /// Shares for jobsets registered without an explicit count.
    #[serde(default = "default_jobset_shares")]
    pub default_jobset_shares: u32,
}

fn default_max_permitted_run_time() -> u64 { 10 * 60 * 60 }
fn default_max_machine_cores() -> u32 { 0 }
fn default_scheduling_window() -> u64 { 24 * 60 * 60 }
fn default_jobset_shares() -> u32 { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            max_permitted_run_time_secs: default_max_permitted_run_time(),
            max_machine_cores: default_max_machine_cores(),
            scheduling_window_secs: default_scheduling_window(),
            default_jobset_shares: default_jobset_shares(),
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `FARM_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, CoreError> {
        let profile = env_or("FARM_PROFILE", "").to_uppercase();
        Self::from_env_profiled(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    /// Values are checked the same way as a TOML file's.
    pub fn from_env_profiled(profile: &str) -> Result<Self, CoreError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let config = Self {
            profile: p.to_string(),
            max_permitted_run_time_secs: profiled_env_u64(
                p,
                "FARM_MAX_PERMITTED_RUN_TIME",
                default_max_permitted_run_time(),
            ),
            max_machine_cores: profiled_env_u32(p, "FARM_MAX_MACHINE_CORES", default_max_machine_cores()),
            scheduling_window_secs: profiled_env_u64(
                p,
                "FARM_SCHEDULING_WINDOW",
                default_scheduling_window(),
            ),
            default_jobset_shares: profiled_env_u32(
                p,
                "FARM_DEFAULT_JOBSET_SHARES",
                default_jobset_shares(),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.default_jobset_shares == 0 {
            return Err(CoreError::Config("default_jobset_shares must be > 0".into()));
        }
        if self.scheduling_window_secs == 0 {
            return Err(CoreError::Config("scheduling_window_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn max_permitted_run_time(&self) -> Duration {
        Duration::from_secs(self.max_permitted_run_time_secs)
    }

    pub fn scheduling_window(&self) -> Duration {
        Duration::from_secs(self.scheduling_window_secs)
    }

    /// Machine core cap, `None` when unlimited.
    pub fn machine_core_cap(&self) -> Option<u32> {
        (self.max_machine_cores > 0).then_some(self.max_machine_cores)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config loaded (profile: {}):", self.profile_label());
        tracing::info!("  max run time:  {}s", self.max_permitted_run_time_secs);
        tracing::info!(
            "  machine cores: {}",
            self.machine_core_cap()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(unlimited)".to_string())
        );
        tracing::info!("  share window:  {}s", self.scheduling_window_secs);
        tracing::info!("  jobset shares: {}", self.default_jobset_shares);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_permitted_run_time_secs, 36_000);
        assert_eq!(config.max_machine_cores, 0);
        assert_eq!(config.scheduling_window_secs, 86_400);
        assert_eq!(config.default_jobset_shares, 100);
        assert_eq!(config.machine_core_cap(), None);
        assert_eq!(config.profile_label(), "default");
    }

    #[test]
    fn toml_partial_uses_defaults() {
        let config = SchedulerConfig::from_toml_str("max_machine_cores = 16\n").unwrap();
        assert_eq!(config.machine_core_cap(), Some(16));
        assert_eq!(config.max_permitted_run_time(), Duration::from_secs(36_000));
    }

    #[test]
    fn toml_rejects_zero_shares() {
        let err = SchedulerConfig::from_toml_str("default_jobset_shares = 0\n").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn toml_rejects_garbage() {
        assert!(SchedulerConfig::from_toml_str("max_machine_cores = \"lots\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_permitted_run_time_secs = 3600").unwrap();
        writeln!(file, "scheduling_window_secs = 600").unwrap();

        let config = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_permitted_run_time_secs, 3600);
        assert_eq!(config.scheduling_window(), Duration::from_secs(600));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = SchedulerConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn profiled_env_prefers_prefixed_key() {
        // Unique keys so parallel tests don't collide.
        env::set_var("CFGTEST_FARM_MAX_MACHINE_CORES", "48");
        env::set_var("FARM_SCHEDULING_WINDOW", "1200");

        let config = SchedulerConfig::from_env_profiled("cfgtest").unwrap();
        assert_eq!(config.profile, "CFGTEST");
        assert_eq!(config.max_machine_cores, 48);
        assert_eq!(config.scheduling_window_secs, 1200);

        env::remove_var("CFGTEST_FARM_MAX_MACHINE_CORES");
        env::remove_var("FARM_SCHEDULING_WINDOW");
    }

    #[test]
    fn env_rejects_zero_window() {
        // Prefixed so the unprefixed keys of other tests are untouched.
        env::set_var("ZEROWIN_FARM_SCHEDULING_WINDOW", "0");
        let err = SchedulerConfig::from_env_profiled("zerowin").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        env::remove_var("ZEROWIN_FARM_SCHEDULING_WINDOW");

        env::set_var("ZEROSHARE_FARM_DEFAULT_JOBSET_SHARES", "0");
        assert!(SchedulerConfig::from_env_profiled("zeroshare").is_err());
        env::remove_var("ZEROSHARE_FARM_DEFAULT_JOBSET_SHARES");
    }
}
