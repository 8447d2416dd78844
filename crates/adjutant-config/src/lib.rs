//! Configuration for adjutant components.
//!
//! Settings load from `.adjutant.toml` next to the vault, then environment
//! variables override the file, then CLI flags override both (the CLI layer
//! applies its own flags; this crate handles file + env).
//!
//! Credentials never pass through here and are never written into the
//! vault; adapters read their own transport-specific variables.
//!
//! # Example
//!
//! ```
//! use adjutant_config::Config;
//!
//! let config = Config::default();
//! assert_eq!(config.policy.approval_threshold, 100.0);
//! assert!(config.limits.channels.contains_key("email"));
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use adjutant_retry::{BackoffConfig, BreakerConfig, BucketConfig};
use adjutant_types::Peer;

/// Default configuration file name, looked up next to the vault root.
pub const CONFIG_FILE: &str = ".adjutant.toml";

/// Environment variables honored by every component.
pub const ENV_VAULT_PATH: &str = "VAULT_PATH";
pub const ENV_AGENT_MODE: &str = "AGENT_MODE";
pub const ENV_DRY_RUN: &str = "DRY_RUN";
pub const ENV_GIT_BRANCH: &str = "GIT_VAULT_BRANCH";

/// Config file path for a directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete adjutant configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub watch: WatchSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultSection {
    /// Vault root. Usually supplied by `--vault` or `VAULT_PATH` instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Run without external side-effects.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Which peer this process is (`local` or `cloud`).
    #[serde(default)]
    pub mode: Peer,
    /// Claims older than this are swept back to `Needs_Action/` by the
    /// opposite peer.
    #[serde(default = "default_claim_ttl")]
    #[serde(with = "humantime_serde")]
    pub claim_ttl: Duration,
}

fn default_claim_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            mode: Peer::Local,
            claim_ttl: default_claim_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    /// Amounts above this require an explicit approval note.
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,
    /// Deadline for one adapter call.
    #[serde(default = "default_adapter_deadline")]
    #[serde(with = "humantime_serde")]
    pub adapter_deadline: Duration,
    /// Grace window for in-flight calls on shutdown.
    #[serde(default = "default_shutdown_grace")]
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// How long a deferred file is left alone before the next attempt.
    #[serde(default = "default_defer_cooldown")]
    #[serde(with = "humantime_serde")]
    pub defer_cooldown: Duration,
    /// Concurrent dispatches per adapter.
    #[serde(default = "default_workers_per_adapter")]
    pub workers_per_adapter: usize,
}

fn default_approval_threshold() -> f64 {
    100.0
}

fn default_adapter_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_defer_cooldown() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_workers_per_adapter() -> usize {
    2
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
            adapter_deadline: default_adapter_deadline(),
            shutdown_grace: default_shutdown_grace(),
            defer_cooldown: default_defer_cooldown(),
            workers_per_adapter: default_workers_per_adapter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Rate-limit channels by name. Adapters look their channel up here
    /// before any side-effect.
    #[serde(default = "default_channels")]
    pub channels: BTreeMap<String, BucketConfig>,
}

fn default_channels() -> BTreeMap<String, BucketConfig> {
    let hour = Duration::from_secs(3600);
    let day = Duration::from_secs(24 * 3600);
    BTreeMap::from([
        ("email".to_string(), BucketConfig::per_interval(10, hour)),
        ("social_post".to_string(), BucketConfig::per_interval(3, hour)),
        ("payment".to_string(), BucketConfig::per_interval(3, day)),
    ])
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Backoff applied around adapter and source calls.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Breaker applied per named resource (adapter or source).
    #[serde(default)]
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSection {
    /// Polling fallback interval for directory watches.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Cadence for network sources (mailbox, social inboxes).
    #[serde(default = "default_source_interval")]
    #[serde(with = "humantime_serde")]
    pub source_interval: Duration,
    /// Sidecar directory for seen-sets; defaults to the platform state
    /// dir so the vault itself stays free of watcher bookkeeping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_dir: Option<PathBuf>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_source_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            source_interval: default_source_interval(),
            sidecar_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Remote name the vault repository pushes to.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Branch shared by the peers; `GIT_VAULT_BRANCH` overrides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Cycle cadence in peered mode.
    #[serde(default = "default_sync_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: None,
            interval: default_sync_interval(),
        }
    }
}

impl Config {
    /// Load from `dir/.adjutant.toml`; a missing file yields defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = config_path(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Load from file, then apply environment overrides.
    pub fn load_with_env(dir: &Path) -> Result<Self> {
        let mut config = Self::load(dir)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `VAULT_PATH`, `AGENT_MODE`, `DRY_RUN`, and `GIT_VAULT_BRANCH`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = env::var(ENV_VAULT_PATH) {
            if !path.is_empty() {
                self.vault.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(mode) = env::var(ENV_AGENT_MODE) {
            self.agent.mode = mode
                .parse::<Peer>()
                .map_err(|e| anyhow::anyhow!("{ENV_AGENT_MODE}: {e}"))?;
        }
        if let Ok(dry) = env::var(ENV_DRY_RUN) {
            self.vault.dry_run = matches!(dry.as_str(), "1" | "true" | "yes");
        }
        if let Ok(branch) = env::var(ENV_GIT_BRANCH) {
            if !branch.is_empty() {
                self.sync.branch = Some(branch);
            }
        }
        Ok(())
    }

    /// The vault root, if any layer supplied one.
    pub fn vault_path(&self) -> Option<&Path> {
        self.vault.path.as_deref()
    }

    /// Serialize back to TOML (used by `adjutant init` to write a
    /// starter file).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_handbook() {
        let config = Config::default();
        assert_eq!(config.policy.approval_threshold, 100.0);
        assert_eq!(config.policy.workers_per_adapter, 2);
        assert_eq!(config.policy.adapter_deadline, Duration::from_secs(30));
        assert_eq!(config.agent.mode, Peer::Local);

        let email = &config.limits.channels["email"];
        assert_eq!((email.capacity, email.refill), (10, 10));
        assert_eq!(email.interval, Duration::from_secs(3600));
        let payment = &config.limits.channels["payment"];
        assert_eq!(payment.capacity, 3);
        assert_eq!(payment.interval, Duration::from_secs(86400));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let td = tempdir().expect("tempdir");
        let config = Config::load(td.path()).expect("load");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let td = tempdir().expect("tempdir");
        std::fs::write(
            config_path(td.path()),
            r#"
[agent]
mode = "cloud"
claim_ttl = "1h"

[policy]
approval_threshold = 250.0

[limits.channels.email]
capacity = 5
refill = 5
interval = "1h"
"#,
        )
        .expect("write");

        let config = Config::load(td.path()).expect("load");
        assert_eq!(config.agent.mode, Peer::Cloud);
        assert_eq!(config.agent.claim_ttl, Duration::from_secs(3600));
        assert_eq!(config.policy.approval_threshold, 250.0);
        assert_eq!(config.limits.channels["email"].capacity, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.policy.workers_per_adapter, 2);
    }

    #[test]
    fn env_overrides_file() {
        let td = tempdir().expect("tempdir");
        std::fs::write(config_path(td.path()), "[agent]\nmode = \"local\"\n").expect("write");

        temp_env::with_vars(
            [
                (ENV_AGENT_MODE, Some("cloud")),
                (ENV_DRY_RUN, Some("1")),
                (ENV_VAULT_PATH, Some("/tmp/vault")),
                (ENV_GIT_BRANCH, Some("agents")),
            ],
            || {
                let config = Config::load_with_env(td.path()).expect("load");
                assert_eq!(config.agent.mode, Peer::Cloud);
                assert!(config.vault.dry_run);
                assert_eq!(config.vault_path(), Some(Path::new("/tmp/vault")));
                assert_eq!(config.sync.branch.as_deref(), Some("agents"));
            },
        );
    }

    #[test]
    fn bad_agent_mode_is_a_config_error() {
        temp_env::with_var(ENV_AGENT_MODE, Some("hybrid"), || {
            let mut config = Config::default();
            assert!(config.apply_env().is_err());
        });
    }

    #[test]
    fn to_toml_round_trips() {
        let config = Config::default();
        let text = config.to_toml().expect("toml");
        let parsed: Config = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }
}
