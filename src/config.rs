use anyhow::{Context, Result};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{HarnessError, HarnessResult};
use crate::resource::TestMarker;
use crate::waiter::WaitSpec;
use crate::{
    DEFAULT_CREDENTIAL_TIMEOUT_SECS, DEFAULT_DELETE_TIMEOUT_SECS, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_MARKER_PREFIX, DEFAULT_MUTATION_TIMEOUT_SECS, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_PROVISION_TIMEOUT_SECS, DEFAULT_REBOOT_TIMEOUT_SECS,
};

const ENV_PREFIX: &str = "LIFECYCLE_HARNESS";

/// Which lifecycle step a wait belongs to; selects the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    Provision,
    Credential,
    Reboot,
    Mutation,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub provision_timeout_secs: u64,
    pub reboot_timeout_secs: u64,
    pub mutation_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    pub credential_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Overrides `poll_interval_secs` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    pub fetch_timeout_secs: u64,
    /// Overrides `fetch_timeout_secs` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_timeout_ms: Option<u64>,
    pub marker_prefix: String,
    pub run_label: String,
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            provision_timeout_secs: DEFAULT_PROVISION_TIMEOUT_SECS,
            reboot_timeout_secs: DEFAULT_REBOOT_TIMEOUT_SECS,
            mutation_timeout_secs: DEFAULT_MUTATION_TIMEOUT_SECS,
            delete_timeout_secs: DEFAULT_DELETE_TIMEOUT_SECS,
            credential_timeout_secs: DEFAULT_CREDENTIAL_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            poll_interval_ms: None,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            fetch_timeout_ms: None,
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            run_label: Uuid::new_v4().simple().to_string()[..8].to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> HarnessResult<()> {
        let timeouts = [
            ("provision_timeout_secs", self.provision_timeout_secs),
            ("reboot_timeout_secs", self.reboot_timeout_secs),
            ("mutation_timeout_secs", self.mutation_timeout_secs),
            ("delete_timeout_secs", self.delete_timeout_secs),
            ("credential_timeout_secs", self.credential_timeout_secs),
        ];

        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(HarnessError::Config(format!("{name} must be greater than 0")));
            }
            if self.poll_interval() >= Duration::from_secs(secs) {
                return Err(HarnessError::Config(format!(
                    "poll interval {:?} must be shorter than {name} ({secs}s)",
                    self.poll_interval()
                )));
            }
        }

        if self.poll_interval().is_zero() {
            return Err(HarnessError::Config(
                "poll interval must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout().is_zero() {
            return Err(HarnessError::Config(
                "fetch timeout must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout() >= self.poll_interval() {
            return Err(HarnessError::Config(format!(
                "fetch timeout {:?} must be shorter than poll interval {:?}",
                self.fetch_timeout(),
                self.poll_interval()
            )));
        }

        if self.marker_prefix.is_empty() || self.marker_prefix.contains(char::is_whitespace) {
            return Err(HarnessError::Config(format!(
                "marker_prefix `{}` must be non-empty and contain no whitespace",
                self.marker_prefix
            )));
        }

        if self.run_label.is_empty() || self.run_label.contains(char::is_whitespace) {
            return Err(HarnessError::Config(format!(
                "run_label `{}` must be non-empty and contain no whitespace",
                self.run_label
            )));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        match self.fetch_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    pub fn timeout_for(&self, step: WaitStep) -> Duration {
        let secs = match step {
            WaitStep::Provision => self.provision_timeout_secs,
            WaitStep::Credential => self.credential_timeout_secs,
            WaitStep::Reboot => self.reboot_timeout_secs,
            WaitStep::Mutation => self.mutation_timeout_secs,
            WaitStep::Delete => self.delete_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn wait_spec(&self, step: WaitStep) -> HarnessResult<WaitSpec> {
        WaitSpec::new(self.timeout_for(step), self.poll_interval())
    }

    /// Marker scoped to this run.
    pub fn marker(&self) -> TestMarker {
        TestMarker::new(self.marker_prefix.clone(), self.run_label.clone())
    }

    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(ms) = matches.get_one::<String>("poll-interval-ms") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.poll_interval_ms = Some(ms);
            }
        }

        if let Some(ms) = matches.get_one::<String>("fetch-timeout-ms") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.fetch_timeout_ms = Some(ms);
            }
        }

        if let Some(secs) = matches.get_one::<String>("provision-timeout-secs") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.provision_timeout_secs = secs;
            }
        }

        if let Some(prefix) = matches.get_one::<String>("marker-prefix") {
            self.marker_prefix = prefix.clone();
        }

        if let Some(run_label) = matches.get_one::<String>("run-label") {
            self.run_label = run_label.clone();
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.log_level = log_level.clone();
        }
    }
}

/// Load configuration: CLI args > env vars > config file > defaults
pub fn load_config(config_path: Option<&str>, matches: &ArgMatches) -> Result<HarnessConfig> {
    let mut config = load_layers(config_path)?;
    config.apply_cli_overrides(matches);

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    log::info!("Configuration loaded successfully");
    log::debug!("Final config: {config:?}");

    Ok(config)
}

/// Defaults, then the TOML file if present, then `LIFECYCLE_HARNESS_*` env vars.
pub fn load_layers(config_path: Option<&str>) -> Result<HarnessConfig> {
    let defaults = HarnessConfig::default();
    let mut builder = ::config::Config::builder().add_source(
        ::config::Config::try_from(&defaults).context("Failed to build default config layer")?,
    );

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Toml));
            log::info!("Loading configuration from file: {path}");
        } else {
            log::info!("Config file not found: {path}, using defaults");
        }
    }

    builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

    let layered = builder.build().context("Failed to assemble configuration")?;
    let mut config: HarnessConfig = layered
        .try_deserialize()
        .context("Failed to parse configuration")?;

    // An empty label in a file or env var falls back to the generated one
    if config.run_label.is_empty() {
        config.run_label = defaults.run_label;
    }

    Ok(config)
}

/// Create a sample configuration file
pub fn create_sample_config(path: &str) -> Result<()> {
    let config = HarnessConfig::default();
    let toml_content =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {path}"))?;

    println!("Sample configuration written to: {path}");
    Ok(())
}
