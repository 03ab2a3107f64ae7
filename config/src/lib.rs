//! TOML configuration for fanout.
//!
//! Raw `serde` structs mirror the file; [`Settings`] is the validated form.
//! Holding a `Settings` means every value passed the [`RunConfig`] bounds.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use fanout_types::{RunConfig, RunConfigError};

/// The config file as written on disk.
#[derive(Debug, Default, Deserialize)]
pub struct FanoutConfig {
    pub run: Option<RunSection>,
    pub store: Option<StoreSection>,
}

/// `[run]`: every key is optional and falls back to the library default.
#[derive(Debug, Default, Deserialize)]
pub struct RunSection {
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
    pub jitter: Option<f64>,
    pub timeout_secs: Option<f64>,
    pub event_buffer: Option<usize>,
}

/// `[store]`
#[derive(Debug, Default, Deserialize)]
pub struct StoreSection {
    /// JSON state file. `${VAR}` references are expanded from the environment.
    pub path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingError {
    #[error("{key} must be a finite, non-negative number of seconds, got {value}")]
    InvalidSeconds { key: &'static str, value: f64 },
    #[error(transparent)]
    Run(#[from] RunConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config at {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: SettingError,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

impl FanoutConfig {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load the default config file. `Ok(None)` when there is no home
    /// directory or no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::parse(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Resolve `[run]` onto the defaults and validate the result.
    pub fn run_config(&self) -> Result<RunConfig, SettingError> {
        let mut config = RunConfig::default();
        let Some(run) = &self.run else {
            return Ok(config);
        };

        if let Some(n) = run.max_concurrency {
            config = config.with_max_concurrency(n);
        }
        if let Some(n) = run.max_retries {
            config = config.with_max_retries(n);
        }
        if run.base_delay_secs.is_some() || run.max_delay_secs.is_some() {
            let base = match run.base_delay_secs {
                Some(secs) => seconds("base_delay_secs", secs)?,
                None => config.base_delay(),
            };
            let max = match run.max_delay_secs {
                Some(secs) => seconds("max_delay_secs", secs)?,
                None => config.max_delay(),
            };
            config = config.with_delays(base, max);
        }
        if let Some(jitter) = run.jitter {
            config = config.with_jitter(jitter);
        }
        if let Some(secs) = run.timeout_secs {
            config = config.with_timeout(Some(seconds("timeout_secs", secs)?));
        }
        if let Some(n) = run.event_buffer {
            config = config.with_event_buffer(n);
        }

        config.validate()?;
        Ok(config)
    }

    /// `[store] path` with environment references expanded. Blank means unset.
    #[must_use]
    pub fn store_path(&self) -> Option<PathBuf> {
        let raw = self.store.as_ref()?.path.as_deref()?;
        let expanded = expand_env_vars(raw);
        if expanded.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(expanded))
        }
    }
}

fn seconds(key: &'static str, value: f64) -> Result<Duration, SettingError> {
    Duration::try_from_secs_f64(value).map_err(|_| SettingError::InvalidSeconds { key, value })
}

/// Validated settings for one invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    run: RunConfig,
    store_path: Option<PathBuf>,
}

impl Settings {
    /// Load from `explicit` if given (it must exist), otherwise from the
    /// default location (missing means defaults).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => {
                let config = FanoutConfig::load_from(path)?;
                Self::from_config(&config, path)
            }
            None => match FanoutConfig::load()? {
                Some(config) => {
                    let path = config_path().unwrap_or_default();
                    Self::from_config(&config, &path)
                }
                None => Ok(Self::default()),
            },
        }
    }

    pub fn from_config(config: &FanoutConfig, path: &Path) -> Result<Self, ConfigError> {
        let run = config
            .run_config()
            .map_err(|source| ConfigError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            run,
            store_path: config.store_path(),
        })
    }

    #[must_use]
    pub fn run(&self) -> &RunConfig {
        &self.run
    }

    #[must_use]
    pub fn into_run(self) -> RunConfig {
        self.run
    }

    /// JSON state file, if one is configured.
    #[must_use]
    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unclosed reference is kept verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".fanout").join("config.toml"))
}
