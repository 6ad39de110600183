// src/config.rs

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

use crate::{
    context::{validate_context_name, ContextDefinition},
    error::{Result, SupervisorError},
    logger::LogLevel,
};

/// Settings shared by the CLI, the master and its workers.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct Settings {
    /// Workers forked per context unless the context overrides it.
    pub workers: usize,

    /// Debug mode: worker exits are never treated as crashes.
    pub debug: bool,

    pub log_level: String,

    /// Seconds a worker gets to exit after a shutdown broadcast before it is
    /// killed. Zero waits forever.
    pub shutdown_timeout_secs: u64,

    /// Directory holding one `<context>.pid` file per context.
    pub run_dir: PathBuf,

    /// Directory holding one `<context>.log` file per context.
    pub log_dir: PathBuf,

    /// Directory scanned for `<context>.toml` definitions.
    pub contexts_dir: PathBuf,

    /// Worker executable. Defaults to the running executable.
    #[serde(default)]
    pub worker_entry: Option<PathBuf>,

    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,

    /// Arguments placed before `--context` when the default master entry is used.
    #[serde(default = "default_master_args")]
    pub master_args: Vec<String>,

    /// Crashes tolerated inside `restart_window_secs` before crashed workers
    /// stop being replaced. Zero disables the guard.
    pub restart_limit: usize,

    pub restart_window_secs: u64,

    /// Contexts defined inline; they take precedence over discovered files.
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextDefinition>,
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_master_args() -> Vec<String> {
    vec!["master".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 2,
            debug: false,
            log_level: "info".to_string(),
            shutdown_timeout_secs: 10,
            run_dir: PathBuf::from("/tmp/artisan/run"),
            log_dir: PathBuf::from("/tmp/artisan/log"),
            contexts_dir: PathBuf::from("contexts"),
            worker_entry: None,
            worker_args: default_worker_args(),
            master_args: default_master_args(),
            restart_limit: 10,
            restart_window_secs: 60,
            contexts: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Loads the settings from defaults, then `Settings.toml` (or `path`),
    /// then `ARTISAN__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a source cannot be read or parsed, or if
    /// the result fails [`Settings::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();

        let builder = Config::builder()
            .set_default("workers", defaults.workers as i64)?
            .set_default("debug", defaults.debug)?
            .set_default("log_level", defaults.log_level.as_str())?
            .set_default("shutdown_timeout_secs", defaults.shutdown_timeout_secs as i64)?
            .set_default("run_dir", "/tmp/artisan/run")?
            .set_default("log_dir", "/tmp/artisan/log")?
            .set_default("contexts_dir", "contexts")?
            .set_default("restart_limit", defaults.restart_limit as i64)?
            .set_default("restart_window_secs", defaults.restart_window_secs as i64)?;

        let builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("Settings").required(false)),
        };

        // E.g. `ARTISAN__WORKERS=4` overrides `workers`.
        let builder = builder.add_source(Environment::with_prefix("ARTISAN").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SupervisorError::Config("workers must be greater than 0".into()));
        }
        if self.log_level.parse::<LogLevel>().is_err() {
            return Err(SupervisorError::Config(format!(
                "log_level {:?} is not one of error, warn, info, debug, trace",
                self.log_level
            )));
        }
        for (name, definition) in &self.contexts {
            validate_context_name(name)?;
            if definition.workers == Some(0) {
                return Err(SupervisorError::Config(format!(
                    "context {} must run at least one worker",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn log_level(&self, debug: bool) -> LogLevel {
        let configured = self.log_level.parse().unwrap_or(LogLevel::Info);
        if debug || self.debug {
            configured.max(LogLevel::Debug)
        } else {
            configured
        }
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        match self.shutdown_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.worker_entry {
            Some(entry) => Ok(entry.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}
