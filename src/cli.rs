//! Command-line flags shared by both binaries, and the rules that combine
//! them with the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::protocol::DEFAULT_PRESENCE_WINDOW;

/// Log file used when file logging is enabled without a name.
pub const DEFAULT_LOG_FILE: &str = "app.log";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "scale-rs",
    version,
    about = "Gourmetmiles Smart Scale BLE Client",
    after_help = "Environment variables (override the flags):\n  \
        DEBUG=true              Enable debug logging\n  \
        LOG_OUTPUT=file|null    Set logging output\n  \
        LOG_FILE=<filename>     Set log filename (when LOG_OUTPUT=file)\n\n\
        Examples:\n  \
        scale-rs --log-file scale.log   Log to scale.log\n  \
        scale-rs --no-logs              No logging\n  \
        scale-rs --debug                Debug mode with file logging"
)]
pub struct Cli {
    /// Log to file (default: app.log)
    #[arg(short = 'f', long = "log-file", value_name = "FILENAME", overrides_with = "no_logs")]
    pub log_file: Option<PathBuf>,

    /// Suppress all logging.  Of `-f` and `-n`, the one given last wins.
    #[arg(short = 'n', long = "no-logs")]
    pub no_logs: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Use the built-in simulated adapter (no hardware needed)
    #[arg(long)]
    pub simulate: bool,

    /// Seconds a device may stay silent before it is dropped from the list
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_PRESENCE_WINDOW.as_secs_f64())]
    pub window: f64,
}

impl Cli {
    pub fn presence_window(&self) -> Duration {
        Duration::try_from_secs_f64(self.window).unwrap_or(DEFAULT_PRESENCE_WINDOW)
    }
}

/// Where log records go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Off,
    File(PathBuf),
}

/// Effective logging configuration after applying the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub output: LogOutput,
    pub debug: bool,
}

impl LogSettings {
    /// Combine `cli` with the environment as seen through `env`.
    ///
    /// * `LOG_OUTPUT`, `LOG_FILE` and `DEBUG=true` override the flags.
    /// * Debug without an explicit `LOG_OUTPUT` turns file logging on.
    /// * Logging is off unless something asks for it; debug is dropped when off.
    pub fn resolve(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut to_file = cli.log_file.is_some() && !cli.no_logs;
        let mut file = cli
            .log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
        let mut debug = cli.debug;

        let env_output = env("LOG_OUTPUT").filter(|v| !v.is_empty());
        if let Some(output) = &env_output {
            to_file = output == "file";
        }
        if let Some(name) = env("LOG_FILE").filter(|v| !v.is_empty()) {
            file = PathBuf::from(name);
        }
        if env("DEBUG").as_deref() == Some("true") {
            debug = true;
        }
        if debug && !to_file && env_output.is_none() {
            to_file = true;
        }

        if to_file {
            LogSettings {
                output: LogOutput::File(file),
                debug,
            }
        } else {
            LogSettings {
                output: LogOutput::Off,
                debug: false,
            }
        }
    }

    /// [`LogSettings::resolve`] against the process environment.
    pub fn from_env(cli: &Cli) -> Self {
        Self::resolve(cli, |key| std::env::var(key).ok())
    }
}
