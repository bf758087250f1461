//! `env_logger` setup for the binaries.
//!
//! Records are written to a file, never to the terminal, so they cannot
//! tear the TUI.  `RUST_LOG` still wins over the default filter, e.g.
//! `RUST_LOG=scale_rs=trace scale-rs -f trace.log`.

use std::fs::File;
use std::io;

use crate::cli::{LogOutput, LogSettings};

fn builder(settings: &LogSettings) -> env_logger::Builder {
    let default = if settings.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
}

/// Install the global logger described by `settings`.
///
/// With [`LogOutput::Off`] no logger is installed and every record is
/// discarded by the `log` facade.  Fails only if the log file cannot be
/// created.
pub fn init(settings: &LogSettings) -> io::Result<()> {
    match &settings.output {
        LogOutput::Off => Ok(()),
        LogOutput::File(path) => {
            let file = File::create(path)?;
            // A logger may already be installed (e.g. in tests).
            let _ = builder(settings)
                .target(env_logger::Target::Pipe(Box::new(file)))
                .try_init();
            Ok(())
        }
    }
}
