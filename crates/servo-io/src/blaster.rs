//! pi-blaster output: daemon detection and the command pipe.

use serde::{Deserialize, Serialize};
use servo_core::{CommandSink, DiscardSink, WriterSink};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pipe the pi-blaster daemon reads commands from.
pub const DEFAULT_PIPE_PATH: &str = "/dev/pi-blaster";

#[derive(Debug, Error)]
pub enum BlasterError {
    #[error("pi-blaster was not found running: start pi-blaster to avoid this error")]
    DaemonNotFound,
    #[error("failed to open {path}: {source}")]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How the output sink is chosen at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub pipe_path: PathBuf,
    /// Never write; positions are still tracked.
    pub discard: bool,
    /// Open the pipe without looking for a running daemon.
    pub skip_daemon_check: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            pipe_path: PathBuf::from(DEFAULT_PIPE_PATH),
            discard: false,
            skip_daemon_check: false,
        }
    }
}

/// Whether a pi-blaster process is running. Needs `/bin/sh` and `pgrep`.
pub fn daemon_running() -> bool {
    Command::new("/bin/sh")
        .args(["-c", "pgrep pi-blaster"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Opens `path` write-only. Blocks on a FIFO until a reader is attached.
pub fn open_pipe(path: impl AsRef<Path>) -> Result<WriterSink<File>, BlasterError> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| BlasterError::PipeOpen {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "Opened command pipe");
    Ok(WriterSink::new(file))
}

/// Opens the configured pipe, checking for the daemon unless told not to.
pub fn try_open_sink(config: &SinkConfig) -> Result<WriterSink<File>, BlasterError> {
    if !config.skip_daemon_check && !daemon_running() {
        return Err(BlasterError::DaemonNotFound);
    }
    open_pipe(&config.pipe_path)
}

/// Picks the sink for this process. Any failure degrades to [`DiscardSink`]
/// with one warning; positions keep being tracked either way.
pub fn open_sink(config: &SinkConfig) -> Box<dyn CommandSink> {
    if config.discard {
        info!("Output disabled, commands will be discarded");
        return Box::new(DiscardSink);
    }
    match try_open_sink(config) {
        Ok(sink) => {
            info!(path = %config.pipe_path.display(), "Writing servo commands");
            Box::new(sink)
        }
        Err(e) => {
            warn!(error = %e, "Servo output disabled, continuing without pi-blaster");
            Box::new(DiscardSink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_blaster_pipe() {
        let config = SinkConfig::default();
        assert_eq!(config.pipe_path, PathBuf::from("/dev/pi-blaster"));
        assert!(!config.discard);
        assert!(!config.skip_daemon_check);
    }

    #[test]
    fn discard_wins_over_everything() {
        let config = SinkConfig {
            discard: true,
            skip_daemon_check: true,
            ..Default::default()
        };
        assert!(!open_sink(&config).enabled());
    }

    #[test]
    fn missing_pipe_reports_path() {
        let config = SinkConfig {
            pipe_path: PathBuf::from("/nonexistent/servo/pipe"),
            skip_daemon_check: true,
            ..Default::default()
        };
        let err = try_open_sink(&config).unwrap_err();
        assert!(matches!(err, BlasterError::PipeOpen { .. }));
        assert!(err.to_string().contains("/nonexistent/servo/pipe"));
        assert!(!open_sink(&config).enabled());
    }
}
