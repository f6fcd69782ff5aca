use serde::{Deserialize, Serialize};
use servo_core::{DispatchConfig, ServoConfig};
use servo_io::SinkConfig;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("failed to read layout {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid layout {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Servo fleet description, usually loaded from `--layout <PATH>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub sink: SinkConfig,
    pub dispatch: DispatchConfig,
    pub servos: Vec<ServoConfig>,
}

impl Layout {
    pub fn load(path: &Path) -> Result<Self, LayoutError> {
        let text = fs::read_to_string(path).map_err(|source| LayoutError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| LayoutError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the servo config for `channel`, adding a default one if absent.
    pub fn servo_mut(&mut self, channel: u32) -> &mut ServoConfig {
        let index = match self.servos.iter().position(|s| s.channel == channel) {
            Some(index) => index,
            None => {
                self.servos.push(ServoConfig::new(channel));
                self.servos.len() - 1
            }
        };
        &mut self.servos[index]
    }
}

/// One `--move CH=VAL` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRequest {
    pub channel: u32,
    pub target: f64,
}

impl MoveRequest {
    pub fn parse(text: &str) -> Option<Self> {
        let (channel, target) = text.split_once('=')?;
        Some(Self {
            channel: channel.trim().parse().ok()?,
            target: target.trim().parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub layout_path: Option<PathBuf>,
    pub pipe_path: Option<PathBuf>,
    pub no_blaster: bool,
    pub skip_daemon_check: bool,
    pub flush_ms: Option<u64>,
    pub servos: Vec<u32>,
    pub moves: Vec<MoveRequest>,
    pub speed: Option<f64>,
    pub centered: bool,
    pub normalized: bool,
    pub hold_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    /// Arguments that could not be parsed, reported once logging is up.
    pub rejected: Vec<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--layout" => {
                    if i + 1 < args.len() {
                        cfg.layout_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--pipe" => {
                    if i + 1 < args.len() {
                        cfg.pipe_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--no-blaster" => {
                    cfg.no_blaster = true;
                }
                "--skip-daemon-check" => {
                    cfg.skip_daemon_check = true;
                }
                "--flush-ms" => {
                    if i + 1 < args.len() {
                        match args[i + 1].parse::<u64>() {
                            Ok(ms) => cfg.flush_ms = Some(ms),
                            Err(_) => cfg.rejected.push(format!("--flush-ms {}", args[i + 1])),
                        }
                        i += 1;
                    }
                }
                "--servo" => {
                    if i + 1 < args.len() {
                        match args[i + 1].parse::<u32>() {
                            Ok(channel) => cfg.servos.push(channel),
                            Err(_) => cfg.rejected.push(format!("--servo {}", args[i + 1])),
                        }
                        i += 1;
                    }
                }
                "--move" => {
                    if i + 1 < args.len() {
                        match MoveRequest::parse(&args[i + 1]) {
                            Some(request) => cfg.moves.push(request),
                            None => cfg.rejected.push(format!("--move {}", args[i + 1])),
                        }
                        i += 1;
                    }
                }
                "--speed" => {
                    if i + 1 < args.len() {
                        match args[i + 1].parse::<f64>() {
                            Ok(speed) => cfg.speed = Some(speed),
                            Err(_) => cfg.rejected.push(format!("--speed {}", args[i + 1])),
                        }
                        i += 1;
                    }
                }
                "--centered" => {
                    cfg.centered = true;
                }
                "--normalized" => {
                    cfg.normalized = true;
                }
                "--hold-seconds" => {
                    if i + 1 < args.len() {
                        cfg.hold_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => cfg.rejected.push(other.to_string()),
            }
            i += 1;
        }
        cfg
    }

    /// Loads the layout file (if any) and applies command-line overrides.
    pub fn layout(&self) -> Result<Layout, LayoutError> {
        let mut layout = match &self.layout_path {
            Some(path) => Layout::load(path)?,
            None => Layout::default(),
        };

        if let Some(path) = &self.pipe_path {
            layout.sink.pipe_path = path.clone();
        }
        layout.sink.discard |= self.no_blaster;
        layout.sink.skip_daemon_check |= self.skip_daemon_check;
        if let Some(ms) = self.flush_ms {
            layout.dispatch.flush_interval_ms = ms;
        }

        let channels = self
            .servos
            .iter()
            .copied()
            .chain(self.moves.iter().map(|m| m.channel));
        for channel in channels {
            layout.servo_mut(channel);
        }
        for servo in &mut layout.servos {
            if let Some(speed) = self.speed {
                servo.speed = speed;
            }
            servo.centered |= self.centered;
            servo.normalized |= self.normalized;
        }
        Ok(layout)
    }

    pub fn print_help() {
        println!(
            r#"servo-ctl - Drive hobby servos through the pi-blaster daemon

USAGE:
    servo-ctl [OPTIONS]

OPTIONS:
    --layout <PATH>         JSON file with sink, dispatch and servo settings
    --pipe <PATH>           Command pipe to write to [default: /dev/pi-blaster]
    --no-blaster            Discard output; positions are still tracked
    --skip-daemon-check     Open the pipe without checking for a running pi-blaster
    --flush-ms <MS>         Interval between batched writes [default: 40]
    --servo <CH>            Connect a servo on channel CH (repeatable)
    --move <CH=VAL>         Move channel CH to VAL and wait (repeatable, runs in order per channel)
    --speed <FRAC>          Speed for every servo as a fraction of max speed [default: 1.0]
    --centered              Positions are relative to the center (-90..90)
    --normalized            Positions are scaled to 0..2 (or -1..1 with --centered)
    --hold-seconds <SECS>   Keep servos connected for a while after moving
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write JSON logs to a daily file in PATH
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,servo_core=trace)

EXAMPLES:
    # Center the servo on channel 14
    servo-ctl --move 14=90

    # Sweep without hardware
    servo-ctl --no-blaster --move 5=180 --move 5=0

    # Fleet from a layout file with metrics
    servo-ctl --layout servos.json --metrics-addr 0.0.0.0:9090 --hold-seconds 30
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("servo-ctl")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_moves_in_order() {
        let cfg = RuntimeConfig::from_args(&args(&["--move", "3=90", "--move", "3=0.5", "--move", "7=-20"]));
        assert_eq!(
            cfg.moves,
            vec![
                MoveRequest { channel: 3, target: 90.0 },
                MoveRequest { channel: 3, target: 0.5 },
                MoveRequest { channel: 7, target: -20.0 },
            ]
        );
        assert!(cfg.rejected.is_empty());
    }

    #[test]
    fn bad_values_are_rejected_not_fatal() {
        let cfg = RuntimeConfig::from_args(&args(&["--move", "x=1", "--flush-ms", "fast", "--bogus"]));
        assert!(cfg.moves.is_empty());
        assert_eq!(cfg.flush_ms, None);
        assert_eq!(cfg.rejected, vec!["--move x=1", "--flush-ms fast", "--bogus"]);
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--bogus"]));
        assert!(cfg.show_help);
        assert!(cfg.rejected.is_empty());
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--pipe",
            "/tmp/blaster",
            "--no-blaster",
            "--flush-ms",
            "10",
            "--servo",
            "2",
            "--move",
            "4=45",
            "--speed",
            "0.5",
            "--centered",
        ]));
        let layout = cfg.layout().unwrap();
        assert_eq!(layout.sink.pipe_path, PathBuf::from("/tmp/blaster"));
        assert!(layout.sink.discard);
        assert_eq!(layout.dispatch.flush_interval_ms, 10);
        let channels: Vec<u32> = layout.servos.iter().map(|s| s.channel).collect();
        assert_eq!(channels, vec![2, 4]);
        assert!(layout.servos.iter().all(|s| s.speed == 0.5 && s.centered));
    }

    #[test]
    fn layout_file_is_merged_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        fs::write(
            &path,
            r#"{
                "dispatch": { "flush_interval_ms": 25 },
                "servos": [
                    { "channel": 4, "name": "Pan", "min_output": 0.1, "max_output": 0.2 },
                    { "channel": 5, "initial_position": 90.0 }
                ]
            }"#,
        )
        .unwrap();

        let cfg = RuntimeConfig::from_args(&args(&["--layout", path.to_str().unwrap(), "--move", "4=10"]));
        let layout = cfg.layout().unwrap();
        assert_eq!(layout.dispatch.flush_interval_ms, 25);
        assert_eq!(layout.dispatch.max_retry_backoff_ms, 1_000);
        assert_eq!(layout.servos.len(), 2);
        assert_eq!(layout.servos[0].name.as_deref(), Some("Pan"));
        assert_eq!(layout.servos[0].calibration.min_output, 0.1);
        assert_eq!(layout.servos[1].initial_position, Some(90.0));
    }

    #[test]
    fn unreadable_layout_names_the_file() {
        let cfg = RuntimeConfig::from_args(&args(&["--layout", "/nonexistent/layout.json"]));
        let err = cfg.layout().unwrap_err();
        assert!(matches!(err, LayoutError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/layout.json"));
    }
}
