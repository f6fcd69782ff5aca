use servo_core::{CommandSink, DispatchConfig, Dispatcher, Servo};
use servo_io::{open_pipe, open_sink, SinkConfig};
use std::fs;
use std::thread;
use std::time::Duration;

#[test]
fn pipe_sink_receives_whole_lines() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut sink = open_pipe(file.path()).unwrap();
    assert!(sink.enabled());
    sink.write_line("1=0.050000 2=0.250000\n").unwrap();
    sink.write_line("*=0.000000\n").unwrap();

    let written = fs::read_to_string(file.path()).unwrap();
    assert_eq!(written, "1=0.050000 2=0.250000\n*=0.000000\n");
}

#[test]
fn dispatcher_output_lands_in_configured_pipe() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let config = SinkConfig {
        pipe_path: file.path().to_path_buf(),
        skip_daemon_check: true,
        ..Default::default()
    };
    let sink = open_sink(&config);
    assert!(sink.enabled());

    let dispatcher = Dispatcher::start(
        sink,
        DispatchConfig {
            flush_interval_ms: 5,
            ..Default::default()
        },
    )
    .unwrap();
    {
        let servo = Servo::connect(&dispatcher.handle(), 12).unwrap();
        servo.move_to(180.0).wait();
        thread::sleep(Duration::from_millis(50));
    }
    dispatcher.shutdown();

    let written = fs::read_to_string(file.path()).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert!(lines.iter().any(|line| line.contains("12=0.250000")));
    assert!(lines.iter().any(|line| line.contains("12=0.000000")));
    assert_eq!(lines.last(), Some(&"*=0.000000"));
}

#[test]
fn layout_json_fills_defaults() {
    let config: SinkConfig = serde_json::from_str(r#"{"skip_daemon_check": true}"#).unwrap();
    assert!(config.skip_daemon_check);
    assert_eq!(config.pipe_path.to_str(), Some("/dev/pi-blaster"));
}
