use crate::runtime::config::{Layout, LayoutError, MoveRequest, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use servo_core::{sample_interval, DispatchError, Dispatcher, Servo, ServoError};
use servo_io::metrics::{LAST_POSITION, MOVE_DURATION_MS, SINK_ENABLED};
use servo_io::open_sink;
use std::collections::BTreeMap;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Servo(#[from] ServoError),
}

pub fn run_from_args() -> Result<(), AppError> {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    // Initialize tracing
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());
    for arg in &config.rejected {
        warn!(arg = %arg, "Ignoring unrecognized argument");
    }

    // Initialize metrics
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let layout = config.layout()?;
    let Layout {
        sink,
        dispatch,
        servos: servo_configs,
    } = layout;

    let dispatcher = Dispatcher::start(open_sink(&sink), dispatch.clone())?;
    SINK_ENABLED.set(i64::from(dispatcher.sink_enabled()));
    info!(
        flush_interval_ms = dispatch.flush_interval().as_millis() as u64,
        sink_enabled = dispatcher.sink_enabled(),
        servos = servo_configs.len(),
        "Dispatcher started"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let updater = telemetry::start_metrics_updater(dispatcher.stats_handle(), Arc::clone(&stop));

    let handle = dispatcher.handle();
    let mut servos = BTreeMap::new();
    for servo_config in servo_configs {
        let servo = Servo::connect_with(&handle, servo_config)?;
        info!(servo = %servo, position = servo.position(), "Servo ready");
        servos.insert(servo.channel(), servo);
    }

    run_moves(&servos, &config.moves);

    if let Some(seconds) = config.hold_seconds {
        info!(seconds, "Holding position");
        thread::sleep(Duration::from_secs(seconds));
    }
    // Settled positions must reach the sink before channels go neutral.
    thread::sleep(sample_interval(servos.len()) + dispatch.flush_interval() * 2);

    for servo in servos.values() {
        info!(
            channel = servo.channel(),
            name = servo.name(),
            position = servo.position(),
            output = servo.output(),
            "Final position"
        );
        servo.close();
    }
    drop(servos);
    dispatcher.shutdown();

    stop.store(true, Ordering::Relaxed);
    let _ = updater.join();

    let stats = dispatcher.stats();
    info!(
        flushes = stats.flushes,
        failed_flushes = stats.failed_flushes,
        samples_staged = stats.samples_staged,
        "Run complete"
    );
    Ok(())
}

/// Runs each channel's moves in order; channels move concurrently.
fn run_moves(servos: &BTreeMap<u32, Servo>, moves: &[MoveRequest]) {
    let mut per_channel: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for request in moves {
        per_channel
            .entry(request.channel)
            .or_default()
            .push(request.target);
    }

    thread::scope(|scope| {
        for (channel, targets) in &per_channel {
            let Some(servo) = servos.get(channel) else {
                continue;
            };
            scope.spawn(move || {
                for &target in targets {
                    let start = Instant::now();
                    servo.move_to(target).wait();
                    let elapsed = start.elapsed();
                    MOVE_DURATION_MS.observe(elapsed.as_secs_f64() * 1000.0);
                    LAST_POSITION.set(servo.position());
                    debug!(
                        channel,
                        target,
                        position = servo.position(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Move settled"
                    );
                }
            });
        }
    });
}
