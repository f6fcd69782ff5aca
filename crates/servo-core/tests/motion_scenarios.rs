use servo_core::{
    DiscardSink, DispatchConfig, Dispatcher, Flags, MemorySink, Servo, ServoConfig, MAX_SPEED,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TOLERANCE: Duration = Duration::from_millis(50);

fn discard_dispatcher() -> Dispatcher {
    Dispatcher::start(Box::new(DiscardSink), DispatchConfig::default()).unwrap()
}

fn memory_dispatcher(flush_interval_ms: u64) -> (Dispatcher, MemorySink) {
    let sink = MemorySink::new();
    let config = DispatchConfig {
        flush_interval_ms,
        ..Default::default()
    };
    let dispatcher = Dispatcher::start(Box::new(sink.clone()), config).unwrap();
    (dispatcher, sink)
}

fn full_sweep() -> Duration {
    Duration::from_secs_f64(180.0 / MAX_SPEED)
}

fn channels(line: &str) -> Vec<String> {
    line.split_whitespace()
        .map(|token| token.split('=').next().unwrap().to_string())
        .collect()
}

#[test]
fn moves_to_center_and_settles() {
    let dispatcher = discard_dispatcher();
    assert!(!dispatcher.sink_enabled());
    let servo = Servo::connect(&dispatcher.handle(), 14).unwrap();
    servo.move_to(90.0).wait();
    assert_eq!(servo.position(), 90.0);
    assert!(servo.is_settled());
}

#[test]
fn two_servos_move_independently() {
    let (dispatcher, sink) = memory_dispatcher(10);
    let left = Arc::new(Servo::connect(&dispatcher.handle(), 3).unwrap());
    let right = Arc::new(Servo::connect(&dispatcher.handle(), 4).unwrap());

    let movers: Vec<_> = [(Arc::clone(&left), 45.0), (Arc::clone(&right), 135.0)]
        .into_iter()
        .map(|(servo, target)| thread::spawn(move || servo.move_to(target).wait()))
        .collect();
    for mover in movers {
        mover.join().unwrap();
    }

    assert!((left.position() - 45.0).abs() < 1e-9);
    assert!((right.position() - 135.0).abs() < 1e-9);

    drop(left);
    drop(right);
    dispatcher.shutdown();

    let lines = sink.lines();
    assert!(!lines.is_empty());
    for line in &lines {
        assert!(line.ends_with('\n'));
        let seen = channels(line);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len(), "duplicate channel in {line:?}");
    }
}

#[test]
fn retarget_in_flight_ends_at_latest_target() {
    let dispatcher = discard_dispatcher();
    let servo = Arc::new(Servo::connect(&dispatcher.handle(), 5).unwrap());
    servo.move_to(180.0);

    let waiter = {
        let servo = Arc::clone(&servo);
        thread::spawn(move || {
            servo.wait();
            servo.position()
        })
    };

    thread::sleep(Duration::from_millis(200));
    let mid = servo.position();
    assert!(mid > 0.0 && mid < 180.0, "expected mid-flight, got {mid}");
    servo.move_to(0.0);
    servo.wait();

    assert_eq!(servo.position(), 0.0);
    assert_eq!(waiter.join().unwrap(), 0.0);
}

#[test]
fn full_sweep_takes_expected_time() {
    let dispatcher = discard_dispatcher();
    let servo = Arc::new(Servo::connect(&dispatcher.handle(), 99).unwrap());

    let start = Instant::now();
    servo.move_to(180.0);
    let second_waiter = {
        let servo = Arc::clone(&servo);
        thread::spawn(move || servo.wait())
    };
    servo.wait();
    let elapsed = start.elapsed();
    second_waiter.join().unwrap();

    let expected = full_sweep();
    assert!(
        elapsed + TOLERANCE >= expected && elapsed <= expected + TOLERANCE,
        "sweep took {elapsed:?}, expected {expected:?} +/- {TOLERANCE:?}"
    );
    assert_eq!(servo.position(), 180.0);
}

#[test]
fn sweep_timing_holds_with_a_hundred_servos() {
    const COUNT: u32 = 100;
    let (dispatcher, _sink) = memory_dispatcher(40);
    let handle = dispatcher.handle();
    let servos: Vec<Arc<Servo>> = (0..COUNT)
        .map(|channel| Arc::new(Servo::connect(&handle, channel).unwrap()))
        .collect();
    assert_eq!(dispatcher.stats().registered, COUNT as usize);

    let expected = full_sweep();
    let workers: Vec<_> = servos
        .iter()
        .cloned()
        .map(|servo| {
            thread::spawn(move || {
                let mut misses = Vec::new();
                for target in [180.0, 0.0, 180.0] {
                    let start = Instant::now();
                    servo.move_to(target).wait();
                    let elapsed = start.elapsed();
                    if elapsed + TOLERANCE < expected || elapsed > expected + TOLERANCE {
                        misses.push(elapsed);
                    }
                }
                (servo.channel(), misses)
            })
        })
        .collect();

    for worker in workers {
        let (channel, misses) = worker.join().unwrap();
        assert!(
            misses.is_empty(),
            "servo {channel} missed {expected:?} +/- {TOLERANCE:?}: {misses:?}"
        );
    }
    for servo in &servos {
        assert_eq!(servo.position(), 180.0);
    }
    assert!(dispatcher.stats().flushes > 0);
}

#[test]
fn any_request_settles_on_flag_adjusted_clamp() {
    let dispatcher = discard_dispatcher();
    let handle = dispatcher.handle();
    let requests = [-1000.0, -200.0, -0.5, 0.0, 0.75, 45.5, 180.0, 200.0, 1000.0];
    let all_flags = [
        Flags::NONE,
        Flags::CENTERED,
        Flags::NORMALIZED,
        Flags::CENTERED | Flags::NORMALIZED,
    ];

    let mut channel = 0;
    let mut movers = Vec::new();
    for flags in all_flags {
        for request in requests {
            let servo = Servo::connect(&handle, channel).unwrap();
            channel += 1;
            servo.set_flags(flags);
            movers.push(thread::spawn(move || {
                servo.move_to(request).wait();
                let expected = flags.apply(flags.invert(request).clamp(0.0, 180.0));
                (flags, request, servo.position(), expected)
            }));
        }
    }

    for mover in movers {
        let (flags, request, got, expected) = mover.join().unwrap();
        assert!(
            (got - expected).abs() < 1e-9,
            "{flags} move_to({request}) settled at {got}, expected {expected}"
        );
    }
}

#[test]
fn closing_stages_neutral_exactly_once() {
    let (dispatcher, sink) = memory_dispatcher(5);
    let servo = Servo::connect(&dispatcher.handle(), 21).unwrap();
    servo.move_to(20.0).wait();
    servo.close();
    drop(servo);
    dispatcher.shutdown();

    let lines = sink.lines();
    let neutral = lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .filter(|token| *token == "21=0.000000")
        .count();
    assert_eq!(neutral, 1, "lines: {lines:?}");
    assert_eq!(lines.last().map(String::as_str), Some("*=0.000000\n"));
    assert_eq!(dispatcher.stats().registered, 0);
}

#[test]
fn flush_rate_can_change_while_running() {
    let (dispatcher, sink) = memory_dispatcher(5_000);
    let servo = Servo::connect(&dispatcher.handle(), 8).unwrap();
    servo.move_to(180.0);
    thread::sleep(Duration::from_millis(150));
    assert!(sink.is_empty());

    dispatcher.set_flush_rate(Duration::from_millis(10)).unwrap();
    thread::sleep(Duration::from_millis(150));
    assert!(!sink.is_empty());
    servo.wait();
    assert_eq!(dispatcher.stats().registered, 1);
}

#[test]
fn initial_position_and_calibration_come_from_config() {
    let (dispatcher, sink) = memory_dispatcher(5);
    let mut config = ServoConfig::new(30);
    config.initial_position = Some(90.0);
    config.calibration.min_output = 0.1;
    config.calibration.max_output = 0.2;
    config.speed = 0.5;
    let servo = Servo::connect_with(&dispatcher.handle(), config).unwrap();
    assert_eq!(servo.position(), 90.0);
    assert!((servo.output() - 0.15).abs() < 1e-12);

    thread::sleep(Duration::from_millis(50));
    assert!(sink.lines().iter().any(|line| line.contains("30=0.150000")));

    let start = Instant::now();
    servo.move_to(180.0).wait();
    let half_speed = Duration::from_secs_f64(90.0 / (MAX_SPEED * 0.5));
    let elapsed = start.elapsed();
    assert!(elapsed + TOLERANCE >= half_speed && elapsed <= half_speed + TOLERANCE);
}
