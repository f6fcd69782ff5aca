use servo_core::{DispatchStats, StatsSnapshot};
use servo_io::metrics::{
    init_metrics, serve_metrics, FAILED_FLUSHES, FLUSHES, REGISTERED, SAMPLES_STAGED,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Copies dispatcher counters into Prometheus, tracking what was already published.
#[derive(Debug, Default)]
pub struct StatsPublisher {
    last: StatsSnapshot,
}

impl StatsPublisher {
    pub fn publish(&mut self, snapshot: StatsSnapshot) {
        FLUSHES.inc_by(snapshot.flushes.saturating_sub(self.last.flushes));
        FAILED_FLUSHES.inc_by(
            snapshot
                .failed_flushes
                .saturating_sub(self.last.failed_flushes),
        );
        SAMPLES_STAGED.inc_by(
            snapshot
                .samples_staged
                .saturating_sub(self.last.samples_staged),
        );
        REGISTERED.set(snapshot.registered as i64);
        self.last = snapshot;
    }
}

pub fn start_metrics_updater(
    stats: Arc<DispatchStats>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut publisher = StatsPublisher::default();
        while !stop.load(Ordering::Relaxed) {
            publisher.publish(stats.snapshot());
            thread::sleep(UPDATE_PERIOD);
        }
        publisher.publish(stats.snapshot());
    })
}
