//! Single serialization point between servos and the output sink.
//!
//! Servos never touch the sink. A dedicated loop thread owns the registry and the
//! pending batch, samples moving servos on an adaptive ticker and flushes the
//! batch as one line on an independent ticker.

use crate::calibration::NEUTRAL_OUTPUT;
use crate::error::DispatchError;
use crate::rate::sample_interval;
use crate::sink::{all_off_line, format_batch, CommandSink};
use crossbeam::channel::{bounded, select, tick, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);
/// Upper bound for the flush cadence and the retry backoff.
const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Anything the dispatcher can sample for a channel value.
pub trait OutputSource: Send + Sync {
    fn channel(&self) -> u32;

    /// Current output if it must be staged: while moving, or once after any change.
    fn sample(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub flush_interval_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 40,
            max_retry_backoff_ms: 1_000,
        }
    }
}

impl DispatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms).clamp(MIN_FLUSH_INTERVAL, MAX_FLUSH_INTERVAL)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms).clamp(self.flush_interval(), MAX_FLUSH_INTERVAL)
    }
}

/// Counters shared between the loop and observers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    samples_staged: AtomicU64,
    registered: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub samples_staged: u64,
    pub registered: usize,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            samples_staged: self.samples_staged.load(Ordering::Relaxed),
            registered: self.registered.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Subscribe {
        source: Arc<dyn OutputSource>,
        ack: Sender<()>,
    },
    Unsubscribe {
        source: Arc<dyn OutputSource>,
        ack: Sender<()>,
    },
    SetFlushRate(Duration),
    Shutdown,
}

/// Cloneable sender side handed to every servo.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: Sender<Command>,
}

impl DispatcherHandle {
    /// Registers `source`; returns once the loop has applied it.
    pub fn subscribe(&self, source: Arc<dyn OutputSource>) -> Result<(), DispatchError> {
        let (ack, done) = bounded(1);
        self.send(Command::Subscribe { source, ack })?;
        done.recv().map_err(|_| DispatchError::ShutDown)
    }

    /// Deregisters `source` and stages a neutral value for its channel.
    pub fn unsubscribe(&self, source: Arc<dyn OutputSource>) -> Result<(), DispatchError> {
        let (ack, done) = bounded(1);
        self.send(Command::Unsubscribe { source, ack })?;
        done.recv().map_err(|_| DispatchError::ShutDown)
    }

    pub fn set_flush_rate(&self, interval: Duration) -> Result<(), DispatchError> {
        self.send(Command::SetFlushRate(interval))
    }

    fn send(&self, command: Command) -> Result<(), DispatchError> {
        self.commands
            .send(command)
            .map_err(|_| DispatchError::ShutDown)
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("queued", &self.commands.len())
            .finish()
    }
}

/// Owner of the dispatcher loop. Dropping it shuts the loop down.
pub struct Dispatcher {
    handle: DispatcherHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
    sink_enabled: bool,
}

impl Dispatcher {
    pub fn start(sink: Box<dyn CommandSink>, config: DispatchConfig) -> Result<Self, DispatchError> {
        let (commands, inbox) = unbounded();
        let stats = Arc::new(DispatchStats::default());
        let sink_enabled = sink.enabled();
        let flush_interval = config.flush_interval();

        let worker = DispatchLoop {
            state: DispatchState::default(),
            sink,
            stats: Arc::clone(&stats),
            flush_interval,
            max_backoff: config.max_retry_backoff(),
            backoff: flush_interval,
            retry_at: None,
        };
        let handle = thread::Builder::new()
            .name("servo-dispatch".to_string())
            .spawn(move || worker.run(inbox))
            .map_err(DispatchError::Spawn)?;

        info!(
            "Dispatcher started (flush every {:?}, sink enabled: {})",
            flush_interval, sink_enabled
        );

        Ok(Self {
            handle: DispatcherHandle { commands },
            worker: Mutex::new(Some(handle)),
            stats,
            sink_enabled,
        })
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn sink_enabled(&self) -> bool {
        self.sink_enabled
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub fn set_flush_rate(&self, interval: Duration) -> Result<(), DispatchError> {
        self.handle.set_flush_rate(interval)
    }

    /// Writes the all-off line, stops the loop and waits for it to exit.
    /// Later calls are no-ops.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.handle.send(Command::Shutdown);
        if worker.join().is_err() {
            warn!("Dispatcher loop panicked before shutdown");
        }
        info!("Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Registry and pending batch. Only ever touched by the loop thread.
#[derive(Default)]
pub(crate) struct DispatchState {
    registry: HashMap<u32, Arc<dyn OutputSource>>,
    pending: BTreeMap<u32, f64>,
}

impl DispatchState {
    /// Returns `true` when an older source on the same channel was replaced.
    pub(crate) fn subscribe(&mut self, source: Arc<dyn OutputSource>) -> bool {
        self.registry.insert(source.channel(), source).is_some()
    }

    /// Removes `source` if it is the one registered for its channel.
    pub(crate) fn unsubscribe(&mut self, source: &Arc<dyn OutputSource>) -> bool {
        let channel = source.channel();
        match self.registry.get(&channel) {
            Some(current) if Arc::ptr_eq(current, source) => {
                self.registry.remove(&channel);
                self.pending.insert(channel, NEUTRAL_OUTPUT);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn sample(&mut self) -> usize {
        let mut staged = 0;
        for (channel, source) in &self.registry {
            if let Some(value) = source.sample() {
                self.pending.insert(*channel, value);
                staged += 1;
            }
        }
        staged
    }

    pub(crate) fn batch(&self) -> Option<String> {
        format_batch(&self.pending)
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn sample_interval(&self) -> Duration {
        sample_interval(self.registry.len())
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &BTreeMap<u32, f64> {
        &self.pending
    }
}

enum Control {
    Continue,
    ResetSampler,
    ResetFlusher,
    Stop,
}

struct DispatchLoop {
    state: DispatchState,
    sink: Box<dyn CommandSink>,
    stats: Arc<DispatchStats>,
    flush_interval: Duration,
    max_backoff: Duration,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl DispatchLoop {
    fn run(mut self, inbox: Receiver<Command>) {
        let mut sample_every = self.state.sample_interval();
        let mut sampler = tick(sample_every);
        let mut flusher = tick(self.flush_interval);

        loop {
            let control = select! {
                recv(inbox) -> msg => match msg {
                    Ok(command) => self.handle(command),
                    Err(_) => Control::Stop,
                },
                recv(sampler) -> _ => {
                    self.sample();
                    Control::Continue
                },
                recv(flusher) -> _ => {
                    self.flush();
                    Control::Continue
                },
            };

            match control {
                Control::Continue => {}
                Control::ResetSampler => {
                    let next = self.state.sample_interval();
                    if next != sample_every {
                        sample_every = next;
                        sampler = tick(sample_every);
                    }
                }
                Control::ResetFlusher => flusher = tick(self.flush_interval),
                Control::Stop => break,
            }
        }

        self.drain(&inbox);
    }

    fn handle(&mut self, command: Command) -> Control {
        match command {
            Command::Subscribe { source, ack } => {
                let channel = source.channel();
                if self.state.subscribe(source) {
                    warn!("Channel {} re-registered; previous servo replaced", channel);
                } else {
                    debug!("Channel {} registered", channel);
                }
                self.stats.registered.store(self.state.len(), Ordering::Relaxed);
                let _ = ack.send(());
                Control::ResetSampler
            }
            Command::Unsubscribe { source, ack } => {
                if self.state.unsubscribe(&source) {
                    debug!("Channel {} deregistered", source.channel());
                }
                self.stats.registered.store(self.state.len(), Ordering::Relaxed);
                let _ = ack.send(());
                Control::ResetSampler
            }
            Command::SetFlushRate(interval) => {
                self.flush_interval = interval.clamp(MIN_FLUSH_INTERVAL, MAX_FLUSH_INTERVAL);
                self.max_backoff = self.max_backoff.max(self.flush_interval);
                self.backoff = self.flush_interval;
                debug!("Flush interval set to {:?}", self.flush_interval);
                Control::ResetFlusher
            }
            Command::Shutdown => Control::Stop,
        }
    }

    fn sample(&mut self) {
        let staged = self.state.sample();
        if staged > 0 {
            self.stats
                .samples_staged
                .fetch_add(staged as u64, Ordering::Relaxed);
        }
    }

    fn flush(&mut self) {
        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return;
            }
        }
        let Some(line) = self.state.batch() else {
            return;
        };

        match self.sink.write_line(&line) {
            Ok(()) => {
                self.state.clear_pending();
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.retry_at = None;
                self.backoff = self.flush_interval;
            }
            Err(e) => {
                // Pending stays staged for the next attempt.
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!("Flush failed, retrying in {:?}: {}", self.backoff, e);
                self.retry_at = Instant::now().checked_add(self.backoff);
                self.backoff = self.backoff.saturating_mul(2).min(self.max_backoff);
            }
        }
    }

    /// Applies commands still queued, flushes what is pending and turns every channel off.
    fn drain(&mut self, inbox: &Receiver<Command>) {
        while let Ok(command) = inbox.try_recv() {
            if !matches!(command, Command::Shutdown) {
                self.handle(command);
            }
        }
        self.retry_at = None;
        self.flush();
        if let Err(e) = self.sink.write_line(&all_off_line()) {
            warn!("Failed to write all-off line on shutdown: {}", e);
        }
    }
}
