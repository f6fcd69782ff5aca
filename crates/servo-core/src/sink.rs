//! Output sink contract for batched `channel=value` lines.

use crate::error::SinkError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

/// Fractional digits used for every value written to a sink.
pub const VALUE_PRECISION: usize = 6;

/// Channel token meaning "every channel".
pub const WILDCARD_CHANNEL: &str = "*";

/// Destination for batched commands. Only the dispatcher loop writes to it.
pub trait CommandSink: Send {
    /// `false` means writes are discarded. Decided once when the sink is built.
    fn enabled(&self) -> bool;

    /// Writes one newline-terminated line.
    fn write_line(&mut self, line: &str) -> Result<(), SinkError>;
}

/// Formats pending values as `c=v c=v ...\n`, ascending by channel.
/// Returns `None` for an empty batch.
pub fn format_batch(pending: &BTreeMap<u32, f64>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let mut line = String::with_capacity(pending.len() * 12);
    for (i, (channel, value)) in pending.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        // Formatting into a String cannot fail.
        write!(line, "{}={:.*}", channel, VALUE_PRECISION, value).ok();
    }
    line.push('\n');
    Some(line)
}

/// Line that sets every channel to neutral.
pub fn all_off_line() -> String {
    format!("{}={:.*}\n", WILDCARD_CHANNEL, VALUE_PRECISION, 0.0)
}

/// Sink used when no real output is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl CommandSink for DiscardSink {
    fn enabled(&self) -> bool {
        false
    }

    fn write_line(&mut self, _line: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink over any writer; flushes after every line so a FIFO reader sees whole commands.
#[derive(Debug)]
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> CommandSink for WriterSink<W> {
    fn enabled(&self) -> bool {
        true
    }

    fn write_line(&mut self, line: &str) -> Result<(), SinkError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink whose lines stay readable through a cloned handle.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl CommandSink for MemorySink {
    fn enabled(&self) -> bool {
        true
    }

    fn write_line(&mut self, line: &str) -> Result<(), SinkError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}
