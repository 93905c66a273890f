//! Buffered, rate-limited console output.
//!
//! Display characters drained from the device are accumulated here and
//! handed to a [`ConsoleSink`] in chunks, so a program hammering the display
//! register does not hand the front end one notification per character.
//! A sliding-window byte budget additionally caps how much output can be
//! in flight at once; a flush that would exceed the budget is skipped and
//! the bytes stay buffered for a later attempt.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A destination for flushed console output.
///
/// Delivery must not block for long; the engine flushes between instruction
/// cycles.
pub trait ConsoleSink: Send {
    /// Accepts one chunk of console output.
    fn deliver(&mut self, chunk: String);
}

/// Any unbounded channel of strings works as a sink.
impl ConsoleSink for crossbeam_channel::Sender<String> {
    fn deliver(&mut self, chunk: String) {
        // A disconnected receiver just discards output.
        let _ = self.send(chunk);
    }
}

/// Tuning knobs for console flushing.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush as soon as this many bytes are buffered.
    pub flush_bytes: usize,
    /// Flush whatever is buffered once this long has passed since the
    /// last flush.
    pub flush_interval: Duration,
    /// Length of the sliding window for the in-flight budget.
    pub window: Duration,
    /// Maximum bytes delivered within one window. A single oversized chunk
    /// is still delivered when nothing else is in flight.
    pub window_budget: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            flush_bytes: 256,
            flush_interval: Duration::from_millis(20),
            window: Duration::from_millis(100),
            window_budget: 4096,
        }
    }
}

/// The buffering console.
pub struct Console {
    policy: FlushPolicy,
    buf: Vec<u8>,
    sink: Option<Box<dyn ConsoleSink>>,
    last_flush: Instant,
    window: VecDeque<(Instant, usize)>,
}

impl Console {
    /// Creates a console with no sink attached. Output accumulates until a
    /// sink is set.
    pub fn new(policy: FlushPolicy) -> Self {
        Console {
            policy,
            buf: Vec::new(),
            sink: None,
            last_flush: Instant::now(),
            window: VecDeque::new(),
        }
    }

    /// Attaches the sink that flushed chunks are delivered to.
    pub fn set_sink(&mut self, sink: Box<dyn ConsoleSink>) {
        self.sink = Some(sink);
    }

    /// Swaps the flush tuning. The sink, buffered bytes, and in-flight
    /// window are untouched; the new thresholds apply from the next flush.
    pub fn set_policy(&mut self, policy: FlushPolicy) {
        self.policy = policy;
    }

    /// Buffers one output byte.
    pub fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Bytes currently buffered and not yet delivered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Flushes if either threshold (byte count or interval) has been reached.
    ///
    /// Called once per instruction cycle.
    pub fn tick(&mut self) {
        let now = Instant::now();
        if self.buf.len() >= self.policy.flush_bytes
            || now.duration_since(self.last_flush) >= self.policy.flush_interval
        {
            self.try_flush(now);
        }
    }

    /// Flushes anything buffered, subject to the in-flight budget.
    ///
    /// Called at the end of every run-control operation so output never sits
    /// in the buffer while the machine is paused.
    pub fn flush(&mut self) {
        self.try_flush(Instant::now());
    }

    fn try_flush(&mut self, now: Instant) {
        let Some(sink) = self.sink.as_mut() else { return };
        if self.buf.is_empty() {
            self.last_flush = now;
            return;
        }

        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) >= self.policy.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
        let inflight: usize = self.window.iter().map(|&(_, len)| len).sum();
        // Budget check. An idle window always admits the chunk, so a single
        // burst larger than the budget still gets out.
        if inflight > 0 && inflight + self.buf.len() > self.policy.window_budget {
            return;
        }

        let chunk = String::from_utf8_lossy(&self.buf).into_owned();
        self.window.push_back((now, self.buf.len()));
        self.buf.clear();
        self.last_flush = now;
        sink.deliver(chunk);
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("policy", &self.policy)
            .field("buffered", &self.buf.len())
            .field("sink", &self.sink.as_ref().map(|_| ".."))
            .finish()
    }
}
