//! Chrome trace recorder for job execution spans.
//!
//! Each executing thread appends spans to a thread-local buffer; buffers are
//! handed to a global list when the thread calls [`collect_local_trace`]
//! (workers do so on exit). The result loads in chrome://tracing or
//! ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One completed span.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: &'static str,
    pub tid: usize,
    pub start_us: u64,
    pub duration_us: u64,
}

thread_local! {
    static LOCAL_EVENTS: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
}

lazy_static::lazy_static! {
    static ref TRACE_START: Instant = Instant::now();
    static ref COLLECTED: Mutex<Vec<TraceEvent>> = Mutex::new(Vec::new());
}

/// Records a span on the current thread.
pub fn record_event(name: &'static str, tid: usize, start: Instant, duration: Duration) {
    let event = TraceEvent {
        name,
        tid,
        start_us: start.saturating_duration_since(*TRACE_START).as_micros() as u64,
        duration_us: duration.as_micros() as u64,
    };
    LOCAL_EVENTS.with(|events| events.borrow_mut().push(event));
}

/// Moves the current thread's spans to the global list.
pub fn collect_local_trace() {
    let local = LOCAL_EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()));
    if local.is_empty() {
        return;
    }
    match COLLECTED.lock() {
        Ok(mut collected) => collected.extend(local),
        Err(_) => log::error!("trace buffer poisoned; dropping {} spans", local.len()),
    }
}

/// Number of spans collected so far.
pub fn collected_len() -> usize {
    COLLECTED.lock().map(|c| c.len()).unwrap_or(0)
}

/// Writes every collected span as a chrome trace JSON array.
pub fn export_to_file(path: &Path) -> std::io::Result<()> {
    collect_local_trace();
    let mut writer = BufWriter::new(File::create(path)?);
    let collected = COLLECTED
        .lock()
        .map_err(|_| std::io::Error::other("trace buffer poisoned"))?;

    writeln!(writer, "[")?;
    for (i, event) in collected.iter().enumerate() {
        let sep = if i + 1 == collected.len() { "" } else { "," };
        writeln!(
            writer,
            "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}{}",
            event.name, event.start_us, event.duration_us, event.tid, sep
        )?;
    }
    writeln!(writer, "]")?;
    writer.flush()
}

/// Records a span from construction to drop.
pub struct TraceGuard {
    name: &'static str,
    tid: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, tid: usize) -> Self {
        TraceGuard {
            name,
            tid,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_event(self.name, self.tid, self.start, self.start.elapsed());
    }
}

/// Collects the local trace when dropped. Held by worker threads.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}
