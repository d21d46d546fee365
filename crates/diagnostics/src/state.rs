use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::buffer::DiagnosticsBuffer;
use crate::{DiagArg, DiagRecord, DiagSite, DiagType, DiagValue, LogLevel};

/// Maximum number of handlers that can be registered.
pub const MAX_HANDLERS: usize = 16;

/// A drain for diagnostic records. Returning true stops propagation to
/// handlers lower in the stack.
pub type DiagHandler = dyn Fn(&DiagSite, &DiagRecord, &[u8]) -> bool + Send + Sync;

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Record ring capacity; a power of two.
    pub capacity: u32,
    /// Variable-data ring capacity in bytes; a power of two.
    pub var_capacity: usize,
    /// Push the default handler that forwards log records to `tracing`.
    pub tracing_handler: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            var_capacity: 1 << 20,
            tracing_handler: true,
        }
    }
}

/// Process-wide diagnostics: the ring, the handler stack and the consumer
/// thread that connects them.
pub struct Diagnostics {
    buffer: Arc<DiagnosticsBuffer>,
    handlers: Arc<Mutex<Vec<Arc<DiagHandler>>>>,
    consumer: Option<JoinHandle<()>>,
}

static GLOBAL: Mutex<Option<Arc<Diagnostics>>> = Mutex::new(None);

static SHUTDOWN_SITE: DiagSite = DiagSite {
    diag_type: DiagType::Shutdown,
    file: file!(),
    line: 0,
    level: LogLevel::None,
    message: "shutdown",
    value_kind: DiagArg::None,
};

/// Initializes the process-wide diagnostics state and starts the consumer
/// thread. Returns false when already initialized.
pub fn initialize(config: DiagnosticsConfig) -> bool {
    let mut global = GLOBAL.lock().expect("diagnostics state poisoned");
    if global.is_some() {
        return false;
    }

    let buffer = Arc::new(DiagnosticsBuffer::new(config.capacity, config.var_capacity));
    let handlers: Arc<Mutex<Vec<Arc<DiagHandler>>>> = Arc::new(Mutex::new(Vec::new()));
    if config.tracing_handler {
        handlers
            .lock()
            .expect("handler stack poisoned")
            .push(Arc::new(tracing_handler));
    }

    let consumer = {
        let buffer = Arc::clone(&buffer);
        let handlers = Arc::clone(&handlers);
        std::thread::Builder::new()
            .name("lcevc-diagnostics".into())
            .spawn(move || consume(&buffer, &handlers))
            .expect("failed to spawn diagnostics consumer")
    };

    *global = Some(Arc::new(Diagnostics {
        buffer,
        handlers,
        consumer: Some(consumer),
    }));
    true
}

/// Drains the ring and tears the global state down again.
pub fn release() {
    let state = {
        let mut global = GLOBAL.lock().expect("diagnostics state poisoned");
        global.take()
    };

    let Some(state) = state else { return };
    state.buffer.push(
        &DiagRecord {
            site: &SHUTDOWN_SITE,
            timestamp_ns: timestamp_ns(),
            thread_id: current_thread_id(),
            size: 0,
            value: DiagValue::default(),
        },
        &[],
    );

    // All other references are emit-side clones that have already dropped by
    // the time release is called in an orderly shutdown; if not, the consumer
    // still exits and later emits fall through to nothing.
    if let Some(state) = Arc::into_inner(state) {
        if let Some(consumer) = state.consumer {
            consumer.join().expect("diagnostics consumer panicked");
        }
    }
}

/// Pushes a handler onto the stack. Fails when the stack is full.
pub fn handler_push(handler: Arc<DiagHandler>) -> bool {
    let global = GLOBAL.lock().expect("diagnostics state poisoned");
    let Some(state) = global.as_ref() else {
        return false;
    };
    let mut handlers = state.handlers.lock().expect("handler stack poisoned");
    if handlers.len() >= MAX_HANDLERS {
        return false;
    }
    handlers.push(handler);
    true
}

/// Pops the most recently pushed handler.
pub fn handler_pop() -> bool {
    let global = GLOBAL.lock().expect("diagnostics state poisoned");
    let Some(state) = global.as_ref() else {
        return false;
    };
    state
        .handlers
        .lock()
        .expect("handler stack poisoned")
        .pop()
        .is_some()
}

/// Emit entry point used by the macros. A no-op until [`initialize`] runs.
pub fn emit(site: &'static DiagSite, value: DiagValue, payload: &[u8]) {
    let state = {
        let global = GLOBAL.lock().expect("diagnostics state poisoned");
        global.as_ref().map(Arc::clone)
    };
    let Some(state) = state else { return };

    state.buffer.push(
        &DiagRecord {
            site,
            timestamp_ns: timestamp_ns(),
            thread_id: current_thread_id(),
            size: payload.len() as u32,
            value,
        },
        payload,
    );
}

/// Nanoseconds on the process monotonic clock.
pub fn timestamp_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Small dense id for the calling thread.
pub fn current_thread_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

fn consume(buffer: &DiagnosticsBuffer, handlers: &Mutex<Vec<Arc<DiagHandler>>>) {
    let mut payload = vec![0u8; 64 * 1024];
    loop {
        let popped = buffer.pop(&mut payload);
        if popped.record.site.diag_type == DiagType::Shutdown {
            return;
        }

        let snapshot: Vec<_> = {
            let handlers = handlers.lock().expect("handler stack poisoned");
            handlers.iter().rev().map(Arc::clone).collect()
        };
        for handler in snapshot {
            if handler(
                popped.record.site,
                &popped.record,
                &payload[..popped.payload_len],
            ) {
                break;
            }
        }
    }
}

/// Default handler: forwards log records to `tracing` events.
fn tracing_handler(site: &DiagSite, record: &DiagRecord, payload: &[u8]) -> bool {
    match site.diag_type {
        DiagType::Log | DiagType::LogFormatted => {
            let message: &str = if payload.is_empty() {
                site.message
            } else {
                std::str::from_utf8(payload).unwrap_or(site.message)
            };
            match site.level {
                LogLevel::Fatal | LogLevel::Error => {
                    tracing::error!(file = site.file, line = site.line, "{message}");
                }
                LogLevel::Warning => {
                    tracing::warn!(file = site.file, line = site.line, "{message}");
                }
                LogLevel::Info => {
                    tracing::info!(file = site.file, line = site.line, "{message}");
                }
                LogLevel::Debug | LogLevel::Verbose => {
                    tracing::debug!(file = site.file, line = site.line, "{message}");
                }
                LogLevel::None => {}
            }
        }
        DiagType::Metric => {
            tracing::debug!(metric = site.message, value = record.value.as_i64(), "metric");
        }
        _ => {}
    }
    false
}
